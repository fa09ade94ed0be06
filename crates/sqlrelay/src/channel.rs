// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffered byte stream with an optional TLS layer.
//!
//! A [`Channel`] is one side of a routed connection: the client-facing or
//! the server-facing socket together with
//!
//! - a plaintext receive view filled from the socket (decrypted when a TLS
//!   session is present),
//! - a send buffer holding bytes ready for the socket (ciphertext when a
//!   TLS session is present),
//! - the TLS session itself, when this leg terminates TLS,
//! - a passthrough marker for routes that forward TLS records undecrypted.
//!
//! All socket I/O is non-blocking; `WouldBlock` surfaces to the caller which
//! then parks the connection on the reactor until the socket is ready again.
//!
//! # Buffer flow
//!
//! ```text
//!           read_to_plain()                       write()
//!  socket ----------------> [tls] --> recv_plain        plaintext
//!                                                          |
//!  socket <---- send_buf <---------------- [tls] <---------+
//!        flush_to_socket()     flush_to_send_buf()
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use mio::{Interest, Registry, Token};

use crate::tls::{TlsResult, TlsSession};

// ============================================================================
// ByteStream
// ============================================================================

/// Abstraction over the raw, non-blocking socket under a [`Channel`].
///
/// Implemented for `mio::net::TcpStream` and for the test mock.
pub trait ByteStream: Read + Write + Send {
    /// Shutdown the stream.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Local address of this stream.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Peer address of this stream.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Set TCP_NODELAY (disable Nagle's algorithm).
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;

    /// Take a pending error from the socket.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// Register with the reactor.
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest)
        -> io::Result<()>;

    /// Change the registered interests.
    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()>;

    /// Remove from the reactor.
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
}

impl ByteStream for mio::net::TcpStream {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        mio::net::TcpStream::set_nodelay(self, nodelay)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        registry.register(self, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        registry.reregister(self, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(self)
    }
}

/// Boxed stream as stored by a [`Channel`].
pub type BoxedByteStream = Box<dyn ByteStream>;

// ============================================================================
// Flush result
// ============================================================================

/// Result of flushing the send buffer to the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushResult {
    /// All buffered bytes were written.
    Complete,

    /// The socket would block; bytes remain buffered.
    WouldBlock,

    /// Nothing was buffered.
    Empty,
}

// ============================================================================
// Channel
// ============================================================================

/// One leg of a routed connection. See the module docs for the buffer flow.
pub struct Channel {
    /// Raw non-blocking socket.
    stream: BoxedByteStream,

    /// Plaintext receive view (decrypted when `tls` is present).
    recv_plain: Vec<u8>,

    /// Read position into `recv_plain`; compacted lazily.
    recv_pos: usize,

    /// Bytes ready for the socket (ciphertext when `tls` is present).
    send_buf: Vec<u8>,

    /// Write position into `send_buf` for partial socket writes.
    send_pos: usize,

    /// TLS session when this leg terminates TLS.
    tls: Option<TlsSession>,

    /// Passthrough marker: payload is TLS records that are delimited but
    /// not decrypted.
    is_tls: bool,

    /// Read chunk size (the route's net_buffer_length).
    read_chunk: usize,
}

impl Channel {
    pub fn new(stream: BoxedByteStream, read_chunk: usize) -> Self {
        Self {
            stream,
            recv_plain: Vec::with_capacity(read_chunk),
            recv_pos: 0,
            send_buf: Vec::with_capacity(read_chunk),
            send_pos: 0,
            tls: None,
            is_tls: false,
            read_chunk,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn stream(&self) -> &dyn ByteStream {
        &*self.stream
    }

    pub fn stream_mut(&mut self) -> &mut dyn ByteStream {
        &mut *self.stream
    }

    /// The plaintext bytes received and not yet consumed.
    pub fn recv_plain_view(&self) -> &[u8] {
        &self.recv_plain[self.recv_pos..]
    }

    /// The bytes queued for the socket and not yet written.
    pub fn send_buffer(&self) -> &[u8] {
        &self.send_buf[self.send_pos..]
    }

    /// Whether a local TLS session exists on this leg.
    pub fn has_tls_session(&self) -> bool {
        self.tls.is_some()
    }

    /// Whether the local TLS handshake has completed.
    pub fn tls_init_is_finished(&self) -> bool {
        match &self.tls {
            Some(sess) => !sess.is_handshaking(),
            None => false,
        }
    }

    /// Passthrough marker. With no local session, a channel marked `is_tls`
    /// carries raw TLS records.
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// Mark or unmark the channel as carrying TLS traffic.
    pub fn set_is_tls(&mut self, is_tls: bool) {
        self.is_tls = is_tls;
    }

    // ========================================================================
    // Plaintext receive path
    // ========================================================================

    /// Consume `n` bytes from the front of the plaintext receive view.
    pub fn consume_plain(&mut self, n: usize) {
        debug_assert!(n <= self.recv_plain.len() - self.recv_pos);
        self.recv_pos += n;

        // compact once more than half the buffer is dead
        if self.recv_pos > 0 && self.recv_pos > self.recv_plain.len() / 2 {
            self.recv_plain.drain(..self.recv_pos);
            self.recv_pos = 0;
        }
    }

    /// Ensure the plaintext receive view grows by at least `n` bytes when
    /// the socket has them, running the TLS engine as needed.
    ///
    /// The socket is drained completely: readiness is edge-triggered, so
    /// bytes left in the kernel buffer would never produce another wakeup.
    /// Returns the number of bytes added, possibly 0 when the socket would
    /// block before `n` arrived; the caller checks the view size and
    /// suspends on the reactor when it still lacks data. A peer close
    /// surfaces as `UnexpectedEof`.
    pub fn read_to_plain(&mut self, n: usize) -> io::Result<usize> {
        self.recv_plain.reserve(n);

        if self.tls.is_some() {
            self.read_to_plain_tls()
        } else {
            self.read_to_plain_raw()
        }
    }

    fn read_to_plain_raw(&mut self) -> io::Result<usize> {
        let mut added = 0usize;
        let mut chunk = vec![0u8; self.read_chunk.max(1)];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if added > 0 {
                        break;
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    ));
                }
                Ok(got) => {
                    self.recv_plain.extend_from_slice(&chunk[..got]);
                    added += got;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(added)
    }

    fn read_to_plain_tls(&mut self) -> io::Result<usize> {
        let Channel {
            tls,
            stream,
            recv_plain,
            ..
        } = self;
        let sess = tls.as_mut().expect("tls session present");

        let mut added = drain_tls_plaintext(sess, recv_plain)?;

        loop {
            match sess.read_tls(&mut **stream) {
                Ok(0) => {
                    if added > 0 {
                        break;
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    ));
                }
                Ok(_) => {
                    sess.process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    added += drain_tls_plaintext(sess, recv_plain)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(added)
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Append plaintext to the send side, through TLS when present.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tls.as_mut() {
            Some(sess) => sess.write_plaintext(buf),
            None => {
                self.send_buf.extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    /// Append bytes to the send buffer bypassing the TLS layer.
    ///
    /// Used for frames that must reach the peer before (or without) any TLS
    /// session, e.g. error packets during the cleartext handshake phase.
    pub fn write_plain(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Move ciphertext produced by the TLS session into the send buffer.
    /// No-op without a session.
    pub fn flush_to_send_buf(&mut self) -> io::Result<usize> {
        let Channel { tls, send_buf, .. } = self;
        let sess = match tls.as_mut() {
            Some(s) => s,
            None => return Ok(0),
        };

        let mut moved = 0usize;
        while sess.wants_write() {
            moved += sess.write_tls(send_buf)?;
        }

        Ok(moved)
    }

    /// Pull ciphertext from the socket into the TLS session. No-op without
    /// a session; `WouldBlock` maps to 0 bytes moved.
    pub fn flush_from_recv_buf(&mut self) -> io::Result<usize> {
        let Channel { tls, stream, .. } = self;
        let sess = match tls.as_mut() {
            Some(s) => s,
            None => return Ok(0),
        };

        match sess.read_tls(&mut **stream) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )),
            Ok(moved) => {
                sess.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                Ok(moved)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Write the send buffer to the socket.
    pub fn flush_to_socket(&mut self) -> io::Result<FlushResult> {
        if self.send_pos >= self.send_buf.len() {
            return Ok(FlushResult::Empty);
        }

        while self.send_pos < self.send_buf.len() {
            match self.stream.write(&self.send_buf[self.send_pos..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed",
                    ));
                }
                Ok(n) => self.send_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushResult::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.send_buf.clear();
        self.send_pos = 0;
        let _ = self.stream.flush();

        Ok(FlushResult::Complete)
    }

    // ========================================================================
    // TLS state machine
    // ========================================================================

    /// Install a server-side TLS session (client-facing leg).
    pub fn init_tls_accept(&mut self, config: Arc<rustls::ServerConfig>) -> io::Result<()> {
        self.tls = Some(TlsSession::accept(config)?);
        self.is_tls = true;
        Ok(())
    }

    /// Install a client-side TLS session (server-facing leg).
    pub fn init_tls_connect(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> io::Result<()> {
        self.tls = Some(TlsSession::connect(config, server_name)?);
        self.is_tls = true;
        Ok(())
    }

    /// Drive the server-side handshake one step.
    pub fn tls_accept(&mut self) -> io::Result<TlsResult> {
        self.tls_handshake_step()
    }

    /// Drive the client-side handshake one step.
    pub fn tls_connect(&mut self) -> io::Result<TlsResult> {
        self.tls_handshake_step()
    }

    fn tls_handshake_step(&mut self) -> io::Result<TlsResult> {
        let Channel {
            tls,
            stream,
            send_buf,
            send_pos,
            ..
        } = self;
        let sess = tls
            .as_mut()
            .ok_or_else(|| io::Error::other("no TLS session on channel"))?;

        loop {
            // move queued handshake bytes towards the peer first
            while sess.wants_write() {
                sess.write_tls(send_buf)?;
            }

            if !sess.is_handshaking() {
                break;
            }

            if !sess.wants_read() {
                // handshake output is pending in the send buffer
                return Ok(TlsResult::WantWrite);
            }

            match sess.read_tls(&mut **stream) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during TLS handshake",
                    ));
                }
                Ok(_) => {
                    sess.process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    while sess.wants_write() {
                        sess.write_tls(send_buf)?;
                    }
                    if *send_pos < send_buf.len() {
                        return Ok(TlsResult::WantWrite);
                    }
                    return Ok(TlsResult::WantRead);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(TlsResult::Finished)
    }

    /// Queue the TLS close-notify. Best effort; the socket close follows.
    pub fn tls_shutdown(&mut self) {
        if let Some(sess) = self.tls.as_mut() {
            sess.send_close_notify();
            let _ = self.flush_to_send_buf();
        }
    }
}

/// Move decrypted plaintext out of a TLS session into the receive view.
fn drain_tls_plaintext(sess: &mut TlsSession, recv_plain: &mut Vec<u8>) -> io::Result<usize> {
    let mut moved = 0usize;
    let mut chunk = [0u8; 4096];
    loop {
        match sess.read_plaintext(&mut chunk) {
            Ok(0) => break,
            Ok(got) => {
                recv_plain.extend_from_slice(&chunk[..got]);
                moved += got;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    Ok(moved)
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("recv_plain", &(self.recv_plain.len() - self.recv_pos))
            .field("send_buf", &(self.send_buf.len() - self.send_pos))
            .field("tls", &self.tls.is_some())
            .field("is_tls", &self.is_tls)
            .finish()
    }
}

// ============================================================================
// Test mock stream
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
