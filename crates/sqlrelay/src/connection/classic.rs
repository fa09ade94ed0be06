// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Classic-protocol per-connection state machine.
//!
//! Drives one client connection: greeting, handshake forwarding with
//! sequence tracking, backend selection, and the opaque relay that follows
//! a completed handshake.
//!
//! ```text
//!  accept
//!    |                       source_ssl_mode == PASSTHROUGH
//!    +-- SendRouterGreeting ----------------- Connect
//!    |        |                                  |
//!    v        v                                  v
//!  ClientRecvResponse <--- SendGreetingToClient  ServerRecvGreeting
//!    |   (track seq, caps)
//!    v
//!  [Connect if no server yet] -> ServerRecvGreeting (discard)
//!    |
//!    v
//!  SendResponseToServer -> ServerRecvReply -> SendReplyToClient
//!                                |                  |
//!                       (handshake done?)           v
//!                                +------------->  Relay  -> Finish -> Done
//! ```
//!
//! During the handshake every frame must carry the successor sequence id;
//! a mismatch aborts the connection without forwarding. A handshake is done
//! once a frame with seq 2 was seen, once the server answered with an error
//! packet, or once the client's capabilities carry the SSL bit (the
//! connection then continues as an opaque TLS exchange).

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use crate::channel::{Channel, FlushResult};
use crate::connection::{ConnectionHandle, IoWant, RunResult};
use crate::connector::{ConnectStep, Connector};
use crate::context::{client_ip_key, RoutingContext};
use crate::destination::DestinationProvider;
use crate::protocol::classic::{
    self, classify_response, decode_frame_header, encode_error_packet, encode_fake_login_packet,
    ClassicProtocolState, ResponseKind, FRAME_HEADER_SIZE,
};
use crate::routing::SslMode;

// ============================================================================
// Functions
// ============================================================================

/// Next-step identifiers; each one performs one I/O request and returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Function {
    /// Synthesize and send the router's server greeting.
    SendRouterGreeting,

    /// Drive the connector towards a backend.
    Connect,

    /// Receive the real server greeting; forward or discard it.
    ServerRecvGreeting,

    /// Flush the greeting to the client.
    SendGreetingToClient,

    /// Receive one client handshake frame.
    ClientRecvResponse,

    /// Flush the client's frame to the server.
    SendResponseToServer,

    /// Receive one server handshake frame.
    ServerRecvReply,

    /// Flush the server's frame to the client.
    SendReplyToClient,

    /// Opaque bidirectional forwarding after the handshake.
    Relay,

    /// Teardown.
    Finish,
}

/// What a single step decided.
enum Step {
    Next(Function),
    Suspend(IoWant),
    Done,
}

/// Which timer is armed while suspended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeadlineKind {
    ClientHandshake,
    Connect,
    Idle,
}

// ============================================================================
// Connection
// ============================================================================

/// One routed classic-protocol connection.
pub struct ClassicConnection {
    context: Arc<RoutingContext>,
    provider: Arc<dyn DestinationProvider>,
    handle: Arc<ConnectionHandle>,

    client: Channel,
    server: Option<Channel>,

    protocol: ClassicProtocolState,

    connector: Option<Connector>,
    /// Registration serial of the server-side socket (see `server_io`).
    server_io_serial: u64,

    func: Function,
    deadline: Option<(Instant, DeadlineKind)>,

    /// The client sent a complete handshake frame that still has to reach
    /// the server (greet-on-behalf connects after the response arrived).
    pending_client_frame: Option<Vec<u8>>,

    /// Counted this connection's handshake failure already.
    failure_counted: bool,
}

impl ClassicConnection {
    pub fn new(
        context: Arc<RoutingContext>,
        provider: Arc<dyn DestinationProvider>,
        handle: Arc<ConnectionHandle>,
        client: Channel,
    ) -> Self {
        let greeting_from_router = context.source_ssl_mode() != SslMode::Passthrough;

        let func = if greeting_from_router {
            Function::SendRouterGreeting
        } else {
            Function::Connect
        };

        let deadline = Some((
            Instant::now() + context.client_connect_timeout(),
            DeadlineKind::ClientHandshake,
        ));

        context.increase_info_active_routes();
        context.increase_info_handled_routes();

        Self {
            context,
            provider,
            handle,
            client,
            server: None,
            protocol: ClassicProtocolState::new(),
            connector: None,
            server_io_serial: 0,
            func,
            deadline,
            pending_client_frame: None,
            failure_counted: false,
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// The earliest pending deadline, for the reactor's timeout sweep.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    /// Client-side socket, for reactor registration.
    pub fn client_stream_mut(&mut self) -> &mut dyn crate::channel::ByteStream {
        self.client.stream_mut()
    }

    /// Server-side socket (pending connect or established) plus a serial
    /// that changes whenever the underlying fd changes.
    pub fn server_io(&mut self) -> Option<(&mut dyn crate::channel::ByteStream, u64)> {
        if let Some(connector) = &mut self.connector {
            let attempt = connector.attempt();
            if let Some(stream) = connector.pending_socket() {
                return Some((stream, attempt));
            }
        }

        match &mut self.server {
            Some(channel) => {
                let serial = self.server_io_serial;
                Some((channel.stream_mut(), serial))
            }
            None => None,
        }
    }

    /// Fire the armed deadline: connect timeouts advance the connector,
    /// everything else tears the connection down.
    pub fn on_deadline(&mut self) -> RunResult {
        let kind = match self.deadline.take() {
            Some((_, kind)) => kind,
            None => return RunResult::Suspend(IoWant::RecvClient),
        };

        match kind {
            DeadlineKind::Connect => {
                if let Some(connector) = &mut self.connector {
                    connector.set_connect_timed_out(true);
                }
            }
            DeadlineKind::ClientHandshake => {
                log::info!(
                    "[{}] client {} did not finish the handshake in time",
                    self.context.name(),
                    self.handle.client_address()
                );
                self.count_handshake_failure();
                self.func = Function::Finish;
            }
            DeadlineKind::Idle => {
                log::info!(
                    "[{}] client {} was idle too long, disconnecting",
                    self.context.name(),
                    self.handle.client_address()
                );
                self.func = Function::Finish;
            }
        }

        self.resume()
    }

    /// Run until the machine suspends or finishes.
    pub fn resume(&mut self) -> RunResult {
        loop {
            if self.handle.disconnect_requested() && self.func != Function::Finish {
                self.func = Function::Finish;
            }

            let step = match self.func {
                Function::SendRouterGreeting => self.send_router_greeting(),
                Function::Connect => self.connect(),
                Function::ServerRecvGreeting => self.server_recv_greeting(),
                Function::SendGreetingToClient => self.send_greeting_to_client(),
                Function::ClientRecvResponse => self.client_recv_response(),
                Function::SendResponseToServer => self.send_response_to_server(),
                Function::ServerRecvReply => self.server_recv_reply(),
                Function::SendReplyToClient => self.send_reply_to_client(),
                Function::Relay => self.relay(),
                Function::Finish => self.finish(),
            };

            match step {
                Step::Next(next) => self.func = next,
                Step::Suspend(want) => return RunResult::Suspend(want),
                Step::Done => return RunResult::Done,
            }
        }
    }

    // ========================================================================
    // Greeting
    // ========================================================================

    fn send_router_greeting(&mut self) -> Step {
        if self.client.send_buffer().is_empty() && self.protocol.seq_id == 0 {
            let advertise_tls = self.context.source_ssl_mode() != SslMode::Disabled;
            let greeting = build_server_greeting(self.handle.id().0, advertise_tls);

            if self.client.write_plain(&greeting).is_err() {
                return Step::Next(Function::Finish);
            }
        }

        match self.client.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => Step::Suspend(IoWant::SendClient),
            Ok(_) => Step::Next(Function::ClientRecvResponse),
            Err(e) => self.client_failed(&e),
        }
    }

    // ========================================================================
    // Connect
    // ========================================================================

    fn connect(&mut self) -> Step {
        if self.connector.is_none() {
            self.connector = Some(Connector::new(self.provider.clone()));
        }

        let connector = self.connector.as_mut().expect("connector created above");

        match connector.connect() {
            Ok(ConnectStep::Done(connected)) => {
                self.server_io_serial = connector.attempt();

                // the client handshake clock keeps running until the
                // handshake is complete
                self.deadline = if self.protocol.handshake_done {
                    None
                } else {
                    Some((
                        Instant::now() + self.context.client_connect_timeout(),
                        DeadlineKind::ClientHandshake,
                    ))
                };

                self.handle.set_server_address(connected.destination.clone());
                log::debug!(
                    "[{}] connected {} -> {}",
                    self.context.name(),
                    self.handle.client_address(),
                    connected.destination_id
                );

                self.server = Some(Channel::new(
                    Box::new(connected.stream),
                    self.context.net_buffer_length(),
                ));
                self.connector = None;

                Step::Next(Function::ServerRecvGreeting)
            }
            Ok(ConnectStep::InProgress) => {
                self.deadline = Some((
                    Instant::now() + self.context.destination_connect_timeout(),
                    DeadlineKind::Connect,
                ));
                Step::Suspend(IoWant::Connect)
            }
            Err(e) => {
                log::warn!("[{}] connecting to backend failed: {}", self.context.name(), e);
                super::react_to_connect_error(&self.context, &*self.provider, &e);

                let error = encode_error_packet(
                    0,
                    classic::ERROR_CONNECTING_TO_BACKEND,
                    "connecting to backend failed",
                    "HY000",
                );
                let _ = self.client.write_plain(&error);

                match self.client.flush_to_socket() {
                    Ok(FlushResult::WouldBlock) => {
                        self.func = Function::Finish;
                        Step::Suspend(IoWant::SendClient)
                    }
                    _ => Step::Next(Function::Finish),
                }
            }
        }
    }

    // ========================================================================
    // Handshake forwarding
    // ========================================================================

    /// Pull one complete frame off a channel. `Ok(None)` means more bytes
    /// are needed.
    fn read_full_frame(channel: &mut Channel) -> io::Result<Option<Vec<u8>>> {
        loop {
            let header = decode_frame_header(channel.recv_plain_view());
            let buffered = channel.recv_plain_view().len();

            match header {
                Some(header) => {
                    let frame_len = FRAME_HEADER_SIZE + header.payload_len;
                    if buffered >= frame_len {
                        let frame = channel.recv_plain_view()[..frame_len].to_vec();
                        channel.consume_plain(frame_len);
                        return Ok(Some(frame));
                    }

                    if channel.read_to_plain(frame_len - buffered)? == 0 {
                        return Ok(None);
                    }
                }
                None => {
                    if channel.read_to_plain(FRAME_HEADER_SIZE - buffered)? == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn server_recv_greeting(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        let frame = match Self::read_full_frame(server) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Step::Suspend(IoWant::RecvServer),
            Err(e) => return self.server_failed(&e),
        };

        self.handle.stats().add_down(frame.len() as u64);

        if self.pending_client_frame.is_some() {
            // the router already greeted; swallow the real greeting and
            // forward the buffered client response
            let pending = self.pending_client_frame.take().expect("checked above");
            let server = self.server.as_mut().expect("server connected");
            if let Err(e) = server.write(&pending) {
                return self.server_failed(&e);
            }
            self.handle.stats().add_up(pending.len() as u64);
            return Step::Next(Function::SendResponseToServer);
        }

        // passthrough: the greeting opens the sequence
        if let Err(step) = self.track_frame(&frame, true) {
            return step;
        }

        if self.client.write(&frame).is_err() {
            return Step::Next(Function::Finish);
        }

        Step::Next(Function::SendGreetingToClient)
    }

    fn send_greeting_to_client(&mut self) -> Step {
        match self.client.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => Step::Suspend(IoWant::SendClient),
            Ok(_) => Step::Next(Function::ClientRecvResponse),
            Err(e) => self.client_failed(&e),
        }
    }

    fn client_recv_response(&mut self) -> Step {
        let frame = match Self::read_full_frame(&mut self.client) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Step::Suspend(IoWant::RecvClient),
            Err(e) => return self.client_failed(&e),
        };

        if let Err(step) = self.track_frame(&frame, false) {
            return step;
        }

        match self.server.as_mut() {
            Some(server) => {
                if let Err(e) = server.write(&frame) {
                    return self.server_failed(&e);
                }
                self.handle.stats().add_up(frame.len() as u64);
                Step::Next(Function::SendResponseToServer)
            }
            None => {
                // greet-on-behalf: now that the client responded, pick a
                // backend; the frame follows once the greeting was consumed
                self.pending_client_frame = Some(frame);
                Step::Next(Function::Connect)
            }
        }
    }

    fn send_response_to_server(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        match server.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => Step::Suspend(IoWant::SendServer),
            Ok(_) => {
                if self.protocol.handshake_done {
                    Step::Next(Function::Relay)
                } else {
                    Step::Next(Function::ServerRecvReply)
                }
            }
            Err(e) => self.server_failed(&e),
        }
    }

    fn server_recv_reply(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        let frame = match Self::read_full_frame(server) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Step::Suspend(IoWant::RecvServer),
            Err(e) => return self.server_failed(&e),
        };

        if let Err(step) = self.track_frame(&frame, true) {
            return step;
        }

        if self.client.write(&frame).is_err() {
            return Step::Next(Function::Finish);
        }
        self.handle.stats().add_down(frame.len() as u64);

        Step::Next(Function::SendReplyToClient)
    }

    fn send_reply_to_client(&mut self) -> Step {
        match self.client.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => Step::Suspend(IoWant::SendClient),
            Ok(_) => {
                if self.protocol.handshake_done {
                    Step::Next(Function::Relay)
                } else {
                    Step::Next(Function::ClientRecvResponse)
                }
            }
            Err(e) => self.client_failed(&e),
        }
    }

    /// Handshake bookkeeping for one complete frame.
    ///
    /// `Err` carries the step to take instead of forwarding.
    fn track_frame(&mut self, frame: &[u8], from_server: bool) -> Result<(), Step> {
        if self.protocol.handshake_done {
            return Ok(());
        }

        let header = decode_frame_header(frame).expect("full frame");
        let mut seq_id = header.seq_id;

        if self.protocol.seq_id > 0 && seq_id != self.protocol.seq_id.wrapping_add(1) {
            log::debug!(
                "[{}] received incorrect packet number; aborting (was {})",
                self.context.name(),
                seq_id
            );
            self.count_handshake_failure();
            return Err(Step::Next(Function::Finish));
        }

        if from_server && frame.len() > FRAME_HEADER_SIZE {
            if classify_response(frame[FRAME_HEADER_SIZE]) == ResponseKind::Error {
                // an error from the server while handshaking is forwarded
                // unchanged; this is not a failed handshake
                self.handshake_completed();
                self.protocol.seq_id = 2;
                return Ok(());
            }
        }

        if !from_server && seq_id == 1 {
            // the handshake response carries the client's capabilities
            if let Some(caps) = classic::handshake_response_capabilities(frame) {
                self.protocol.capabilities = caps;
            }

            if self.protocol.wants_tls() {
                // client switches to TLS: no further inspection possible
                seq_id = 2;
            }
        }

        self.protocol.seq_id = seq_id;

        if seq_id == 2 {
            self.handshake_completed();
        }

        Ok(())
    }

    fn handshake_completed(&mut self) {
        self.protocol.handshake_done = true;
        self.deadline = None;

        if !self.context.wait_timeout().is_zero() {
            self.deadline = Some((
                Instant::now() + self.context.wait_timeout(),
                DeadlineKind::Idle,
            ));
        }
    }

    // ========================================================================
    // Relay
    // ========================================================================

    /// Opaque bidirectional forwarding; frame boundaries no longer matter.
    fn relay(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        let mut moved = 0usize;

        // client -> server
        match pump(&mut self.client, server) {
            Ok(n) => {
                moved += n;
                self.handle.stats().add_up(n as u64);
            }
            Err(e) => return self.client_failed(&e),
        }
        match server.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => return Step::Suspend(IoWant::SendServer),
            Ok(_) => {}
            Err(e) => return self.server_failed(&e),
        }

        // server -> client
        match pump(server, &mut self.client) {
            Ok(n) => {
                moved += n;
                self.handle.stats().add_down(n as u64);
            }
            Err(e) => return self.server_failed(&e),
        }
        match self.client.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => return Step::Suspend(IoWant::SendClient),
            Ok(_) => {}
            Err(e) => return self.client_failed(&e),
        }

        if moved > 0 {
            // activity restarts the idle timer
            if !self.context.wait_timeout().is_zero() {
                self.deadline = Some((
                    Instant::now() + self.context.wait_timeout(),
                    DeadlineKind::Idle,
                ));
            }
        }

        Step::Suspend(IoWant::RecvEither)
    }

    // ========================================================================
    // Failure and teardown
    // ========================================================================

    fn client_failed(&mut self, e: &io::Error) -> Step {
        if e.kind() != io::ErrorKind::UnexpectedEof {
            log::debug!(
                "[{}] client {} failed: {}",
                self.context.name(),
                self.handle.client_address(),
                e
            );
        }

        if !self.protocol.handshake_done {
            self.count_handshake_failure();
        }

        Step::Next(Function::Finish)
    }

    fn server_failed(&mut self, e: &io::Error) -> Step {
        if e.kind() != io::ErrorKind::UnexpectedEof {
            log::debug!(
                "[{}] server for client {} failed: {}",
                self.context.name(),
                self.handle.client_address(),
                e
            );
        }

        Step::Next(Function::Finish)
    }

    /// Count a failed handshake against the client host; once blocked, make
    /// the backend count it too by sending the canonical fake login.
    fn count_handshake_failure(&mut self) {
        if self.failure_counted {
            return;
        }
        self.failure_counted = true;

        let client_addr = match self.client.stream().peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        let blocked = self
            .context
            .block_client_host(client_ip_key(&client_addr), &client_addr.to_string());

        if blocked {
            if let Some(server) = self.server.as_mut() {
                let _ = server.write_plain(&encode_fake_login_packet());
                let _ = server.flush_to_socket();
            }
        }
    }

    fn finish(&mut self) -> Step {
        self.client.tls_shutdown();
        let _ = self.client.flush_to_socket();
        let _ = self.client.stream_mut().shutdown(std::net::Shutdown::Both);

        if let Some(server) = self.server.as_mut() {
            server.tls_shutdown();
            let _ = server.flush_to_socket();
            let _ = server.stream_mut().shutdown(std::net::Shutdown::Both);
        }

        self.context.decrease_info_active_routes();

        Step::Done
    }
}

/// Move every buffered/readable byte from `src` to `dst`'s send side.
fn pump(src: &mut Channel, dst: &mut Channel) -> io::Result<usize> {
    let mut moved = 0usize;

    loop {
        if src.recv_plain_view().is_empty() {
            let added = src.read_to_plain(16 * 1024)?;
            if added == 0 {
                break;
            }
        }

        let view_len = src.recv_plain_view().len();
        if view_len == 0 {
            break;
        }

        {
            let view = src.recv_plain_view().to_vec();
            dst.write(&view)?;
        }
        src.consume_plain(view_len);
        moved += view_len;
    }

    Ok(moved)
}

// ============================================================================
// Router greeting
// ============================================================================

/// Build the synthesized server greeting (protocol version 10).
fn build_server_greeting(conn_id: u64, advertise_tls: bool) -> Vec<u8> {
    let nonce = scramble_nonce(conn_id);

    let mut caps_lower: u16 = (classic::CAPABILITY_PROTOCOL_41 & 0xffff) as u16;
    if advertise_tls {
        caps_lower |= (classic::CAPABILITY_SSL & 0xffff) as u16;
    }

    let mut payload = Vec::with_capacity(96);
    payload.push(0x0a); // protocol version
    classic::encode_null_terminated("8.0.40-router", &mut payload);
    classic::FixedInt::<4>(conn_id & 0xffff_ffff).encode_into(&mut payload);
    payload.extend_from_slice(&nonce[..8]); // auth-plugin-data part 1
    payload.push(0x00); // filler
    classic::FixedInt::<2>(caps_lower as u64).encode_into(&mut payload);
    payload.push(0xff); // charset
    classic::FixedInt::<2>(0x0002).encode_into(&mut payload); // status: autocommit
    classic::FixedInt::<2>(0).encode_into(&mut payload); // caps upper
    payload.push(21); // auth-plugin-data length
    payload.extend_from_slice(&[0u8; 10]); // reserved
    payload.extend_from_slice(&nonce[8..20]); // auth-plugin-data part 2
    payload.push(0x00);
    classic::encode_null_terminated("caching_sha2_password", &mut payload);

    classic::encode_frame(0, &payload)
}

/// Per-connection scramble bytes; only needs to differ between connections.
fn scramble_nonce(conn_id: u64) -> [u8; 20] {
    let hasher = RandomState::new();

    let mut nonce = [0u8; 20];
    for (i, chunk) in nonce.chunks_mut(8).enumerate() {
        let word = hasher.hash_one(conn_id ^ (i as u64) << 32).to_le_bytes();
        for (dst, src) in chunk.iter_mut().zip(word.iter()) {
            // avoid NUL inside the nonce, some clients read it C-style
            *dst = if *src == 0 { 0x5a } else { *src };
        }
    }

    nonce
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockStream, MockStreamHandle};
    use crate::connection::ConnectionId;
    use crate::context::RoutingConfig;
    use crate::destination::FirstAvailableDestinations;
    use crate::protocol::classic::{encode_frame, Command};
    use std::net::TcpListener;

    fn make_context(source_ssl_mode: SslMode) -> Arc<RoutingContext> {
        Arc::new(RoutingContext::new(RoutingConfig {
            source_ssl_mode,
            ..Default::default()
        }))
    }

    fn make_connection(
        context: Arc<RoutingContext>,
        backend_port: Option<u16>,
    ) -> (ClassicConnection, MockStreamHandle) {
        let provider = Arc::new(FirstAvailableDestinations::new());
        if let Some(port) = backend_port {
            provider.add("127.0.0.1", port);
        }

        let stream = MockStream::new();
        let client = stream.handle();
        let addr: std::net::SocketAddr = "127.0.0.1:54321".parse().unwrap();
        let handle = Arc::new(ConnectionHandle::new(ConnectionId(1), &addr, None));

        let channel = Channel::new(Box::new(stream), 16384);
        let conn = ClassicConnection::new(context, provider, handle, channel);

        (conn, client)
    }

    #[test]
    fn test_router_greeting_is_sent_first() {
        let context = make_context(SslMode::Preferred);
        let (mut conn, client) = make_connection(context, None);

        // greet-on-behalf: the greeting leaves before any backend exists
        match conn.resume() {
            RunResult::Suspend(IoWant::RecvClient) => {}
            other => panic!("expected to wait for the client, got {:?}", other),
        }

        let written = client.get_written_data();
        let header = decode_frame_header(&written).unwrap();
        assert_eq!(header.seq_id, 0);
        assert_eq!(written[FRAME_HEADER_SIZE], 0x0a); // protocol version

        // SSL capability advertised for a Preferred route
        let caps_pos = written
            .windows(14)
            .position(|w| w == b"8.0.40-router\0")
            .unwrap()
            + 14
            + 4
            + 8
            + 1;
        let caps = u16::from_le_bytes([written[caps_pos], written[caps_pos + 1]]);
        assert_ne!(caps as u32 & classic::CAPABILITY_SSL, 0);
    }

    #[test]
    fn test_greeting_without_tls_when_disabled() {
        let context = make_context(SslMode::Disabled);
        let (mut conn, client) = make_connection(context, None);

        conn.resume();

        let written = client.get_written_data();
        let caps_pos = written
            .windows(14)
            .position(|w| w == b"8.0.40-router\0")
            .unwrap()
            + 14
            + 4
            + 8
            + 1;
        let caps = u16::from_le_bytes([written[caps_pos], written[caps_pos + 1]]);
        assert_eq!(caps as u32 & classic::CAPABILITY_SSL, 0);
    }

    #[test]
    fn test_handshake_seq_skip_aborts() {
        // after the client's seq-1 response, the server answers seq 3
        // (skipping 2): the connection aborts without forwarding
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = std::thread::spawn(move || {
            use std::io::{Read, Write};

            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&encode_frame(0, b"\x0agreeting")).unwrap();

            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).unwrap();

            // wrong: successor of 1 must be 2
            sock.write_all(&encode_frame(3, &[0x00])).unwrap();
            sock
        });

        let context = make_context(SslMode::Preferred);
        let (mut conn, client) = make_connection(context, Some(port));

        conn.resume();
        client.clear_written_data();

        let mut response = Vec::new();
        classic::FixedInt::<4>(classic::CAPABILITY_PROTOCOL_41 as u64).encode_into(&mut response);
        response.extend_from_slice(&[0u8; 28]);
        client.feed_read_data(&encode_frame(1, &response));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match conn.resume() {
                RunResult::Done => break,
                RunResult::Suspend(IoWant::RecvEither) => {
                    panic!("mis-sequenced frame must not reach the relay")
                }
                RunResult::Suspend(_) => {
                    assert!(std::time::Instant::now() < deadline, "stuck");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }

        // nothing was forwarded to the client
        assert!(client.get_written_data().is_empty());

        let _ = backend.join().unwrap();
    }

    #[test]
    fn test_full_handshake_against_backend() {
        // backend accepting one connection, reading the forwarded response
        // and answering auth-ok
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = std::thread::spawn(move || {
            use std::io::{Read, Write};

            let (mut sock, _) = listener.accept().unwrap();

            // the real greeting the router swallows
            sock.write_all(&encode_frame(0, b"\x0agreeting")).unwrap();

            // read the forwarded client response (seq 1)
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).unwrap();
            assert!(n >= FRAME_HEADER_SIZE);
            assert_eq!(buf[3], 1);

            // auth ok at seq 2
            sock.write_all(&encode_frame(2, &[0x00])).unwrap();
            sock
        });

        let context = make_context(SslMode::Preferred);
        let (mut conn, client) = make_connection(context, Some(port));

        conn.resume(); // greeting to client
        client.clear_written_data();

        // client handshake response, seq 1, no SSL bit
        let mut response = Vec::new();
        classic::FixedInt::<4>(classic::CAPABILITY_PROTOCOL_41 as u64).encode_into(&mut response);
        response.extend_from_slice(&[0u8; 28]);
        client.feed_read_data(&encode_frame(1, &response));

        // drive: connect, swallow greeting, forward response, relay reply
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match conn.resume() {
                RunResult::Suspend(IoWant::RecvEither) => break, // relaying
                RunResult::Suspend(_) => {
                    assert!(std::time::Instant::now() < deadline, "handshake stuck");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                RunResult::Done => panic!("connection ended during handshake"),
            }
        }

        // the auth-ok (seq 2) reached the client
        let written = client.get_written_data();
        let header = decode_frame_header(&written).unwrap();
        assert_eq!(header.seq_id, 2);
        assert_eq!(written[FRAME_HEADER_SIZE], 0x00);

        let _ = backend.join().unwrap();
    }

    #[test]
    fn test_connect_failure_sends_2026() {
        // a port nothing listens on
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let context = make_context(SslMode::Preferred);
        let (mut conn, client) = make_connection(context, Some(dead_port));

        conn.resume();
        client.clear_written_data();

        let mut response = Vec::new();
        classic::FixedInt::<4>(classic::CAPABILITY_PROTOCOL_41 as u64).encode_into(&mut response);
        response.extend_from_slice(&[0u8; 28]);
        client.feed_read_data(&encode_frame(1, &response));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match conn.resume() {
                RunResult::Done => break,
                RunResult::Suspend(_) => {
                    assert!(std::time::Instant::now() < deadline, "connect stuck");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }

        let written = client.get_written_data();
        let payload = &written[FRAME_HEADER_SIZE..];
        assert_eq!(payload[0], 0xff);
        assert_eq!(
            u16::from_le_bytes([payload[1], payload[2]]),
            classic::ERROR_CONNECTING_TO_BACKEND
        );
    }

    #[test]
    fn test_disconnect_is_observed() {
        let context = make_context(SslMode::Preferred);
        let (mut conn, _client) = make_connection(context, None);

        conn.resume();
        conn.handle().disconnect();

        match conn.resume() {
            RunResult::Done => {}
            other => panic!("expected teardown, got {:?}", other),
        }
    }

    #[test]
    fn test_ssl_capability_short_circuits_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = std::thread::spawn(move || {
            use std::io::Write;

            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&encode_frame(0, b"\x0agreeting")).unwrap();
            sock
        });

        let context = make_context(SslMode::Preferred);
        let (mut conn, client) = make_connection(context, Some(port));

        conn.resume();

        // SSL request packet at seq 1: short header with the SSL bit
        let mut response = Vec::new();
        classic::FixedInt::<4>((classic::CAPABILITY_PROTOCOL_41 | classic::CAPABILITY_SSL) as u64)
            .encode_into(&mut response);
        response.extend_from_slice(&[0u8; 28]);
        client.feed_read_data(&encode_frame(1, &response));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match conn.resume() {
                // handshake is done immediately: opaque relay
                RunResult::Suspend(IoWant::RecvEither) => break,
                RunResult::Suspend(_) => {
                    assert!(std::time::Instant::now() < deadline, "stuck");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                RunResult::Done => panic!("connection ended unexpectedly"),
            }
        }

        let _ = backend.join().unwrap();
    }

    #[test]
    fn test_command_bytes_relay_verbatim() {
        // after the handshake, a Ping crosses without inspection
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = std::thread::spawn(move || {
            use std::io::{Read, Write};

            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&encode_frame(0, b"\x0agreeting")).unwrap();

            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).unwrap();
            sock.write_all(&encode_frame(2, &[0x00])).unwrap();

            // expect the relayed ping
            let mut ping = [0u8; 5];
            sock.read_exact(&mut ping).unwrap();
            assert_eq!(ping, [0x01, 0x00, 0x00, 0x00, Command::Ping.byte()]);
        });

        let context = make_context(SslMode::Preferred);
        let (mut conn, client) = make_connection(context, Some(port));

        conn.resume();

        let mut response = Vec::new();
        classic::FixedInt::<4>(classic::CAPABILITY_PROTOCOL_41 as u64).encode_into(&mut response);
        response.extend_from_slice(&[0u8; 28]);
        client.feed_read_data(&encode_frame(1, &response));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match conn.resume() {
                RunResult::Suspend(IoWant::RecvEither) => break,
                RunResult::Suspend(_) => {
                    assert!(std::time::Instant::now() < deadline, "stuck");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                RunResult::Done => panic!("connection ended unexpectedly"),
            }
        }

        client.feed_read_data(&encode_frame(0, &[Command::Ping.byte()]));
        conn.resume();

        backend.join().unwrap();
    }
}
