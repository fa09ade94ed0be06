// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Route service: acceptor plus reactor.
//!
//! One service drives one route: it binds the listening socket, accepts
//! clients, spawns a per-connection state machine into the route's
//! [`ConnectionContainer`], and multiplexes all connection I/O over a mio
//! poll loop.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       RoutingService                          |
//! |  +--------------------------------------------------------+  |
//! |  |                      mio::Poll                          |  |
//! |  |  - TCP listener (paused/resumed by the provider)        |  |
//! |  |  - client + server sockets of every connection          |  |
//! |  |  - waker (disconnects, acceptor control, shutdown)      |  |
//! |  +--------------------------------------------------------+  |
//! |        |  accept            |  readiness         |  sweep     |
//! |        v                    v                    v            |
//! |   spawn machine       conn.resume()       deadlines,         |
//! |   into container                          disconnect flags   |
//! +--------------------------------------------------------------+
//! ```
//!
//! Scheduling is cooperative: a machine runs until it suspends on one of
//! its I/O wants; the poll loop resumes it when the socket is ready, a
//! deadline fires, or its handle was asked to disconnect.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};

use crate::channel::{ByteStream, Channel};
use crate::connection::classic::ClassicConnection;
use crate::connection::xproto::XConnection;
use crate::connection::{ConnectionHandle, ConnectionId, RunResult};
use crate::connection_container::ConnectionContainer;
use crate::context::{client_ip_key, RoutingContext};
use crate::destination::{DestinationProvider, TcpAddress};
use crate::protocol::Protocol;
use crate::routing;

// ============================================================================
// Constants
// ============================================================================

/// Token for the TCP listener.
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker.
const WAKER_TOKEN: Token = Token(1);

/// First token usable for connections.
const CONNECTION_TOKEN_START: u64 = 2;

/// Poll timeout; bounds deadline-sweep latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Events processed per poll round.
const MAX_EVENTS: usize = 128;

// ============================================================================
// Destination parsing
// ============================================================================

/// Parse a comma-separated `host[:port]` destination list, filling in the
/// protocol's default port. Destinations equal to the bind address are
/// rejected (routing to oneself).
pub fn parse_destinations_csv(
    csv: &str,
    protocol: Protocol,
    bind_address: &TcpAddress,
) -> crate::Result<Vec<TcpAddress>> {
    if csv.trim().is_empty() {
        return Err(crate::Error::Config("empty destination list".to_string()));
    }

    let mut out = Vec::new();
    for part in csv.split(',') {
        let addr = TcpAddress::parse(part, protocol.default_port())
            .map_err(|e| crate::Error::Config(e.to_string()))?;

        if addr == *bind_address {
            return Err(crate::Error::Config(format!(
                "destination {addr} is the route's own bind address"
            )));
        }

        if !out.contains(&addr) {
            out.push(addr);
        }
    }

    Ok(out)
}

// ============================================================================
// Connections
// ============================================================================

/// The two machine flavors behind one dispatch surface.
enum RoutedConnection {
    Classic(Box<ClassicConnection>),
    X(Box<XConnection>),
}

impl RoutedConnection {
    fn resume(&mut self) -> RunResult {
        match self {
            RoutedConnection::Classic(conn) => conn.resume(),
            RoutedConnection::X(conn) => conn.resume(),
        }
    }

    fn on_deadline(&mut self) -> RunResult {
        match self {
            RoutedConnection::Classic(conn) => conn.on_deadline(),
            RoutedConnection::X(conn) => conn.on_deadline(),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            RoutedConnection::Classic(conn) => conn.deadline(),
            RoutedConnection::X(conn) => conn.deadline(),
        }
    }

    fn handle(&self) -> &Arc<ConnectionHandle> {
        match self {
            RoutedConnection::Classic(conn) => conn.handle(),
            RoutedConnection::X(conn) => conn.handle(),
        }
    }

    fn client_stream_mut(&mut self) -> &mut dyn ByteStream {
        match self {
            RoutedConnection::Classic(conn) => conn.client_stream_mut(),
            RoutedConnection::X(conn) => conn.client_stream_mut(),
        }
    }

    fn server_io(&mut self) -> Option<(&mut dyn ByteStream, u64)> {
        match self {
            RoutedConnection::Classic(conn) => conn.server_io(),
            RoutedConnection::X(conn) => conn.server_io(),
        }
    }
}

struct ConnEntry {
    conn: RoutedConnection,
    client_token: Token,
    server_token: Token,

    /// Serial of the server-side fd currently registered, if any.
    registered_server_serial: Option<u64>,
}

// ============================================================================
// Service
// ============================================================================

/// Acceptor and reactor of one route.
pub struct RoutingService {
    context: Arc<RoutingContext>,
    provider: Arc<dyn DestinationProvider>,
    container: Arc<ConnectionContainer>,

    poll: Poll,
    waker: Arc<Waker>,

    listener: mio::net::TcpListener,
    listener_registered: bool,
    local_addr: SocketAddr,

    /// Toggled through the provider's start/stop-acceptor slots.
    accepting: Arc<AtomicBool>,

    running: Arc<AtomicBool>,

    connections: HashMap<u64, ConnEntry>,
    token_map: HashMap<Token, u64>,
    next_conn: u64,
}

impl RoutingService {
    /// Bind the route's listening socket and wire the provider callbacks.
    pub fn new(
        context: Arc<RoutingContext>,
        provider: Arc<dyn DestinationProvider>,
    ) -> crate::Result<Self> {
        let bind = context.bind_address().clone();
        let bind_addr = (bind.address.as_str(), bind.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                crate::Error::Config(format!("cannot resolve bind address {bind}"))
            })?;

        let listener = mio::net::TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let accepting = Arc::new(AtomicBool::new(true));
        let running = Arc::new(AtomicBool::new(true));
        let container = Arc::new(ConnectionContainer::new());

        // acceptor control slots
        {
            let flag = accepting.clone();
            let wake = waker.clone();
            provider
                .notifier()
                .register_start_acceptor(Box::new(move || {
                    flag.store(true, Ordering::SeqCst);
                    let _ = wake.wake();
                    Ok(())
                }));

            let flag = accepting.clone();
            let wake = waker.clone();
            provider.notifier().register_stop_acceptor(Box::new(move || {
                flag.store(false, Ordering::SeqCst);
                let _ = wake.wake();
            }));
        }

        // fleet-wide disconnect when the allowed set shrinks
        {
            let container = container.clone();
            let name = context.name().to_string();
            provider
                .notifier()
                .register_allowed_nodes_change_callback(Box::new(
                    move |new_allowed, _for_new, disconnect_existing, reason| {
                        if disconnect_existing {
                            log::info!(
                                "[{}] allowed nodes changed ({}), disconnecting removed servers",
                                name,
                                reason
                            );
                            container.disconnect(new_allowed);
                        }
                    },
                ));
        }

        Ok(Self {
            context,
            provider,
            container,
            poll,
            waker,
            listener,
            listener_registered: false,
            local_addr,
            accepting,
            running,
            connections: HashMap::new(),
            token_map: HashMap::new(),
            next_conn: CONNECTION_TOKEN_START,
        })
    }

    /// The bound address; useful when port 0 was configured.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn container(&self) -> Arc<ConnectionContainer> {
        self.container.clone()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Handle for stopping the running service from another thread.
    fn stop_handle(&self) -> (Arc<AtomicBool>, Arc<Waker>) {
        (self.running.clone(), self.waker.clone())
    }

    /// Spawn the service on its own reactor thread.
    pub fn spawn(self) -> crate::Result<RunningService> {
        let name = routing::thread_name(self.context.name(), "RtS");

        let local_addr = self.local_addr;
        let container = self.container.clone();
        let context = self.context.clone();
        let accepting = self.accepting.clone();
        let (running, waker) = self.stop_handle();

        let join = std::thread::Builder::new().name(name).spawn(move || {
            let mut service = self;
            service.run();
        })?;

        Ok(RunningService {
            join: Some(join),
            running,
            waker,
            container,
            context,
            accepting,
            local_addr,
        })
    }

    /// Run the reactor until stopped.
    pub fn run(&mut self) {
        log::info!(
            "[{}] start accepting connections on {}",
            self.context.name(),
            self.local_addr
        );

        self.context.increase_active_thread_counter();

        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::SeqCst) {
            self.sync_acceptor_registration();

            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[{}] poll failed: {}", self.context.name(), e);
                break;
            }

            let mut to_resume: Vec<u64> = Vec::new();

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => {
                        // disconnect flags are swept below
                    }
                    token => {
                        if let Some(&index) = self.token_map.get(&token) {
                            if !to_resume.contains(&index) {
                                to_resume.push(index);
                            }
                        }
                    }
                }
            }

            for index in to_resume {
                self.resume_connection(index);
            }

            self.sweep_disconnects();
            self.sweep_deadlines();
        }

        // teardown: drop every connection
        let indexes: Vec<u64> = self.connections.keys().copied().collect();
        for index in indexes {
            if let Some(entry) = self.connections.get(&index) {
                entry.conn.handle().disconnect();
            }
            self.resume_connection(index);
        }

        self.context.decrease_active_thread_counter();

        log::info!("[{}] stopped", self.context.name());
    }

    // ========================================================================
    // Accepting
    // ========================================================================

    fn sync_acceptor_registration(&mut self) {
        let want = self.accepting.load(Ordering::SeqCst);

        if want && !self.listener_registered {
            if let Err(e) =
                self.poll
                    .registry()
                    .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
            {
                log::error!("[{}] registering listener failed: {}", self.context.name(), e);
                return;
            }
            self.listener_registered = true;

            // connections may have queued up while paused
            self.handle_accept();
        } else if !want && self.listener_registered {
            let _ = self.poll.registry().deregister(&mut self.listener);
            self.listener_registered = false;
        }
    }

    fn handle_accept(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[{}] accept failed: {}", self.context.name(), e);
                    break;
                }
            };

            // blocked hosts don't get to talk at all
            if self.context.is_blocked(&client_ip_key(&peer)) {
                log::debug!(
                    "[{}] rejecting connection from blocked host {}",
                    self.context.name(),
                    peer
                );
                drop(stream);
                continue;
            }

            let max_connections = self.context.max_connections();
            if max_connections > 0 && self.container.size() >= max_connections as usize {
                log::warn!(
                    "[{}] maximum connections ({}) reached, rejecting {}",
                    self.context.name(),
                    max_connections,
                    peer
                );
                drop(stream);
                continue;
            }

            let _ = stream.set_nodelay(true);

            self.spawn_connection(stream, peer);
        }
    }

    fn spawn_connection(&mut self, mut stream: mio::net::TcpStream, peer: SocketAddr) {
        let index = self.next_conn;
        self.next_conn += 2;

        let client_token = Token(index as usize);
        let server_token = Token((index + 1) as usize);

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            client_token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            log::warn!(
                "[{}] registering client {} failed: {}",
                self.context.name(),
                peer,
                e
            );
            return;
        }

        let handle = Arc::new(ConnectionHandle::new(
            ConnectionId(index),
            &peer,
            Some(self.waker.clone()),
        ));

        let channel = Channel::new(Box::new(stream), self.context.net_buffer_length());

        let conn = match self.context.protocol() {
            Protocol::Classic => RoutedConnection::Classic(Box::new(ClassicConnection::new(
                self.context.clone(),
                self.provider.clone(),
                handle.clone(),
                channel,
            ))),
            Protocol::X => RoutedConnection::X(Box::new(XConnection::new(
                self.context.clone(),
                self.provider.clone(),
                handle.clone(),
                channel,
            ))),
        };

        self.container.add_connection(handle);
        self.token_map.insert(client_token, index);
        self.token_map.insert(server_token, index);
        self.connections.insert(
            index,
            ConnEntry {
                conn,
                client_token,
                server_token,
                registered_server_serial: None,
            },
        );

        log::debug!("[{}] accepted connection from {}", self.context.name(), peer);

        self.resume_connection(index);
    }

    // ========================================================================
    // Driving connections
    // ========================================================================

    fn resume_connection(&mut self, index: u64) {
        let entry = match self.connections.get_mut(&index) {
            Some(entry) => entry,
            None => return,
        };

        let result = entry.conn.resume();
        self.after_resume(index, result);
    }

    fn after_resume(&mut self, index: u64, result: RunResult) {
        match result {
            RunResult::Done => self.finalize_connection(index),
            RunResult::Suspend(_) => {
                let registry = self.poll.registry();
                let entry = match self.connections.get_mut(&index) {
                    Some(entry) => entry,
                    None => return,
                };

                // a server-side socket appears (or changes) during connect
                if let Some((stream, serial)) = entry.conn.server_io() {
                    if entry.registered_server_serial != Some(serial) {
                        match stream.register(
                            registry,
                            entry.server_token,
                            Interest::READABLE | Interest::WRITABLE,
                        ) {
                            Ok(()) => entry.registered_server_serial = Some(serial),
                            Err(e) => log::debug!("server socket registration failed: {}", e),
                        }
                    }
                }
            }
        }
    }

    fn finalize_connection(&mut self, index: u64) {
        let mut entry = match self.connections.remove(&index) {
            Some(entry) => entry,
            None => return,
        };

        let registry = self.poll.registry();
        let _ = entry.conn.client_stream_mut().deregister(registry);
        if let Some((stream, _)) = entry.conn.server_io() {
            let _ = stream.deregister(registry);
        }

        self.token_map.remove(&entry.client_token);
        self.token_map.remove(&entry.server_token);
        self.container.remove_connection(entry.conn.handle().id());

        log::debug!(
            "[{}] connection from {} closed",
            self.context.name(),
            entry.conn.handle().client_address()
        );
    }

    /// Resume connections whose handles were asked to disconnect.
    fn sweep_disconnects(&mut self) {
        let flagged: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.conn.handle().disconnect_requested())
            .map(|(&index, _)| index)
            .collect();

        for index in flagged {
            self.resume_connection(index);
        }
    }

    /// Fire expired per-connection deadlines.
    fn sweep_deadlines(&mut self) {
        let now = Instant::now();

        let due: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.conn.deadline().is_some_and(|at| at <= now))
            .map(|(&index, _)| index)
            .collect();

        for index in due {
            let result = match self.connections.get_mut(&index) {
                Some(entry) => entry.conn.on_deadline(),
                None => continue,
            };
            self.after_resume(index, result);
        }
    }
}

// ============================================================================
// Running service
// ============================================================================

/// A [`RoutingService`] running on its own thread.
pub struct RunningService {
    join: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    container: Arc<ConnectionContainer>,
    context: Arc<RoutingContext>,
    accepting: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl RunningService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn container(&self) -> &Arc<ConnectionContainer> {
        &self.container
    }

    pub fn context(&self) -> &Arc<RoutingContext> {
        &self.context
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop the reactor and wait for it to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();

        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RunningService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
