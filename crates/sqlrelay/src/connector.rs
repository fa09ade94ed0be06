// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Destination connector.
//!
//! Walks the provider's destination list, resolves each destination to
//! transport endpoints, and drives a non-blocking connect per endpoint:
//!
//! ```text
//! init_destination -> resolve -> init_endpoint -> connect_init -> try_connect
//!       ^                                                            |
//!       |  refresh() on total exhaustion            in-progress      v
//!       +---- next_destination <--- next_endpoint <----------- connect_finish
//!                                                                     |
//!                                                                     v
//!                                                                 connected
//! ```
//!
//! `connect()` runs the machine until it either yields an established
//! stream, reports that a connect is in progress (the caller then waits for
//! writability bounded by `destination_connect_timeout` and calls
//! `connect()` again), or fails with a [`ConnectError`]. Destinations that
//! are not `good()` or are quarantined are skipped; per-destination
//! outcomes are reported back through `Destination::connect_status`.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};

use crate::destination::{Destination, DestinationProvider, Destinations, TcpAddress};

// ============================================================================
// Errors
// ============================================================================

/// Terminal connector failures.
#[derive(Debug)]
pub enum ConnectError {
    /// The provider has no connectable destinations and refresh returned
    /// nothing new.
    NoDestinations,

    /// Every destination failed; carries the last endpoint error.
    Exhausted(io::Error),

    /// The process or system ran out of file descriptors. The caller must
    /// release pooled descriptors and must not retry in a tight loop.
    ResourceExhaustion(io::Error),
}

impl ConnectError {
    /// Wrap a final connect error, routing fd exhaustion to its own kind.
    fn from_last_error(e: io::Error) -> Self {
        if is_fd_exhaustion(&e) {
            ConnectError::ResourceExhaustion(e)
        } else {
            ConnectError::Exhausted(e)
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::NoDestinations => write!(f, "no connectable destinations"),
            ConnectError::Exhausted(e) => write!(f, "all destinations failed: {}", e),
            ConnectError::ResourceExhaustion(e) => write!(f, "out of file descriptors: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::NoDestinations => None,
            ConnectError::Exhausted(e) | ConnectError::ResourceExhaustion(e) => Some(e),
        }
    }
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

// ============================================================================
// Connect step results
// ============================================================================

/// An established server-side stream.
pub struct Connected {
    /// The connected non-blocking stream, ready for reactor registration.
    pub stream: mio::net::TcpStream,

    /// The endpoint the stream is connected to.
    pub endpoint: SocketAddr,

    /// `hostname:port` of the destination that served the connect.
    pub destination_id: String,

    /// The destination's address, for allowed-set bookkeeping.
    pub destination: TcpAddress,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected")
            .field("endpoint", &self.endpoint)
            .field("destination_id", &self.destination_id)
            .finish()
    }
}

/// Outcome of one `connect()` pass.
#[derive(Debug)]
pub enum ConnectStep {
    /// Socket connected.
    Done(Connected),

    /// Non-blocking connect in progress: wait for writability on
    /// [`Connector::pending_socket`] bounded by the destination connect
    /// timeout, then call `connect()` again.
    InProgress,
}

/// Called with `(hostname, port)` once a connect succeeded.
pub type OnConnectSuccess = Box<dyn FnMut(&str, u16) + Send>;

/// Called with `(hostname, port, error)` when a destination is given up on.
pub type OnConnectFailure = Box<dyn FnMut(&str, u16, &io::Error) + Send>;

// ============================================================================
// Connector
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Function {
    InitDestination,
    Connect,
    ConnectFinish,
}

/// Drives destination selection and the non-blocking connect.
pub struct Connector {
    provider: Arc<dyn DestinationProvider>,

    destinations: Destinations,
    /// The initial provider fetch happened; afterwards the list only
    /// changes through `refresh_destinations()`.
    destinations_fetched: bool,
    dest_ndx: usize,

    endpoints: Vec<SocketAddr>,
    endpoint_ndx: usize,

    /// Socket of an in-progress connect.
    pending: Option<mio::net::TcpStream>,

    /// Endpoint of the in-progress connect.
    server_endpoint: Option<SocketAddr>,

    func: Function,
    last_error: Option<io::Error>,
    timed_out: bool,

    /// Bumped for every fresh socket; lets the owner notice fd changes.
    attempt: u64,

    /// Optional source address to route through; enables
    /// `IP_BIND_ADDRESS_NO_PORT` so the port is assigned at connect time.
    source_address: Option<IpAddr>,

    destination_id: String,

    on_connect_success: Option<OnConnectSuccess>,
    on_connect_failure: Option<OnConnectFailure>,
}

impl Connector {
    pub fn new(provider: Arc<dyn DestinationProvider>) -> Self {
        Self {
            provider,
            destinations: Vec::new(),
            destinations_fetched: false,
            dest_ndx: 0,
            endpoints: Vec::new(),
            endpoint_ndx: 0,
            pending: None,
            server_endpoint: None,
            func: Function::InitDestination,
            last_error: None,
            timed_out: false,
            attempt: 0,
            source_address: None,
            destination_id: String::new(),
            on_connect_success: None,
            on_connect_failure: None,
        }
    }

    pub fn with_source_address(mut self, addr: IpAddr) -> Self {
        self.source_address = Some(addr);
        self
    }

    pub fn on_connect_success(&mut self, callback: OnConnectSuccess) {
        self.on_connect_success = Some(callback);
    }

    pub fn on_connect_failure(&mut self, callback: OnConnectFailure) {
        self.on_connect_failure = Some(callback);
    }

    /// `hostname:port` of the connected destination; empty before success.
    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// The socket of an in-progress connect, for reactor registration.
    pub fn pending_socket(&mut self) -> Option<&mut mio::net::TcpStream> {
        self.pending.as_mut()
    }

    /// Serial of the current connect attempt; changes with every fresh
    /// socket.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Mark the in-progress connect as timed out; the next `connect()`
    /// records the timeout and advances to the next endpoint.
    pub fn set_connect_timed_out(&mut self, timed_out: bool) {
        self.timed_out = timed_out;
    }

    pub fn connect_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Run the machine until connected, in-progress, or failed.
    pub fn connect(&mut self) -> Result<ConnectStep, ConnectError> {
        loop {
            match self.func {
                Function::InitDestination => self.init_destination()?,
                Function::Connect => {
                    if let Some(done) = self.try_connect()? {
                        return Ok(ConnectStep::Done(done));
                    }
                    if self.pending.is_some() {
                        return Ok(ConnectStep::InProgress);
                    }
                }
                Function::ConnectFinish => {
                    if let Some(done) = self.connect_finish()? {
                        return Ok(ConnectStep::Done(done));
                    }
                }
            }
        }
    }

    // ========================================================================
    // States
    // ========================================================================

    /// Position on the first usable entry of the destination list.
    ///
    /// The list is fetched from the provider exactly once; afterwards only
    /// `refresh_destinations()` replaces it, and a refreshed empty list
    /// still terminates here.
    fn init_destination(&mut self) -> Result<(), ConnectError> {
        if !self.destinations_fetched {
            self.destinations = self.provider.destinations();
            self.destinations_fetched = true;
        }
        self.dest_ndx = 0;

        if self.destinations.is_empty() {
            // no backends
            log::warn!("no connectable destinations");
            return Err(ConnectError::NoDestinations);
        }

        if self.current_destination_usable() {
            self.resolve()
        } else {
            self.next_destination()
        }
    }

    fn current_destination_usable(&self) -> bool {
        let dest = &self.destinations[self.dest_ndx];

        if !dest.good() {
            return false;
        }

        let addr = TcpAddress::new(dest.hostname(), dest.port());
        !self.provider.notifier().is_quarantined(&addr)
    }

    fn resolve(&mut self) -> Result<(), ConnectError> {
        let dest = &self.destinations[self.dest_ndx];

        if !dest.good() {
            return self.next_destination();
        }

        match (dest.hostname(), dest.port()).to_socket_addrs() {
            Ok(endpoints) => {
                self.endpoints = endpoints.collect();
                if self.endpoints.is_empty() {
                    log::warn!("resolving {} returned no endpoints", dest.id());
                    dest.connect_status(io::ErrorKind::NotFound);
                    return self.next_destination();
                }

                self.init_endpoint();
                Ok(())
            }
            Err(e) => {
                log::warn!("resolving {} failed: {}", dest.id(), e);
                dest.connect_status(e.kind());
                self.next_destination()
            }
        }
    }

    fn init_endpoint(&mut self) {
        self.endpoint_ndx = 0;
        self.connect_init();
    }

    fn connect_init(&mut self) {
        // close a socket from a previous attempt
        self.pending = None;
        self.timed_out = false;
        self.attempt += 1;

        self.server_endpoint = Some(self.endpoints[self.endpoint_ndx]);
        self.func = Function::Connect;
    }

    /// One non-blocking connect attempt against the current endpoint.
    ///
    /// `Ok(Some(_))` connected immediately; `Ok(None)` either in progress
    /// (`pending` is set) or the machine advanced past a failed endpoint.
    fn try_connect(&mut self) -> Result<Option<Connected>, ConnectError> {
        let endpoint = self.server_endpoint.expect("endpoint set by connect_init");

        let sock = match self.open_socket(endpoint) {
            Ok(sock) => sock,
            Err(e) => {
                self.last_error = Some(e);
                self.next_endpoint()?;
                return Ok(None);
            }
        };

        match sock.connect(&endpoint.into()) {
            Ok(()) => {
                let stream = mio::net::TcpStream::from_std(sock.into());
                Ok(Some(self.connected(stream, endpoint)))
            }
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                // connect in progress, wait for completion
                self.pending = Some(mio::net::TcpStream::from_std(sock.into()));
                self.func = Function::ConnectFinish;
                Ok(None)
            }
            Err(e) => {
                self.last_error = Some(e);
                self.next_endpoint()?;
                Ok(None)
            }
        }
    }

    fn open_socket(&self, endpoint: SocketAddr) -> io::Result<Socket> {
        let sock = Socket::new(
            Domain::for_address(endpoint),
            Type::STREAM,
            Some(SockProtocol::TCP),
        )?;

        sock.set_nonblocking(true)?;
        sock.set_nodelay(true)?;

        if let Some(src) = self.source_address {
            // delay the source-port assignment until connect()
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                use std::os::fd::AsRawFd;

                let one: libc::c_int = 1;
                let res = unsafe {
                    libc::setsockopt(
                        sock.as_raw_fd(),
                        libc::IPPROTO_IP,
                        libc::IP_BIND_ADDRESS_NO_PORT,
                        std::ptr::addr_of!(one).cast(),
                        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    )
                };
                if res != 0 {
                    let e = io::Error::last_os_error();
                    // kernels without the option: ignore
                    if e.raw_os_error() != Some(libc::EINVAL) {
                        log::warn!("setsockopt(IP_BIND_ADDRESS_NO_PORT) failed: {}", e);
                        return Err(e);
                    }
                }
            }

            sock.bind(&SocketAddr::new(src, 0).into())?;
        }

        Ok(sock)
    }

    /// Complete an in-progress connect after the socket became writable or
    /// the attempt timed out.
    fn connect_finish(&mut self) -> Result<Option<Connected>, ConnectError> {
        if self.timed_out {
            self.last_error = Some(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            ));
            self.pending = None;
            self.next_endpoint()?;
            return Ok(None);
        }

        let stream = self.pending.take().expect("pending connect");

        match stream.take_error() {
            Ok(Some(e)) | Err(e) => {
                self.last_error = Some(e);
                self.next_endpoint()?;
                Ok(None)
            }
            Ok(None) => {
                let endpoint = self.server_endpoint.expect("endpoint set");
                Ok(Some(self.connected(stream, endpoint)))
            }
        }
    }

    fn connected(&mut self, stream: mio::net::TcpStream, endpoint: SocketAddr) -> Connected {
        let dest = &self.destinations[self.dest_ndx];

        self.destination_id = dest.id().to_string();

        if let Some(callback) = self.on_connect_success.as_mut() {
            callback(dest.hostname(), dest.port());
        }

        Connected {
            stream,
            endpoint,
            destination_id: self.destination_id.clone(),
            destination: TcpAddress::new(dest.hostname(), dest.port()),
        }
    }

    fn next_endpoint(&mut self) -> Result<(), ConnectError> {
        self.endpoint_ndx += 1;

        if self.endpoint_ndx < self.endpoints.len() {
            self.connect_init();
            return Ok(());
        }

        // all endpoints of this destination failed: report back
        let dest = &self.destinations[self.dest_ndx];
        if let Some(e) = &self.last_error {
            dest.connect_status(e.kind());

            if let Some(callback) = self.on_connect_failure.as_mut() {
                callback(dest.hostname(), dest.port(), e);
            }
        }

        self.next_destination()
    }

    fn next_destination(&mut self) -> Result<(), ConnectError> {
        loop {
            self.dest_ndx += 1;

            if self.dest_ndx >= self.destinations.len() {
                break;
            }

            if self.current_destination_usable() {
                // next destination
                return self.resolve();
            }
        }

        match self.provider.refresh_destinations(&self.destinations) {
            Some(new_destinations) => {
                self.destinations = new_destinations;
                self.func = Function::InitDestination;
                Ok(())
            }
            None => {
                // we couldn't connect to any of the destinations. Give up.
                self.func = Function::InitDestination;
                match self.last_error.take() {
                    Some(e) => Err(ConnectError::from_last_error(e)),
                    None => Err(ConnectError::NoDestinations),
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{
        DestinationNodesStateNotifier, FirstAvailableDestinations, NextAvailableDestinations,
    };
    use crate::routing::RoutingStrategy;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider over a fixed initial list whose refresh can hand out a
    /// replacement list once.
    struct RefreshingProvider {
        initial: Vec<TcpAddress>,
        refreshed: parking_lot::Mutex<Option<Vec<TcpAddress>>>,
        refresh_calls: AtomicUsize,
        notifier: DestinationNodesStateNotifier,
    }

    impl RefreshingProvider {
        fn empty() -> Self {
            Self {
                initial: Vec::new(),
                refreshed: parking_lot::Mutex::new(None),
                refresh_calls: AtomicUsize::new(0),
                notifier: DestinationNodesStateNotifier::new(),
            }
        }

        fn with_refresh(initial: Vec<TcpAddress>, refreshed: Vec<TcpAddress>) -> Self {
            let mut provider = Self::empty();
            provider.initial = initial;
            *provider.refreshed.lock() = Some(refreshed);
            provider
        }
    }

    fn to_destinations(addrs: &[TcpAddress]) -> Destinations {
        addrs
            .iter()
            .map(|a| {
                Box::new(crate::destination::AddressDestination::new(a)) as Box<dyn Destination>
            })
            .collect()
    }

    impl DestinationProvider for RefreshingProvider {
        fn strategy(&self) -> RoutingStrategy {
            RoutingStrategy::Undefined
        }

        fn destinations(&self) -> Destinations {
            to_destinations(&self.initial)
        }

        fn refresh_destinations(&self, _prev: &Destinations) -> Option<Destinations> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refreshed
                .lock()
                .take()
                .map(|addrs| to_destinations(&addrs))
        }

        fn addresses(&self) -> Vec<TcpAddress> {
            self.initial.clone()
        }

        fn notifier(&self) -> &DestinationNodesStateNotifier {
            &self.notifier
        }
    }

    fn drive_to_completion(connector: &mut Connector) -> Result<Connected, ConnectError> {
        // tests connect over loopback; writability comes quickly
        loop {
            match connector.connect()? {
                ConnectStep::Done(done) => return Ok(done),
                ConnectStep::InProgress => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }

    #[test]
    fn test_no_destinations() {
        let provider = Arc::new(RefreshingProvider::empty());
        let mut connector = Connector::new(provider.clone());

        match connector.connect() {
            Err(ConnectError::NoDestinations) => {}
            other => panic!("expected NoDestinations, got {:?}", other.map(|_| ())),
        }

        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider = Arc::new(FirstAvailableDestinations::new());
        provider.add("127.0.0.1", port);

        let mut connector = Connector::new(provider);

        let successes = Arc::new(AtomicUsize::new(0));
        let s = successes.clone();
        connector.on_connect_success(Box::new(move |_host, _port| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        let connected = drive_to_completion(&mut connector).unwrap();
        assert_eq!(connected.endpoint.port(), port);
        assert_eq!(connected.destination_id, format!("127.0.0.1:{}", port));
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        // the accept side sees the connection
        listener.set_nonblocking(true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(listener.accept().is_ok());
    }

    #[test]
    fn test_failover_to_second_destination() {
        // a port nothing listens on, then a live listener
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live_port = listener.local_addr().unwrap().port();

        let provider = Arc::new(NextAvailableDestinations::new());
        provider.add("127.0.0.1", dead_port);
        provider.add("127.0.0.1", live_port);

        let mut connector = Connector::new(provider.clone());

        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        connector.on_connect_failure(Box::new(move |_host, _port, _e| {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        let connected = drive_to_completion(&mut connector).unwrap();
        assert_eq!(connected.endpoint.port(), live_port);

        // the dead destination reported its failure into the chain
        assert_eq!(provider.valid_ndx(), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhaustion_reports_last_error() {
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let provider = Arc::new(FirstAvailableDestinations::new());
        provider.add("127.0.0.1", dead_port);

        let mut connector = Connector::new(provider);

        let result = loop {
            match connector.connect() {
                Ok(ConnectStep::Done(_)) => panic!("connect should fail"),
                Ok(ConnectStep::InProgress) => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => break e,
            }
        };

        match result {
            ConnectError::Exhausted(_) => {}
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_refresh_supplies_destinations() {
        // a dead initial destination, a live refreshed one
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider = Arc::new(RefreshingProvider::with_refresh(
            vec![TcpAddress::new("127.0.0.1", dead_port)],
            vec![TcpAddress::new("127.0.0.1", port)],
        ));

        let mut connector = Connector::new(provider.clone());

        let connected = drive_to_completion(&mut connector).unwrap();
        assert_eq!(connected.endpoint.port(), port);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refreshed_empty_list_terminates() {
        // a refresh may answer Some(vec![]): that is a terminal "nothing
        // left", not an invitation to re-fetch
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let provider = Arc::new(RefreshingProvider::with_refresh(
            vec![TcpAddress::new("127.0.0.1", dead_port)],
            Vec::new(),
        ));

        let mut connector = Connector::new(provider.clone());

        let result = loop {
            match connector.connect() {
                Ok(ConnectStep::Done(_)) => panic!("connect should fail"),
                Ok(ConnectStep::InProgress) => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => break e,
            }
        };

        match result {
            ConnectError::NoDestinations => {}
            other => panic!("expected NoDestinations, got {:?}", other),
        }

        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quarantined_destinations_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider = Arc::new(FirstAvailableDestinations::new());
        provider.add("192.0.2.1", 1); // TEST-NET, quarantined below
        provider.add("127.0.0.1", port);

        provider
            .notifier()
            .register_query_quarantined(Box::new(|addr| addr.address == "192.0.2.1"));

        let mut connector = Connector::new(provider);
        let connected = drive_to_completion(&mut connector).unwrap();
        assert_eq!(connected.endpoint.port(), port);
    }

    #[test]
    fn test_unresolvable_destination_advances() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider = Arc::new(NextAvailableDestinations::new());
        provider.add("host.invalid.", 3306);
        provider.add("127.0.0.1", port);

        let mut connector = Connector::new(provider.clone());
        let connected = drive_to_completion(&mut connector).unwrap();
        assert_eq!(connected.endpoint.port(), port);

        // resolve failure was reported as a connect error
        assert_eq!(provider.valid_ndx(), 1);
    }
}
