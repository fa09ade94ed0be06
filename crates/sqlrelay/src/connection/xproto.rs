// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! X-protocol per-connection state machine.
//!
//! One client connection plus zero-or-one server connection, driven as a
//! cooperative coroutine: every function below performs one I/O request and
//! returns a [`Step`]. The reactor resumes the machine when the wanted I/O
//! is ready.
//!
//! The machine takes part in capability negotiation and TLS switching and
//! forwards everything else frame-by-frame. Commands dispatch through one
//! generic forward path parameterized by [`CmdKind`]; the matching
//! server-response loop keeps forwarding non-terminal messages (notices,
//! column metadata, rows, fetch-done markers) and hands control back to the
//! client on a terminal Ok/Error/StmtOk.
//!
//! TLS negotiation follows the route's mode pair:
//!
//! | source      | dest       | behavior                                     |
//! |-------------|------------|----------------------------------------------|
//! | DISABLED    | any        | refuse the client's tls capability           |
//! | REQUIRED    | any        | force client-side TLS; auth requires it      |
//! | PREFERRED   | AS_CLIENT  | both sides TLS if the backend offers it      |
//! | PREFERRED   | other      | client on request, server per dest mode      |
//! | PASSTHROUGH | (ignored)  | forward TLS records, never decrypt           |

use std::io;
use std::sync::Arc;
use std::time::Instant;

use crate::channel::{Channel, FlushResult};
use crate::connection::{ConnectionHandle, IoWant, RunResult};
use crate::connector::{ConnectStep, Connector};
use crate::context::{client_ip_key, RoutingContext};
use crate::destination::DestinationProvider;
use crate::protocol::xmessages::{
    self, capabilities_set_tls, capability_tls, encode_error_frame, Capabilities, CapabilitiesGet,
    CapabilitiesSet, Severity, CR_CONNECTION_ERROR, ER_SECURE_TRANSPORT_REQUIRED,
    ER_X_BAD_MESSAGE, ER_X_CAPABILITIES_PREPARE_FAILED,
    ER_X_CAPABILITY_COMPRESSION_INVALID_ALGORITHM,
};
use crate::protocol::xproto::{
    self, ClientMessageType, CodecError, ServerMessageType, XProtocolState, FORWARD_CHUNK_SIZE,
};
use crate::routing::SslMode;
use crate::tls::{peek_record_header, TlsResult, TLS_ALERT_LEVEL_FATAL, TLS_RECORD_HEADER_SIZE};

use prost::Message;

// ============================================================================
// Commands
// ============================================================================

/// Client commands that forward through the generic path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdKind {
    CapGet,
    CapSet,
    /// CapabilitiesSet{tls} forwarded verbatim in passthrough mode.
    SwitchTlsPassthrough,
    SessAuthStart,
    StmtExecute,
    CrudFind,
    CrudDelete,
    CrudInsert,
    CrudUpdate,
    PreparePrepare,
    PrepareDeallocate,
    PrepareExecute,
    ExpectOpen,
    ExpectClose,
    CrudCreateView,
    CrudModifyView,
    CrudDropView,
    CursorOpen,
    CursorFetch,
    CursorClose,
    SessionReset,
    SessionClose,
}

/// Where control goes after the current server response was forwarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResponseEnd {
    /// Non-terminal: read the next server message.
    Loop,

    /// Terminal: back to the client command loop.
    Last,

    /// Terminal Ok of the passthrough TLS switch: start record forwarding.
    TlsInit,

    /// Auth challenge: the client answers next.
    AuthContinue,
}

/// Classification of a server message for a given command.
enum ResponseAction {
    Forward,
    ForwardLast,
    ForwardThenTls,
    AuthContinue,
    Bad,
}

fn classify_response(kind: CmdKind, msg_type: u8) -> ResponseAction {
    use ServerMessageType as S;

    let msg = match S::from_byte(msg_type) {
        Some(msg) => msg,
        None => return ResponseAction::Bad,
    };

    match kind {
        CmdKind::CapGet => match msg {
            S::Notice => ResponseAction::Forward,
            S::ConnCapabilities => ResponseAction::ForwardLast,
            _ => ResponseAction::Bad,
        },
        CmdKind::CapSet => match msg {
            S::Notice => ResponseAction::Forward,
            S::Ok | S::Error => ResponseAction::ForwardLast,
            _ => ResponseAction::Bad,
        },
        CmdKind::SwitchTlsPassthrough => match msg {
            S::Notice => ResponseAction::Forward,
            S::Error => ResponseAction::ForwardLast,
            // server side accepted TLS; records follow
            S::Ok => ResponseAction::ForwardThenTls,
            _ => ResponseAction::Bad,
        },
        CmdKind::SessAuthStart => match msg {
            S::Notice => ResponseAction::Forward,
            S::SessAuthenticateContinue => ResponseAction::AuthContinue,
            S::SessAuthenticateOk | S::Error => ResponseAction::ForwardLast,
            _ => ResponseAction::Bad,
        },
        _ => match msg {
            S::Notice
            | S::ResultsetColumnMetaData
            | S::ResultsetRow
            | S::ResultsetFetchDone
            | S::ResultsetFetchSuspended
            | S::ResultsetFetchDoneMoreResultsets
            | S::ResultsetFetchDoneMoreOutParams => ResponseAction::Forward,
            S::SqlStmtExecuteOk | S::Ok | S::Error => ResponseAction::ForwardLast,
            _ => ResponseAction::Bad,
        },
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Next-step identifiers; each performs one I/O request and returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Function {
    ClientRecvCmd,

    // client-side TLS termination
    TlsAcceptInit,
    TlsAccept,
    TlsAcceptFinalize,

    // server-side TLS
    ServerInitTls,
    ServerSendSwitchToTls,
    ServerRecvSwitchTlsResponse,
    TlsConnectInit,
    TlsConnect,

    // capability probe against the server
    ServerSendCheckCaps,
    ServerRecvCheckCapsResponse,

    // raw TLS record passthrough
    ForwardTlsInit,
    ForwardTls,

    // generic command forwarding
    ForwardCmd(CmdKind),
    ServerRecvResponse(CmdKind),
    ForwardResponse(CmdKind, ResponseEnd),
    ClientRecvAuthContinue,

    // buffered sends; continue at after_send_{client,server}
    SendToClientBuffered,
    SendToServerBuffered,

    Connect,
    WaitClientClose,
    Finish,
}

/// What a single step decided.
enum Step {
    Next(Function),
    Suspend(IoWant),
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeadlineKind {
    ClientHandshake,
    Connect,
    Idle,
}

// ============================================================================
// Connection
// ============================================================================

/// One routed X-protocol connection.
pub struct XConnection {
    context: Arc<RoutingContext>,
    provider: Arc<dyn DestinationProvider>,
    handle: Arc<ConnectionHandle>,

    client: Channel,
    client_state: XProtocolState,

    server: Option<Channel>,
    server_state: XProtocolState,

    connector: Option<Connector>,
    server_io_serial: u64,

    func: Function,
    after_send_client: Function,
    after_send_server: Function,

    /// Authentication finished; quarantine counting stops here.
    auth_done: bool,

    deadline: Option<(Instant, DeadlineKind)>,
    failure_counted: bool,
}

impl XConnection {
    pub fn new(
        context: Arc<RoutingContext>,
        provider: Arc<dyn DestinationProvider>,
        handle: Arc<ConnectionHandle>,
        client: Channel,
    ) -> Self {
        // in passthrough the backend leg must exist before the first
        // client message can be forwarded; otherwise the router itself
        // answers the session setup
        let func = if context.source_ssl_mode() == SslMode::Passthrough {
            Function::Connect
        } else {
            Function::ClientRecvCmd
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
            client_state: XProtocolState::new(),
            server: None,
            server_state: XProtocolState::new(),
            connector: None,
            server_io_serial: 0,
            func,
            after_send_client: Function::ClientRecvCmd,
            after_send_server: Function::ClientRecvCmd,
            auth_done: false,
            deadline,
            failure_counted: false,
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    pub fn client_stream_mut(&mut self) -> &mut dyn crate::channel::ByteStream {
        self.client.stream_mut()
    }

    /// Server-side socket (pending connect or established) plus its
    /// registration serial.
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

    #[cfg(test)]
    pub(crate) fn channels_are_tls(&self) -> (bool, bool) {
        (
            self.client.is_tls(),
            self.server.as_ref().map(Channel::is_tls).unwrap_or(false),
        )
    }

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
                    "[{}] client {} did not finish the session setup in time",
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
                Function::ClientRecvCmd => self.client_recv_cmd(),

                Function::TlsAcceptInit => self.tls_accept_init(),
                Function::TlsAccept => self.tls_accept(),
                Function::TlsAcceptFinalize => self.tls_accept_finalize(),

                Function::ServerInitTls => self.server_init_tls(),
                Function::ServerSendSwitchToTls => self.server_send_switch_to_tls(),
                Function::ServerRecvSwitchTlsResponse => self.server_recv_switch_tls_response(),
                Function::TlsConnectInit => self.tls_connect_init(),
                Function::TlsConnect => self.tls_connect(),

                Function::ServerSendCheckCaps => self.server_send_check_caps(),
                Function::ServerRecvCheckCapsResponse => self.server_recv_check_caps_response(),

                Function::ForwardTlsInit => self.forward_tls_init(),
                Function::ForwardTls => self.forward_tls(),

                Function::ForwardCmd(kind) => self.forward_cmd(kind),
                Function::ServerRecvResponse(kind) => self.server_recv_response(kind),
                Function::ForwardResponse(kind, end) => self.forward_response(kind, end),
                Function::ClientRecvAuthContinue => {
                    Step::Next(Function::ForwardCmd(CmdKind::SessAuthStart))
                }

                Function::SendToClientBuffered => self.send_to_client_buffered(),
                Function::SendToServerBuffered => self.send_to_server_buffered(),

                Function::Connect => self.connect(),
                Function::WaitClientClose => Step::Next(Function::Finish),
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
    // Client command dispatch
    // ========================================================================

    fn client_recv_cmd(&mut self) -> Step {
        match xproto::ensure_has_msg_prefix(&mut self.client, &mut self.client_state) {
            Err(CodecError::WantRead) => {
                if self.auth_done && !self.context.wait_timeout().is_zero() {
                    self.deadline = Some((
                        Instant::now() + self.context.wait_timeout(),
                        DeadlineKind::Idle,
                    ));
                }
                return Step::Suspend(IoWant::RecvClient);
            }
            Err(CodecError::BadMessage) => return self.client_bad_message(),
            Err(CodecError::Io(e)) => return self.client_failed(&e),
            Ok(()) => {}
        }

        let msg_type = self.client_state.current_msg_type.expect("prefix ensured");

        use ClientMessageType as C;
        let msg = match C::from_byte(msg_type) {
            Some(msg) => msg,
            None => return self.client_bad_message(),
        };

        // session-setup messages work without a backend; everything else
        // needs the server connection in place
        let is_setup = matches!(
            msg,
            C::CapabilitiesGet | C::CapabilitiesSet | C::SessAuthenticateStart
        );
        if !is_setup && self.server.is_none() {
            return self.client_bad_message();
        }

        match msg {
            C::ConClose => self.client_con_close(),
            C::CapabilitiesGet => self.client_cap_get(),
            C::CapabilitiesSet => self.client_cap_set(),
            C::SessAuthenticateStart => self.client_sess_auth_start(),

            C::SessReset => Step::Next(Function::ForwardCmd(CmdKind::SessionReset)),
            C::SessClose => Step::Next(Function::ForwardCmd(CmdKind::SessionClose)),
            C::StmtExecute => Step::Next(Function::ForwardCmd(CmdKind::StmtExecute)),
            C::CrudFind => Step::Next(Function::ForwardCmd(CmdKind::CrudFind)),
            C::CrudInsert => Step::Next(Function::ForwardCmd(CmdKind::CrudInsert)),
            C::CrudUpdate => Step::Next(Function::ForwardCmd(CmdKind::CrudUpdate)),
            C::CrudDelete => Step::Next(Function::ForwardCmd(CmdKind::CrudDelete)),
            C::PreparePrepare => Step::Next(Function::ForwardCmd(CmdKind::PreparePrepare)),
            C::PrepareExecute => Step::Next(Function::ForwardCmd(CmdKind::PrepareExecute)),
            C::PrepareDeallocate => Step::Next(Function::ForwardCmd(CmdKind::PrepareDeallocate)),
            C::ExpectOpen => Step::Next(Function::ForwardCmd(CmdKind::ExpectOpen)),
            C::ExpectClose => Step::Next(Function::ForwardCmd(CmdKind::ExpectClose)),
            C::CrudCreateView => Step::Next(Function::ForwardCmd(CmdKind::CrudCreateView)),
            C::CrudModifyView => Step::Next(Function::ForwardCmd(CmdKind::CrudModifyView)),
            C::CrudDropView => Step::Next(Function::ForwardCmd(CmdKind::CrudDropView)),
            C::CursorOpen => Step::Next(Function::ForwardCmd(CmdKind::CursorOpen)),
            C::CursorFetch => Step::Next(Function::ForwardCmd(CmdKind::CursorFetch)),
            C::CursorClose => Step::Next(Function::ForwardCmd(CmdKind::CursorClose)),

            // auth-continue outside the auth exchange, compression frames
            C::SessAuthenticateContinue | C::Compression => self.client_bad_message(),
        }
    }

    /// Ensure the full current client message is buffered.
    fn ensure_full_client_msg(&mut self) -> Option<Step> {
        match xproto::ensure_has_full_frame(&mut self.client, &mut self.client_state) {
            Err(CodecError::WantRead) => Some(Step::Suspend(IoWant::RecvClient)),
            Err(CodecError::BadMessage) => Some(self.client_bad_message()),
            Err(CodecError::Io(e)) => Some(self.client_failed(&e)),
            Ok(()) => None,
        }
    }

    fn client_con_close(&mut self) -> Step {
        if let Some(step) = self.ensure_full_client_msg() {
            return step;
        }

        xproto::discard_current_msg(&mut self.client, &mut self.client_state);

        let ok = xmessages::encode_frame(&xmessages::Ok {
            msg: Some("bye!".to_string()),
        });
        self.send_to_client(&ok, Function::WaitClientClose)
    }

    /// Client asks for the capabilities; answer with the router's.
    fn client_cap_get(&mut self) -> Step {
        if let Some(step) = self.ensure_full_client_msg() {
            return step;
        }

        let payload = xproto::current_msg_payload(&self.client, &self.client_state).to_vec();
        if CapabilitiesGet::decode(&payload[..]).is_err() {
            return self.client_bad_message();
        }

        if self.context.source_ssl_mode() == SslMode::Passthrough {
            return Step::Next(Function::ForwardCmd(CmdKind::CapGet));
        }

        let mut caps = Capabilities::default();
        match self.context.source_ssl_mode() {
            SslMode::Disabled => {}
            SslMode::Preferred | SslMode::Required => {
                caps.capabilities.push(capability_tls(true));
            }
            SslMode::Passthrough | SslMode::Default | SslMode::AsClient => unreachable!(),
        }

        xproto::discard_current_msg(&mut self.client, &mut self.client_state);

        let frame = xmessages::encode_frame(&caps);
        self.send_to_client(&frame, Function::ClientRecvCmd)
    }

    /// Client sets capabilities; only `tls` is negotiable.
    fn client_cap_set(&mut self) -> Step {
        if let Some(step) = self.ensure_full_client_msg() {
            return step;
        }

        let payload = xproto::current_msg_payload(&self.client, &self.client_state).to_vec();
        let msg = match CapabilitiesSet::decode(&payload[..]) {
            Ok(msg) => msg,
            Err(_) => return self.client_bad_message(),
        };

        let mut msg_is_broken = false;
        let mut switch_to_tls = false;
        let mut has_cap_compression = false;

        match &msg.capabilities {
            None => msg_is_broken = true,
            Some(caps) => {
                for cap in &caps.capabilities {
                    let (name, value) = match (&cap.name, &cap.value) {
                        (Some(name), Some(value)) => (name.as_str(), value),
                        _ => {
                            msg_is_broken = true;
                            break;
                        }
                    };

                    if name == "tls" {
                        let tls_value = (value.r#type == xmessages::Any::TYPE_SCALAR)
                            .then_some(value.scalar.as_ref())
                            .flatten()
                            .and_then(|s| {
                                (s.r#type == xmessages::Scalar::TYPE_V_BOOL)
                                    .then_some(s.v_bool)
                                    .flatten()
                            });

                        match tls_value {
                            Some(v) => switch_to_tls = v,
                            None => {
                                msg_is_broken = true;
                                break;
                            }
                        }
                    } else if name == "compression" {
                        has_cap_compression = true;
                    }
                }
            }
        }

        if msg_is_broken {
            xproto::discard_current_msg(&mut self.client, &mut self.client_state);

            let frame = encode_error_frame(
                ER_X_CAPABILITIES_PREPARE_FAILED,
                "Capability prepare failed for 'tls'",
                "HY000",
                Severity::Error,
            );
            return self.send_to_client(&frame, Function::ClientRecvCmd);
        }

        if has_cap_compression {
            xproto::discard_current_msg(&mut self.client, &mut self.client_state);

            let frame = encode_error_frame(
                ER_X_CAPABILITY_COMPRESSION_INVALID_ALGORITHM,
                "Invalid or unsupported value for 'compression.algorithm'",
                "HY000",
                Severity::Error,
            );
            return self.send_to_client(&frame, Function::ClientRecvCmd);
        }

        if !switch_to_tls {
            xproto::discard_current_msg(&mut self.client, &mut self.client_state);

            let frame = xmessages::encode_frame(&xmessages::Ok::default());
            return self.send_to_client(&frame, Function::ClientRecvCmd);
        }

        let continue_with_tls = match self.context.source_ssl_mode() {
            SslMode::Disabled => false,
            SslMode::Required => true,
            SslMode::Preferred => match self.context.dest_ssl_mode() {
                SslMode::AsClient => {
                    if self.server.is_none() {
                        // leave the client message in place and connect;
                        // the same message is processed on the next round
                        return Step::Next(Function::Connect);
                    }

                    // only if the backend advertises TLS
                    self.server_state
                        .server_caps
                        .as_ref()
                        .is_some_and(|caps| caps.has("tls"))
                }
                _ => true,
            },
            SslMode::Passthrough => {
                return Step::Next(Function::ForwardCmd(CmdKind::SwitchTlsPassthrough));
            }
            SslMode::Default | SslMode::AsClient => unreachable!(),
        };

        xproto::discard_current_msg(&mut self.client, &mut self.client_state);

        if !continue_with_tls {
            let frame = encode_error_frame(
                ER_X_CAPABILITIES_PREPARE_FAILED,
                "Capability prepare failed for 'tls'",
                "HY000",
                Severity::Error,
            );
            return self.send_to_client(&frame, Function::ClientRecvCmd);
        }

        let frame = xmessages::encode_frame(&xmessages::Ok::default());
        self.send_to_client(&frame, Function::TlsAcceptInit)
    }

    fn client_sess_auth_start(&mut self) -> Step {
        // require TLS before authentication is started
        if self.context.source_ssl_mode() == SslMode::Required && !self.client.has_tls_session() {
            let frame = encode_error_frame(
                ER_X_CAPABILITIES_PREPARE_FAILED,
                "Client requires TLS",
                "HY000",
                Severity::Fatal,
            );
            return self.send_to_client(&frame, Function::Finish);
        }

        if self.server.is_none() {
            // leave the client message in place and connect to the backend
            return Step::Next(Function::Connect);
        }

        Step::Next(Function::ForwardCmd(CmdKind::SessAuthStart))
    }

    // ========================================================================
    // Client-side TLS termination
    // ========================================================================

    fn tls_accept_init(&mut self) -> Step {
        let config = match self.context.tls().server_config() {
            Some(config) => config,
            None => {
                log::warn!("[{}] no TLS server configuration", self.context.name());
                return Step::Next(Function::Finish);
            }
        };

        if let Err(e) = self.client.init_tls_accept(config) {
            log::warn!("[{}] TLS accept setup failed: {}", self.context.name(), e);
            return Step::Next(Function::Finish);
        }

        Step::Next(Function::TlsAccept)
    }

    fn tls_accept(&mut self) -> Step {
        match self.client.tls_accept() {
            Ok(TlsResult::Finished) => {
                if !self.client.send_buffer().is_empty() {
                    self.after_send_client = Function::TlsAcceptFinalize;
                    return Step::Next(Function::SendToClientBuffered);
                }
                Step::Next(Function::TlsAcceptFinalize)
            }
            Ok(TlsResult::WantWrite) => {
                self.after_send_client = Function::TlsAccept;
                Step::Next(Function::SendToClientBuffered)
            }
            Ok(TlsResult::WantRead) => {
                if !self.client.send_buffer().is_empty() {
                    self.after_send_client = Function::TlsAccept;
                    return Step::Next(Function::SendToClientBuffered);
                }
                Step::Suspend(IoWant::RecvClient)
            }
            Err(e) => {
                log::debug!("[{}] tls-accept failed: {}", self.context.name(), e);
                self.count_handshake_failure();
                Step::Next(Function::Finish)
            }
        }
    }

    fn tls_accept_finalize(&mut self) -> Step {
        if self.server.is_none() {
            return Step::Next(Function::Connect);
        }

        let server_has_tls = self
            .server
            .as_ref()
            .is_some_and(Channel::has_tls_session);

        if self.context.source_ssl_mode() == SslMode::Preferred
            && self.context.dest_ssl_mode() == SslMode::AsClient
            && self.client.has_tls_session()
            && !server_has_tls
        {
            return Step::Next(Function::ServerInitTls);
        }

        Step::Next(Function::ClientRecvCmd)
    }

    // ========================================================================
    // Server-side TLS
    // ========================================================================

    /// Decide the server leg's TLS fate right after connect (and again
    /// after a client-side TLS upgrade in PREFERRED/AS_CLIENT).
    fn server_init_tls(&mut self) -> Step {
        let server_has_tls = self
            .server
            .as_ref()
            .is_some_and(Channel::has_tls_session);

        match self.context.dest_ssl_mode() {
            SslMode::AsClient => match self.context.source_ssl_mode() {
                SslMode::Preferred => {
                    if self.client.has_tls_session() {
                        Step::Next(Function::ServerSendSwitchToTls)
                    } else {
                        Step::Next(Function::ServerSendCheckCaps)
                    }
                }
                SslMode::Passthrough | SslMode::Disabled => Step::Next(Function::ClientRecvCmd),
                SslMode::Required => {
                    if server_has_tls {
                        Step::Next(Function::ClientRecvCmd)
                    } else {
                        Step::Next(Function::ServerSendSwitchToTls)
                    }
                }
                SslMode::Default | SslMode::AsClient => unreachable!(),
            },
            SslMode::Required | SslMode::Preferred => {
                if server_has_tls {
                    Step::Next(Function::ClientRecvCmd)
                } else {
                    Step::Next(Function::ServerSendSwitchToTls)
                }
            }
            SslMode::Disabled => Step::Next(Function::ClientRecvCmd),
            SslMode::Passthrough | SslMode::Default => unreachable!(),
        }
    }

    fn server_send_switch_to_tls(&mut self) -> Step {
        let frame = xmessages::encode_frame(&capabilities_set_tls(true));
        self.send_to_server(&frame, Function::ServerRecvSwitchTlsResponse)
    }

    fn server_send_check_caps(&mut self) -> Step {
        let frame = xmessages::encode_frame(&CapabilitiesGet {});
        self.send_to_server(&frame, Function::ServerRecvCheckCapsResponse)
    }

    fn server_recv_check_caps_response(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        match xproto::ensure_has_msg_prefix(server, &mut self.server_state) {
            Err(CodecError::WantRead) => return Step::Suspend(IoWant::RecvServer),
            Err(CodecError::BadMessage) => return self.server_bad_message(),
            Err(CodecError::Io(e)) => return self.server_failed(&e),
            Ok(()) => {}
        }

        match xproto::ensure_has_full_frame(server, &mut self.server_state) {
            Err(CodecError::WantRead) => return Step::Suspend(IoWant::RecvServer),
            Err(CodecError::BadMessage) => return self.server_bad_message(),
            Err(CodecError::Io(e)) => return self.server_failed(&e),
            Ok(()) => {}
        }

        let msg_type = self.server_state.current_msg_type.expect("prefix ensured");

        use ServerMessageType as S;
        match S::from_byte(msg_type) {
            Some(S::Notice) => {
                xproto::discard_current_msg(server, &mut self.server_state);
                Step::Next(Function::ServerRecvCheckCapsResponse)
            }
            Some(S::ConnCapabilities) => {
                let payload = xproto::current_msg_payload(server, &self.server_state).to_vec();
                let caps = match Capabilities::decode(&payload[..]) {
                    Ok(caps) => caps,
                    Err(_) => return self.server_bad_message(),
                };

                self.server_state.server_caps = Some(caps);
                xproto::discard_current_msg(
                    self.server.as_mut().expect("server connected"),
                    &mut self.server_state,
                );

                Step::Next(Function::ClientRecvCmd)
            }
            _ => self.server_bad_message(),
        }
    }

    fn server_recv_switch_tls_response(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        match xproto::ensure_has_msg_prefix(server, &mut self.server_state) {
            Err(CodecError::WantRead) => return Step::Suspend(IoWant::RecvServer),
            Err(CodecError::BadMessage) => return self.server_bad_message(),
            Err(CodecError::Io(e)) => return self.server_failed(&e),
            Ok(()) => {}
        }

        match xproto::ensure_has_full_frame(server, &mut self.server_state) {
            Err(CodecError::WantRead) => return Step::Suspend(IoWant::RecvServer),
            Err(CodecError::BadMessage) => return self.server_bad_message(),
            Err(CodecError::Io(e)) => return self.server_failed(&e),
            Ok(()) => {}
        }

        let msg_type = self.server_state.current_msg_type.expect("prefix ensured");

        use ServerMessageType as S;
        match S::from_byte(msg_type) {
            Some(S::Notice) => {
                xproto::discard_current_msg(server, &mut self.server_state);
                Step::Next(Function::ServerRecvSwitchTlsResponse)
            }
            Some(S::Error) => {
                xproto::discard_current_msg(server, &mut self.server_state);

                match self.context.dest_ssl_mode() {
                    SslMode::Preferred => {
                        // enabling TLS failed, that's ok
                        Step::Next(Function::ClientRecvCmd)
                    }
                    SslMode::AsClient | SslMode::Required => {
                        let frame = encode_error_frame(
                            ER_SECURE_TRANSPORT_REQUIRED,
                            "Server needs TLS",
                            "HY000",
                            Severity::Fatal,
                        );
                        self.send_to_client(&frame, Function::Finish)
                    }
                    SslMode::Disabled | SslMode::Passthrough | SslMode::Default => unreachable!(),
                }
            }
            Some(S::Ok) => {
                // server side accepted; handshake next
                xproto::discard_current_msg(server, &mut self.server_state);
                Step::Next(Function::TlsConnectInit)
            }
            _ => self.server_bad_message(),
        }
    }

    fn tls_connect_init(&mut self) -> Step {
        let config = match self.context.tls().client_config() {
            Some(config) => config,
            None => {
                log::warn!("[{}] no TLS client configuration", self.context.name());
                return self.server_failed(&io::Error::other("no TLS client configuration"));
            }
        };

        let server_name = self
            .handle
            .server_address()
            .map(|addr| addr.address)
            .unwrap_or_default();

        let server = self.server.as_mut().expect("server connected");
        if let Err(e) = server.init_tls_connect(config, &server_name) {
            log::warn!("[{}] TLS connect setup failed: {}", self.context.name(), e);
            return self.server_failed(&e);
        }

        Step::Next(Function::TlsConnect)
    }

    fn tls_connect(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        match server.tls_connect() {
            Ok(TlsResult::Finished) => {
                if !server.send_buffer().is_empty() {
                    self.after_send_server = Function::ClientRecvCmd;
                    return Step::Next(Function::SendToServerBuffered);
                }
                Step::Next(Function::ClientRecvCmd)
            }
            Ok(TlsResult::WantWrite) => {
                self.after_send_server = Function::TlsConnect;
                Step::Next(Function::SendToServerBuffered)
            }
            Ok(TlsResult::WantRead) => {
                if !server.send_buffer().is_empty() {
                    self.after_send_server = Function::TlsConnect;
                    return Step::Next(Function::SendToServerBuffered);
                }
                Step::Suspend(IoWant::RecvServer)
            }
            Err(e) => {
                // cert-verification failed, no shared cipher, ...
                let frame = encode_error_frame(
                    CR_CONNECTION_ERROR,
                    &format!("connecting to destination failed with TLS error: {}", e),
                    "HY000",
                    Severity::Fatal,
                );
                self.send_to_client(&frame, Function::Finish)
            }
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

                // the session-setup clock keeps running until auth is done
                self.deadline = if self.auth_done {
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
                self.server_state = XProtocolState::new();
                self.connector = None;

                Step::Next(Function::ServerInitTls)
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

                let frame = encode_error_frame(
                    CR_CONNECTION_ERROR,
                    "connecting to backend failed",
                    "HY000",
                    Severity::Error,
                );
                self.send_to_client(&frame, Function::Finish)
            }
        }
    }

    // ========================================================================
    // Generic forwarding
    // ========================================================================

    fn forward_cmd(&mut self, kind: CmdKind) -> Step {
        let server = self.server.as_mut().expect("server connected");

        match forward_frame(&mut self.client, &mut self.client_state, server) {
            Ok((done, moved)) => {
                self.handle.stats().add_up(moved as u64);
                self.after_send_server = if done {
                    Function::ServerRecvResponse(kind)
                } else {
                    Function::ForwardCmd(kind)
                };
                Step::Next(Function::SendToServerBuffered)
            }
            Err(CodecError::WantRead) => {
                if !server.send_buffer().is_empty() {
                    self.after_send_server = Function::ForwardCmd(kind);
                    return Step::Next(Function::SendToServerBuffered);
                }
                Step::Suspend(IoWant::RecvClient)
            }
            Err(CodecError::BadMessage) => self.client_bad_message(),
            Err(CodecError::Io(e)) => self.client_failed(&e),
        }
    }

    fn server_recv_response(&mut self, kind: CmdKind) -> Step {
        let server = self.server.as_mut().expect("server connected");

        match xproto::ensure_has_msg_prefix(server, &mut self.server_state) {
            Err(CodecError::WantRead) => return Step::Suspend(IoWant::RecvServer),
            Err(CodecError::BadMessage) => return self.server_bad_message(),
            Err(CodecError::Io(e)) => return self.server_failed(&e),
            Ok(()) => {}
        }

        let msg_type = self.server_state.current_msg_type.expect("prefix ensured");

        match classify_response(kind, msg_type) {
            ResponseAction::Forward => {
                Step::Next(Function::ForwardResponse(kind, ResponseEnd::Loop))
            }
            ResponseAction::ForwardLast => {
                if kind == CmdKind::SessAuthStart
                    && msg_type == ServerMessageType::SessAuthenticateOk.byte()
                {
                    self.auth_done = true;
                    self.deadline = None;
                }
                Step::Next(Function::ForwardResponse(kind, ResponseEnd::Last))
            }
            ResponseAction::ForwardThenTls => {
                Step::Next(Function::ForwardResponse(kind, ResponseEnd::TlsInit))
            }
            ResponseAction::AuthContinue => {
                Step::Next(Function::ForwardResponse(kind, ResponseEnd::AuthContinue))
            }
            ResponseAction::Bad => self.server_bad_message(),
        }
    }

    fn forward_response(&mut self, kind: CmdKind, end: ResponseEnd) -> Step {
        let server = self.server.as_mut().expect("server connected");

        match forward_frame(server, &mut self.server_state, &mut self.client) {
            Ok((done, moved)) => {
                self.handle.stats().add_down(moved as u64);
                self.after_send_client = if done {
                    match end {
                        ResponseEnd::Loop => Function::ServerRecvResponse(kind),
                        ResponseEnd::Last => Function::ClientRecvCmd,
                        ResponseEnd::TlsInit => Function::ForwardTlsInit,
                        ResponseEnd::AuthContinue => Function::ClientRecvAuthContinue,
                    }
                } else {
                    Function::ForwardResponse(kind, end)
                };
                Step::Next(Function::SendToClientBuffered)
            }
            Err(CodecError::WantRead) => {
                if !self.client.send_buffer().is_empty() {
                    self.after_send_client = Function::ForwardResponse(kind, end);
                    return Step::Next(Function::SendToClientBuffered);
                }
                Step::Suspend(IoWant::RecvServer)
            }
            Err(CodecError::BadMessage) => self.server_bad_message(),
            Err(CodecError::Io(e)) => self.server_failed(&e),
        }
    }

    // ========================================================================
    // TLS record passthrough
    // ========================================================================

    fn forward_tls_init(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        self.client.set_is_tls(true);
        server.set_is_tls(true);

        Step::Next(Function::ForwardTls)
    }

    /// Bidirectional TLS record forwarding; records are delimited, never
    /// decrypted. A fatal alert drops both sides back to cleartext.
    fn forward_tls(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        if let Err(e) = forward_tls_records(&mut self.client, server) {
            return self.client_failed(&e);
        }
        match server.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => return Step::Suspend(IoWant::SendServer),
            Ok(_) => {}
            Err(e) => return self.server_failed(&e),
        }

        if let Err(e) = forward_tls_records(server, &mut self.client) {
            return self.server_failed(&e);
        }
        match self.client.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => return Step::Suspend(IoWant::SendClient),
            Ok(_) => {}
            Err(e) => return self.client_failed(&e),
        }

        Step::Suspend(IoWant::RecvEither)
    }

    // ========================================================================
    // Buffered sends
    // ========================================================================

    fn send_to_client(&mut self, frame: &[u8], next: Function) -> Step {
        if self.client.write(frame).is_err() {
            return Step::Next(Function::Finish);
        }
        let _ = self.client.flush_to_send_buf();

        self.after_send_client = next;
        Step::Next(Function::SendToClientBuffered)
    }

    fn send_to_server(&mut self, frame: &[u8], next: Function) -> Step {
        let server = self.server.as_mut().expect("server connected");

        if server.write(frame).is_err() {
            return Step::Next(Function::Finish);
        }
        let _ = server.flush_to_send_buf();

        self.after_send_server = next;
        Step::Next(Function::SendToServerBuffered)
    }

    fn send_to_client_buffered(&mut self) -> Step {
        match self.client.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => Step::Suspend(IoWant::SendClient),
            Ok(_) => Step::Next(self.after_send_client),
            Err(e) => self.client_failed(&e),
        }
    }

    fn send_to_server_buffered(&mut self) -> Step {
        let server = self.server.as_mut().expect("server connected");

        match server.flush_to_socket() {
            Ok(FlushResult::WouldBlock) => Step::Suspend(IoWant::SendServer),
            Ok(_) => Step::Next(self.after_send_server),
            Err(e) => self.server_failed(&e),
        }
    }

    // ========================================================================
    // Failure and teardown
    // ========================================================================

    /// Unexpected or unparsable client message: fatal error, close.
    fn client_bad_message(&mut self) -> Step {
        if !self.auth_done {
            self.count_handshake_failure();
        }

        let frame = encode_error_frame(ER_X_BAD_MESSAGE, "Bad Message", "HY000", Severity::Fatal);
        self.send_to_client(&frame, Function::Finish)
    }

    /// Server answered outside the expected set for the current state.
    fn server_bad_message(&mut self) -> Step {
        let frame = encode_error_frame(ER_X_BAD_MESSAGE, "Bad Message", "HY000", Severity::Fatal);
        self.send_to_client(&frame, Function::Finish)
    }

    fn client_failed(&mut self, e: &io::Error) -> Step {
        if e.kind() != io::ErrorKind::UnexpectedEof {
            log::debug!(
                "[{}] client {} failed: {}",
                self.context.name(),
                self.handle.client_address(),
                e
            );
        }

        if !self.auth_done {
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

    /// Count a failed session setup against the client host. The X protocol
    /// carries no fake-login mirroring; the backend counts by itself.
    fn count_handshake_failure(&mut self) {
        if self.failure_counted {
            return;
        }
        self.failure_counted = true;

        if let Ok(client_addr) = self.client.stream().peer_addr() {
            self.context
                .block_client_host(client_ip_key(&client_addr), &client_addr.to_string());
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

// ============================================================================
// Frame forwarding
// ============================================================================

/// Forward (a chunk of) the current frame from `src` to `dst`'s send side.
///
/// Returns `(frame_is_done, bytes_moved)`. Large frames move in
/// [`FORWARD_CHUNK_SIZE`] pieces so a 16M frame never sits in memory whole.
fn forward_frame(
    src: &mut Channel,
    src_state: &mut XProtocolState,
    dst: &mut Channel,
) -> Result<(bool, usize), CodecError> {
    xproto::ensure_has_msg_prefix(src, src_state)?;

    let frame = src_state.current_frame.expect("prefix ensured");
    let rest = frame.frame_size - frame.forwarded;

    let mut moved = 0usize;
    if rest > 0 {
        let buffered = src.recv_plain_view().len();
        if rest > buffered {
            src.read_to_plain((rest - buffered).min(FORWARD_CHUNK_SIZE))?;
        }

        if src.recv_plain_view().is_empty() {
            return Err(CodecError::WantRead);
        }

        let take = rest.min(src.recv_plain_view().len());
        let chunk = src.recv_plain_view()[..take].to_vec();
        dst.write(&chunk).map_err(CodecError::Io)?;

        src.consume_plain(take);
        moved = take;

        if let Some(frame) = src_state.current_frame.as_mut() {
            frame.forwarded += take;
        }
    }

    let _ = dst.flush_to_send_buf();

    let done = src_state
        .current_frame
        .map(|f| f.is_done())
        .unwrap_or(true);
    if done {
        // frame is forwarded, reset for the next one
        src_state.reset_frame();
    }

    Ok((done, moved))
}

/// Forward whole TLS records from `src` to `dst`'s send side.
///
/// On a fatal alert (level byte 0x02 right after the record header) both
/// channels drop back to cleartext.
fn forward_tls_records(src: &mut Channel, dst: &mut Channel) -> io::Result<usize> {
    let mut moved = 0usize;

    if src.recv_plain_view().len() < TLS_RECORD_HEADER_SIZE {
        src.read_to_plain(TLS_RECORD_HEADER_SIZE - src.recv_plain_view().len())?;
    }

    loop {
        let header = match peek_record_header(src.recv_plain_view()) {
            Some(header) => header,
            None => break,
        };

        let record_len = TLS_RECORD_HEADER_SIZE + header.payload_len as usize;

        if src.recv_plain_view().len() < record_len {
            src.read_to_plain(record_len - src.recv_plain_view().len())?;
            if src.recv_plain_view().len() < record_len {
                // there isn't the full record yet
                break;
            }
        }

        let record = src.recv_plain_view()[..record_len].to_vec();
        dst.write(&record)?;
        src.consume_plain(record_len);
        moved += record_len;

        // a fatal alert inside the handshake drops the connection back to
        // cleartext on both sides
        if header.content_type == crate::tls::TlsContentType::Alert as u8
            && record.len() > TLS_RECORD_HEADER_SIZE
            && record[TLS_RECORD_HEADER_SIZE] == TLS_ALERT_LEVEL_FATAL
        {
            src.set_is_tls(false);
            dst.set_is_tls(false);
        }
    }

    let _ = dst.flush_to_send_buf();

    Ok(moved)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockStream, MockStreamHandle};
    use crate::connection::ConnectionId;
    use crate::context::{RoutingConfig, RoutingContext};
    use crate::destination::FirstAvailableDestinations;
    use crate::protocol::xmessages::Error as XError;
    use std::net::TcpListener;
    use std::time::Duration;

    fn raw_frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + payload.len());
        xproto::encode_frame_header(msg_type, payload.len(), &mut out);
        out.extend_from_slice(payload);
        out
    }

    fn make_context(source: SslMode, dest: SslMode) -> Arc<RoutingContext> {
        Arc::new(RoutingContext::new(RoutingConfig {
            source_ssl_mode: source,
            dest_ssl_mode: dest,
            ..Default::default()
        }))
    }

    fn make_connection(
        context: Arc<RoutingContext>,
        backend_port: Option<u16>,
    ) -> (XConnection, MockStreamHandle) {
        let provider = Arc::new(FirstAvailableDestinations::new());
        if let Some(port) = backend_port {
            provider.add("127.0.0.1", port);
        }

        let stream = MockStream::new();
        let client = stream.handle();
        let addr: std::net::SocketAddr = "127.0.0.1:54322".parse().unwrap();
        let handle = Arc::new(ConnectionHandle::new(ConnectionId(2), &addr, None));

        let channel = Channel::new(Box::new(stream), 16384);
        let conn = XConnection::new(context, provider, handle, channel);

        (conn, client)
    }

    fn drive(conn: &mut XConnection) -> RunResult {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match conn.resume() {
                RunResult::Suspend(IoWant::Connect)
                | RunResult::Suspend(IoWant::RecvServer)
                | RunResult::Suspend(IoWant::SendServer) => {
                    assert!(std::time::Instant::now() < deadline, "stuck");
                    std::thread::sleep(Duration::from_millis(10));
                }
                other => return other,
            }
        }
    }

    fn decode_written_error(written: &[u8]) -> XError {
        assert_eq!(written[4], ServerMessageType::Error.byte());
        XError::decode(&written[5..]).unwrap()
    }

    #[test]
    fn test_cap_get_advertises_tls_when_preferred() {
        let context = make_context(SslMode::Preferred, SslMode::AsClient);
        let (mut conn, client) = make_connection(context, None);

        client.feed_read_data(&xmessages::encode_frame(&CapabilitiesGet {}));

        match conn.resume() {
            RunResult::Suspend(IoWant::RecvClient) => {}
            other => panic!("expected to await the next command, got {:?}", other),
        }

        let written = client.get_written_data();
        assert_eq!(written[4], ServerMessageType::ConnCapabilities.byte());

        let caps = Capabilities::decode(&written[5..]).unwrap();
        assert!(caps.has("tls"));
    }

    #[test]
    fn test_cap_get_empty_when_disabled() {
        let context = make_context(SslMode::Disabled, SslMode::Disabled);
        let (mut conn, client) = make_connection(context, None);

        client.feed_read_data(&xmessages::encode_frame(&CapabilitiesGet {}));
        conn.resume();

        let written = client.get_written_data();
        let caps = Capabilities::decode(&written[5..]).unwrap();
        assert!(caps.capabilities.is_empty());
    }

    #[test]
    fn test_unknown_message_type_is_fatal_bad_message() {
        let context = make_context(SslMode::Preferred, SslMode::AsClient);
        let (mut conn, client) = make_connection(context, None);

        client.feed_read_data(&raw_frame(200, &[0x00]));

        match conn.resume() {
            RunResult::Done => {}
            other => panic!("expected fatal teardown, got {:?}", other),
        }

        let err = decode_written_error(&client.get_written_data());
        assert_eq!(err.code, ER_X_BAD_MESSAGE);
        assert_eq!(err.msg, "Bad Message");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_command_without_server_is_bad_message() {
        let context = make_context(SslMode::Preferred, SslMode::AsClient);
        let (mut conn, client) = make_connection(context, None);

        // StmtExecute before any session setup
        client.feed_read_data(&raw_frame(
            ClientMessageType::StmtExecute.byte(),
            &[0x0a, 0x01, 0x41],
        ));

        match conn.resume() {
            RunResult::Done => {}
            other => panic!("expected fatal teardown, got {:?}", other),
        }

        let err = decode_written_error(&client.get_written_data());
        assert_eq!(err.code, ER_X_BAD_MESSAGE);
    }

    #[test]
    fn test_cap_set_compression_rejected() {
        let context = make_context(SslMode::Preferred, SslMode::AsClient);
        let (mut conn, client) = make_connection(context, None);

        let msg = CapabilitiesSet {
            capabilities: Some(Capabilities {
                capabilities: vec![crate::protocol::xmessages::Capability {
                    name: Some("compression".to_string()),
                    value: Some(crate::protocol::xmessages::Any::scalar_value(
                        crate::protocol::xmessages::Scalar::bool_value(true),
                    )),
                }],
            }),
        };
        client.feed_read_data(&xmessages::encode_frame(&msg));

        // rejected, but the connection lives on
        match conn.resume() {
            RunResult::Suspend(IoWant::RecvClient) => {}
            other => panic!("expected to await the next command, got {:?}", other),
        }

        let err = decode_written_error(&client.get_written_data());
        assert_eq!(err.code, ER_X_CAPABILITY_COMPRESSION_INVALID_ALGORITHM);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_cap_set_broken_message_yields_5001() {
        let context = make_context(SslMode::Preferred, SslMode::AsClient);
        let (mut conn, client) = make_connection(context, None);

        // capability without a value
        let msg = CapabilitiesSet {
            capabilities: Some(Capabilities {
                capabilities: vec![crate::protocol::xmessages::Capability {
                    name: Some("tls".to_string()),
                    value: None,
                }],
            }),
        };
        client.feed_read_data(&xmessages::encode_frame(&msg));

        conn.resume();

        let err = decode_written_error(&client.get_written_data());
        assert_eq!(err.code, ER_X_CAPABILITIES_PREPARE_FAILED);
        assert_eq!(err.msg, "Capability prepare failed for 'tls'");
    }

    #[test]
    fn test_cap_set_tls_refused_when_disabled() {
        let context = make_context(SslMode::Disabled, SslMode::Disabled);
        let (mut conn, client) = make_connection(context, None);

        client.feed_read_data(&xmessages::encode_frame(&capabilities_set_tls(true)));
        conn.resume();

        let err = decode_written_error(&client.get_written_data());
        assert_eq!(err.code, ER_X_CAPABILITIES_PREPARE_FAILED);
        assert_eq!(err.msg, "Capability prepare failed for 'tls'");
    }

    #[test]
    fn test_auth_without_tls_when_required_is_fatal() {
        let context = make_context(SslMode::Required, SslMode::Required);
        let (mut conn, client) = make_connection(context, None);

        let auth = crate::protocol::xmessages::AuthenticateStart {
            mech_name: "MYSQL41".to_string(),
            auth_data: None,
            initial_response: None,
        };
        client.feed_read_data(&raw_frame(
            ClientMessageType::SessAuthenticateStart.byte(),
            &auth.encode_to_vec(),
        ));

        match conn.resume() {
            RunResult::Done => {}
            other => panic!("expected fatal teardown, got {:?}", other),
        }

        let err = decode_written_error(&client.get_written_data());
        assert_eq!(err.code, ER_X_CAPABILITIES_PREPARE_FAILED);
        assert_eq!(err.msg, "Client requires TLS");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_auth_exchange_against_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = std::thread::spawn(move || {
            use std::io::{Read, Write};

            let (mut sock, _) = listener.accept().unwrap();

            // auth-start arrives
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).unwrap();
            assert!(n > 5);
            assert_eq!(buf[4], ClientMessageType::SessAuthenticateStart.byte());

            // challenge
            let cont = crate::protocol::xmessages::AuthenticateContinue {
                auth_data: b"challenge".to_vec(),
            };
            sock.write_all(&raw_frame(
                ServerMessageType::SessAuthenticateContinue.byte(),
                &cont.encode_to_vec(),
            ))
            .unwrap();

            // client answer forwarded through the router
            let n = sock.read(&mut buf).unwrap();
            assert!(n > 5);
            assert_eq!(buf[4], ClientMessageType::SessAuthenticateContinue.byte());

            // done
            let ok = crate::protocol::xmessages::AuthenticateOk { auth_data: None };
            sock.write_all(&raw_frame(
                ServerMessageType::SessAuthenticateOk.byte(),
                &ok.encode_to_vec(),
            ))
            .unwrap();

            sock
        });

        let context = make_context(SslMode::Disabled, SslMode::Disabled);
        let (mut conn, client) = make_connection(context, Some(port));

        let auth = crate::protocol::xmessages::AuthenticateStart {
            mech_name: "MYSQL41".to_string(),
            auth_data: Some(b"user".to_vec()),
            initial_response: None,
        };
        client.feed_read_data(&raw_frame(
            ClientMessageType::SessAuthenticateStart.byte(),
            &auth.encode_to_vec(),
        ));

        // drive until the challenge reached the client
        match drive(&mut conn) {
            RunResult::Suspend(IoWant::RecvClient) => {}
            other => panic!("expected to await the auth answer, got {:?}", other),
        }

        let written = client.get_written_data();
        assert_eq!(written[4], ServerMessageType::SessAuthenticateContinue.byte());
        client.clear_written_data();

        // client answers the challenge
        let answer = crate::protocol::xmessages::AuthenticateContinue {
            auth_data: b"response".to_vec(),
        };
        client.feed_read_data(&raw_frame(
            ClientMessageType::SessAuthenticateContinue.byte(),
            &answer.encode_to_vec(),
        ));

        match drive(&mut conn) {
            RunResult::Suspend(IoWant::RecvClient) => {}
            other => panic!("expected the command loop, got {:?}", other),
        }

        let written = client.get_written_data();
        assert_eq!(written[4], ServerMessageType::SessAuthenticateOk.byte());

        let _ = backend.join().unwrap();
    }

    #[test]
    fn test_stmt_execute_response_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = std::thread::spawn(move || {
            use std::io::{Read, Write};

            let (mut sock, _) = listener.accept().unwrap();

            let mut buf = vec![0u8; 1024];

            // auth start -> ok
            let _ = sock.read(&mut buf).unwrap();
            let ok = crate::protocol::xmessages::AuthenticateOk { auth_data: None };
            sock.write_all(&raw_frame(
                ServerMessageType::SessAuthenticateOk.byte(),
                &ok.encode_to_vec(),
            ))
            .unwrap();

            // stmt execute -> meta, row, row, stmt-ok
            let n = sock.read(&mut buf).unwrap();
            assert!(n > 5);
            assert_eq!(buf[4], ClientMessageType::StmtExecute.byte());

            for (msg_type, payload) in [
                (ServerMessageType::ResultsetColumnMetaData.byte(), &b"meta"[..]),
                (ServerMessageType::ResultsetRow.byte(), &b"row1"[..]),
                (ServerMessageType::ResultsetRow.byte(), &b"row2"[..]),
                (ServerMessageType::SqlStmtExecuteOk.byte(), &b""[..]),
            ] {
                sock.write_all(&raw_frame(msg_type, payload)).unwrap();
            }

            sock
        });

        let context = make_context(SslMode::Disabled, SslMode::Disabled);
        let (mut conn, client) = make_connection(context, Some(port));

        // authenticate first
        let auth = crate::protocol::xmessages::AuthenticateStart {
            mech_name: "PLAIN".to_string(),
            auth_data: None,
            initial_response: None,
        };
        client.feed_read_data(&raw_frame(
            ClientMessageType::SessAuthenticateStart.byte(),
            &auth.encode_to_vec(),
        ));
        drive(&mut conn);
        client.clear_written_data();

        // execute a statement
        client.feed_read_data(&raw_frame(
            ClientMessageType::StmtExecute.byte(),
            b"\x0a\x06select",
        ));

        match drive(&mut conn) {
            RunResult::Suspend(IoWant::RecvClient) => {}
            other => panic!("expected the command loop, got {:?}", other),
        }

        // all four response messages were forwarded, in order
        let written = client.get_written_data();
        let mut pos = 0;
        let mut types = Vec::new();
        while pos < written.len() {
            let len =
                u32::from_le_bytes([written[pos], written[pos + 1], written[pos + 2], written[pos + 3]])
                    as usize;
            types.push(written[pos + 4]);
            pos += 4 + len;
        }

        assert_eq!(
            types,
            [
                ServerMessageType::ResultsetColumnMetaData.byte(),
                ServerMessageType::ResultsetRow.byte(),
                ServerMessageType::ResultsetRow.byte(),
                ServerMessageType::SqlStmtExecuteOk.byte(),
            ]
        );

        let _ = backend.join().unwrap();
    }

    #[test]
    fn test_cap_set_tls_passthrough_enters_record_forwarding() {
        // S6: passthrough forwards the tls capability set verbatim; after
        // the server's Ok, bytes are demultiplexed as TLS records
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = std::thread::spawn(move || {
            use std::io::{Read, Write};

            let (mut sock, _) = listener.accept().unwrap();

            // the forwarded CapabilitiesSet{tls=true}
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).unwrap();
            assert!(n > 5);
            assert_eq!(buf[4], ClientMessageType::CapabilitiesSet.byte());

            let decoded = CapabilitiesSet::decode(&buf[5..n]).unwrap();
            assert!(decoded.capabilities.unwrap().has("tls"));

            sock.write_all(&xmessages::encode_frame(&xmessages::Ok::default()))
                .unwrap();

            // expect a forwarded TLS handshake record
            let mut record = [0u8; 9];
            sock.read_exact(&mut record).unwrap();
            assert_eq!(record[0], 0x16);
            assert_eq!(&record[5..], b"hell");

            sock
        });

        let context = make_context(SslMode::Passthrough, SslMode::AsClient);
        let (mut conn, client) = make_connection(context, Some(port));

        client.feed_read_data(&xmessages::encode_frame(&capabilities_set_tls(true)));

        // drive until the server Ok reached the client and record
        // forwarding began
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match conn.resume() {
                RunResult::Suspend(IoWant::RecvEither) => break,
                RunResult::Suspend(_) => {
                    assert!(std::time::Instant::now() < deadline, "stuck");
                    std::thread::sleep(Duration::from_millis(10));
                }
                RunResult::Done => panic!("connection ended unexpectedly"),
            }
        }

        let written = client.get_written_data();
        assert_eq!(written[4], ServerMessageType::Ok.byte());
        assert_eq!(conn.channels_are_tls(), (true, true));

        // a client TLS record crosses to the server
        client.feed_read_data(&[0x16, 0x03, 0x03, 0x00, 0x04, b'h', b'e', b'l', b'l']);
        conn.resume();

        let _ = backend.join().unwrap();
    }

    #[test]
    fn test_fatal_alert_drops_back_to_cleartext() {
        // property: a fatal alert record un-TLSes both channels
        let client_stream = MockStream::new();
        let client_handle = client_stream.handle();
        let mut client = Channel::new(Box::new(client_stream), 16384);

        let server_stream = MockStream::new();
        let mut server = Channel::new(Box::new(server_stream), 16384);

        client.set_is_tls(true);
        server.set_is_tls(true);

        // alert record, level fatal (2), description 40 (handshake_failure)
        client_handle.feed_read_data(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28]);

        let moved = forward_tls_records(&mut client, &mut server).unwrap();
        assert_eq!(moved, 7);

        assert!(!client.is_tls());
        assert!(!server.is_tls());

        // the record itself was still forwarded
        assert_eq!(server.send_buffer(), &[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28]);
    }

    #[test]
    fn test_partial_record_waits() {
        let client_stream = MockStream::new();
        let client_handle = client_stream.handle();
        let mut client = Channel::new(Box::new(client_stream), 16384);

        let server_stream = MockStream::new();
        let mut server = Channel::new(Box::new(server_stream), 16384);

        // header promises 16 body bytes, only 3 present
        client_handle.feed_read_data(&[0x17, 0x03, 0x03, 0x00, 0x10, 0xaa, 0xbb, 0xcc]);

        let moved = forward_tls_records(&mut client, &mut server).unwrap();
        assert_eq!(moved, 0);
        assert!(server.send_buffer().is_empty());

        // the rest arrives; the record goes through whole
        client_handle.feed_read_data(&[0u8; 13]);
        let moved = forward_tls_records(&mut client, &mut server).unwrap();
        assert_eq!(moved, 21);
        assert_eq!(server.send_buffer().len(), 21);
    }

    #[test]
    fn test_con_close_answers_bye() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // backend never contacted; but ConClose needs a server per the
        // session rules, so authenticate first
        let backend = std::thread::spawn(move || {
            use std::io::{Read, Write};

            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).unwrap();

            let ok = crate::protocol::xmessages::AuthenticateOk { auth_data: None };
            sock.write_all(&raw_frame(
                ServerMessageType::SessAuthenticateOk.byte(),
                &ok.encode_to_vec(),
            ))
            .unwrap();
            sock
        });

        let context = make_context(SslMode::Disabled, SslMode::Disabled);
        let (mut conn, client) = make_connection(context, Some(port));

        let auth = crate::protocol::xmessages::AuthenticateStart {
            mech_name: "PLAIN".to_string(),
            auth_data: None,
            initial_response: None,
        };
        client.feed_read_data(&raw_frame(
            ClientMessageType::SessAuthenticateStart.byte(),
            &auth.encode_to_vec(),
        ));
        drive(&mut conn);
        client.clear_written_data();

        client.feed_read_data(&raw_frame(ClientMessageType::ConClose.byte(), &[]));

        match drive(&mut conn) {
            RunResult::Done => {}
            other => panic!("expected teardown after close, got {:?}", other),
        }

        let written = client.get_written_data();
        assert_eq!(written[4], ServerMessageType::Ok.byte());
        let ok = xmessages::Ok::decode(&written[5..]).unwrap();
        assert_eq!(ok.msg.as_deref(), Some("bye!"));

        let _ = backend.join().unwrap();
    }
}
