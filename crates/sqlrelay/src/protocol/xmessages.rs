// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The X-protocol message subset the router decodes.
//!
//! Only the handshake-phase messages are modeled: capability negotiation,
//! session authentication and the generic ok/error results. The structs
//! mirror the upstream protobuf schema (proto2 optionals map to `Option`);
//! unknown fields in real server traffic are skipped by prost on decode, so
//! partial modeling stays wire-compatible. Everything outside this subset
//! crosses the router as opaque bytes.

use prost::Message;

use super::xproto::{self, ClientMessageType, ServerMessageType};

// ============================================================================
// Error codes
// ============================================================================

/// "Bad Message": unexpected or unparsable message for the current state.
pub const ER_X_BAD_MESSAGE: u32 = 5000;

/// Capability negotiation failed ("Capability prepare failed for 'tls'").
pub const ER_X_CAPABILITIES_PREPARE_FAILED: u32 = 5001;

/// Compression capability refused.
pub const ER_X_CAPABILITY_COMPRESSION_INVALID_ALGORITHM: u32 = 5175;

/// Server-side TLS is required but could not be enabled.
pub const ER_SECURE_TRANSPORT_REQUIRED: u32 = 3159;

/// Client-visible "connecting to backend failed" code.
pub const CR_CONNECTION_ERROR: u32 = 2026;

// ============================================================================
// Datatypes
// ============================================================================

/// `Mysqlx.Datatypes.Scalar`.
#[derive(Clone, PartialEq, Message)]
pub struct Scalar {
    #[prost(int32, tag = "1")]
    pub r#type: i32,

    #[prost(sint64, optional, tag = "2")]
    pub v_signed_int: Option<i64>,

    #[prost(uint64, optional, tag = "3")]
    pub v_unsigned_int: Option<u64>,

    #[prost(double, optional, tag = "6")]
    pub v_double: Option<f64>,

    #[prost(float, optional, tag = "7")]
    pub v_float: Option<f32>,

    #[prost(bool, optional, tag = "8")]
    pub v_bool: Option<bool>,
}

impl Scalar {
    pub const TYPE_V_SINT: i32 = 1;
    pub const TYPE_V_UINT: i32 = 2;
    pub const TYPE_V_NULL: i32 = 3;
    pub const TYPE_V_OCTETS: i32 = 4;
    pub const TYPE_V_DOUBLE: i32 = 5;
    pub const TYPE_V_FLOAT: i32 = 6;
    pub const TYPE_V_BOOL: i32 = 7;
    pub const TYPE_V_STRING: i32 = 8;

    pub fn bool_value(v: bool) -> Self {
        Scalar {
            r#type: Self::TYPE_V_BOOL,
            v_bool: Some(v),
            ..Default::default()
        }
    }
}

/// `Mysqlx.Datatypes.Any`.
#[derive(Clone, PartialEq, Message)]
pub struct Any {
    #[prost(int32, tag = "1")]
    pub r#type: i32,

    #[prost(message, optional, tag = "2")]
    pub scalar: Option<Scalar>,
}

impl Any {
    pub const TYPE_SCALAR: i32 = 1;

    pub fn scalar_value(scalar: Scalar) -> Self {
        Any {
            r#type: Self::TYPE_SCALAR,
            scalar: Some(scalar),
        }
    }
}

// ============================================================================
// Connection messages
// ============================================================================

/// `Mysqlx.Connection.Capability`.
#[derive(Clone, PartialEq, Message)]
pub struct Capability {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,

    #[prost(message, optional, tag = "2")]
    pub value: Option<Any>,
}

/// `Mysqlx.Connection.Capabilities`.
#[derive(Clone, PartialEq, Message)]
pub struct Capabilities {
    #[prost(message, repeated, tag = "1")]
    pub capabilities: Vec<Capability>,
}

impl Capabilities {
    /// Whether a capability with the given name is present.
    pub fn has(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.name.as_deref() == Some(name))
    }
}

/// `Mysqlx.Connection.CapabilitiesGet`.
#[derive(Clone, PartialEq, Message)]
pub struct CapabilitiesGet {}

/// `Mysqlx.Connection.CapabilitiesSet`.
#[derive(Clone, PartialEq, Message)]
pub struct CapabilitiesSet {
    #[prost(message, optional, tag = "1")]
    pub capabilities: Option<Capabilities>,
}

// ============================================================================
// Results
// ============================================================================

/// `Mysqlx.Ok`.
#[derive(Clone, PartialEq, Message)]
pub struct Ok {
    #[prost(string, optional, tag = "1")]
    pub msg: Option<String>,
}

/// `Mysqlx.Error` severity values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error = 0,
    Fatal = 1,
}

/// `Mysqlx.Error`.
#[derive(Clone, PartialEq, Message)]
pub struct Error {
    #[prost(int32, optional, tag = "1")]
    pub severity: Option<i32>,

    #[prost(uint32, tag = "2")]
    pub code: u32,

    #[prost(string, tag = "3")]
    pub msg: String,

    #[prost(string, tag = "4")]
    pub sql_state: String,
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        self.severity == Some(Severity::Fatal as i32)
    }
}

// ============================================================================
// Session messages
// ============================================================================

/// `Mysqlx.Session.AuthenticateStart`.
#[derive(Clone, PartialEq, Message)]
pub struct AuthenticateStart {
    #[prost(string, tag = "1")]
    pub mech_name: String,

    #[prost(bytes = "vec", optional, tag = "2")]
    pub auth_data: Option<Vec<u8>>,

    #[prost(bytes = "vec", optional, tag = "3")]
    pub initial_response: Option<Vec<u8>>,
}

/// `Mysqlx.Session.AuthenticateContinue`.
#[derive(Clone, PartialEq, Message)]
pub struct AuthenticateContinue {
    #[prost(bytes = "vec", tag = "1")]
    pub auth_data: Vec<u8>,
}

/// `Mysqlx.Session.AuthenticateOk`.
#[derive(Clone, PartialEq, Message)]
pub struct AuthenticateOk {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub auth_data: Option<Vec<u8>>,
}

// ============================================================================
// Frame encoding
// ============================================================================

/// Maps a message struct to its on-wire message type.
pub trait XMessage: Message + Default {
    const MSG_TYPE: u8;
}

impl XMessage for CapabilitiesGet {
    const MSG_TYPE: u8 = ClientMessageType::CapabilitiesGet as u8;
}

impl XMessage for CapabilitiesSet {
    const MSG_TYPE: u8 = ClientMessageType::CapabilitiesSet as u8;
}

impl XMessage for Capabilities {
    const MSG_TYPE: u8 = ServerMessageType::ConnCapabilities as u8;
}

impl XMessage for Ok {
    const MSG_TYPE: u8 = ServerMessageType::Ok as u8;
}

impl XMessage for Error {
    const MSG_TYPE: u8 = ServerMessageType::Error as u8;
}

/// Encode a message into a full X frame:
/// 4-byte length (msg-type + payload), 1-byte msg-type, payload.
pub fn encode_frame<M: XMessage>(msg: &M) -> Vec<u8> {
    let payload_len = msg.encoded_len();

    let mut out = Vec::with_capacity(xproto::MSG_PREFIX_SIZE + payload_len);
    xproto::encode_frame_header(M::MSG_TYPE, payload_len, &mut out);
    msg.encode(&mut out).expect("vec grows on demand");

    out
}

/// Encode an error message into a full X frame.
pub fn encode_error_frame(code: u32, msg: &str, sql_state: &str, severity: Severity) -> Vec<u8> {
    let err = Error {
        severity: Some(severity as i32),
        code,
        msg: msg.to_string(),
        sql_state: sql_state.to_string(),
    };

    encode_frame(&err)
}

/// The `tls` capability with a boolean value.
pub fn capability_tls(value: bool) -> Capability {
    Capability {
        name: Some("tls".to_string()),
        value: Some(Any::scalar_value(Scalar::bool_value(value))),
    }
}

/// A `CapabilitiesSet{tls=<value>}` message, as the router sends towards a
/// server when switching the backend leg to TLS.
pub fn capabilities_set_tls(value: bool) -> CapabilitiesSet {
    CapabilitiesSet {
        capabilities: Some(Capabilities {
            capabilities: vec![capability_tls(value)],
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::xproto::decode_frame_header;

    #[test]
    fn test_encode_frame_layout() {
        let msg = Ok {
            msg: Some("bye!".to_string()),
        };
        let frame = encode_frame(&msg);

        // length counts msg-type + payload
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(frame[4], ServerMessageType::Ok.byte());

        let frame_info = decode_frame_header(&frame).unwrap();
        assert_eq!(frame_info.frame_size, frame.len());

        let decoded = Ok::decode(&frame[5..]).unwrap();
        assert_eq!(decoded.msg.as_deref(), Some("bye!"));
    }

    #[test]
    fn test_capabilities_get_is_empty() {
        let frame = encode_frame(&CapabilitiesGet {});
        // just header + msg type
        assert_eq!(frame.len(), 5);
        assert_eq!(frame[4], ClientMessageType::CapabilitiesGet.byte());
    }

    #[test]
    fn test_error_roundtrip() {
        let frame = encode_error_frame(ER_X_BAD_MESSAGE, "Bad Message", "HY000", Severity::Fatal);
        assert_eq!(frame[4], ServerMessageType::Error.byte());

        let decoded = Error::decode(&frame[5..]).unwrap();
        assert_eq!(decoded.code, ER_X_BAD_MESSAGE);
        assert_eq!(decoded.msg, "Bad Message");
        assert_eq!(decoded.sql_state, "HY000");
        assert!(decoded.is_fatal());
    }

    #[test]
    fn test_error_severity_default_is_not_fatal() {
        let frame = encode_error_frame(
            ER_X_CAPABILITIES_PREPARE_FAILED,
            "Capability prepare failed for 'tls'",
            "HY000",
            Severity::Error,
        );

        let decoded = Error::decode(&frame[5..]).unwrap();
        assert!(!decoded.is_fatal());
        assert_eq!(decoded.code, 5001);
    }

    #[test]
    fn test_capability_tls_roundtrip() {
        let msg = capabilities_set_tls(true);
        let frame = encode_frame(&msg);
        assert_eq!(frame[4], ClientMessageType::CapabilitiesSet.byte());

        let decoded = CapabilitiesSet::decode(&frame[5..]).unwrap();
        let caps = decoded.capabilities.unwrap();
        assert!(caps.has("tls"));

        let cap = &caps.capabilities[0];
        assert_eq!(cap.name.as_deref(), Some("tls"));

        let any = cap.value.as_ref().unwrap();
        assert_eq!(any.r#type, Any::TYPE_SCALAR);

        let scalar = any.scalar.as_ref().unwrap();
        assert_eq!(scalar.r#type, Scalar::TYPE_V_BOOL);
        assert_eq!(scalar.v_bool, Some(true));
    }

    #[test]
    fn test_capabilities_has() {
        let caps = Capabilities {
            capabilities: vec![capability_tls(false)],
        };
        assert!(caps.has("tls"));
        assert!(!caps.has("compression"));
    }

    #[test]
    fn test_authenticate_start_roundtrip() {
        let msg = AuthenticateStart {
            mech_name: "MYSQL41".to_string(),
            auth_data: Some(b"user".to_vec()),
            initial_response: None,
        };

        let bytes = msg.encode_to_vec();
        let decoded = AuthenticateStart::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // an Ok with an extra unknown field (tag 15, varint) still decodes
        let mut bytes = Ok {
            msg: Some("hi".to_string()),
        }
        .encode_to_vec();
        bytes.extend_from_slice(&[0x78, 0x2a]); // field 15, value 42

        let decoded = Ok::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.msg.as_deref(), Some("hi"));
    }
}
