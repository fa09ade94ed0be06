// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Classic wire protocol codec.
//!
//! Frame layout:
//!
//! ```text
//! +----------------+----------+-------------+
//! | len (3B LE)    | seq (1B) | payload     |
//! +----------------+----------+-------------+
//! ```
//!
//! `len` counts the payload only. Sequence ids start at 0 for each logical
//! exchange and increment modulo 256; the server's reply continues the
//! sequence. The router tracks the sequence during the handshake and stops
//! once a frame with seq 2 has been observed (the handshake-done condition),
//! after which frames are forwarded verbatim.
//!
//! Besides framing, this module knows the integer/string encodings of the
//! protocol, the command bytes the router accounts for, the first-byte
//! response classifier, and the handful of packets the router writes itself
//! (error packets and the fake login used for quarantine mirroring).

use std::fmt;

// ============================================================================
// Frame header
// ============================================================================

/// Frame header size: 3-byte length + 1-byte sequence id.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest payload a single frame can carry (2^24 - 1).
pub const MAX_PAYLOAD_SIZE: usize = 0x00ff_ffff;

/// Capability bit: client asks to switch to TLS.
pub const CAPABILITY_SSL: u32 = 0x0000_0800;

/// Capability bit: 4.1 protocol handshake.
pub const CAPABILITY_PROTOCOL_41: u32 = 0x0000_0200;

/// Client-visible error code when no backend could be reached.
pub const ERROR_CONNECTING_TO_BACKEND: u16 = 2026;

/// Byte offset of the client capability flags inside a handshake response.
const HANDSHAKE_RESPONSE_CAPS_OFFSET: usize = FRAME_HEADER_SIZE;

/// A decoded classic frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload size, excluding the 4 header bytes.
    pub payload_len: usize,

    /// Sequence id of the frame.
    pub seq_id: u8,
}

/// True once `buf` holds a complete frame header.
pub fn has_frame_header(buf: &[u8]) -> bool {
    buf.len() >= FRAME_HEADER_SIZE
}

/// True once `buf` additionally holds the first payload byte.
pub fn has_msg_prefix(buf: &[u8]) -> bool {
    buf.len() >= FRAME_HEADER_SIZE + 1
}

/// Decode a frame header from the front of `buf` without consuming.
///
/// Returns `None` when fewer than [`FRAME_HEADER_SIZE`] bytes are available
/// (the want-more-data case).
pub fn decode_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if !has_frame_header(buf) {
        return None;
    }

    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;

    Some(FrameHeader {
        payload_len,
        seq_id: buf[3],
    })
}

/// Encode a frame into a new buffer.
pub fn encode_frame(seq_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    encode_frame_into(seq_id, payload, &mut out);
    out
}

/// Encode a frame, appending to `out`.
pub fn encode_frame_into(seq_id: u8, payload: &[u8], out: &mut Vec<u8>) {
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);

    let len = (payload.len() as u32).to_le_bytes();
    out.extend_from_slice(&[len[0], len[1], len[2], seq_id]);
    out.extend_from_slice(payload);
}

// ============================================================================
// Integers
// ============================================================================

/// A fixed-size little-endian integer of `N` bytes, `N` in {1, 2, 3, 4, 8}.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedInt<const N: usize>(pub u64);

impl<const N: usize> FixedInt<N> {
    /// Encoded width; always `N`.
    pub const fn size(&self) -> usize {
        N
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let bytes = self.0.to_le_bytes();
        out.extend_from_slice(&bytes[..N]);
    }

    /// Decode from the front of `buf`; `None` when `buf` is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < N {
            return None;
        }

        let mut bytes = [0u8; 8];
        bytes[..N].copy_from_slice(&buf[..N]);
        Some(Self(u64::from_le_bytes(bytes)))
    }
}

/// A length-encoded integer.
///
/// Width is 1 for values below 251, 3 (prefix 0xFC) below 2^16, 4 (prefix
/// 0xFD) below 2^24 and 9 (prefix 0xFE) otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarInt(pub u64);

impl VarInt {
    /// Encoded width in bytes.
    pub const fn size(&self) -> usize {
        match self.0 {
            0..=250 => 1,
            251..=0xffff => 3,
            0x1_0000..=0xff_ffff => 4,
            _ => 9,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self.size() {
            1 => out.push(self.0 as u8),
            3 => {
                out.push(0xfc);
                out.extend_from_slice(&(self.0 as u16).to_le_bytes());
            }
            4 => {
                out.push(0xfd);
                let bytes = (self.0 as u32).to_le_bytes();
                out.extend_from_slice(&bytes[..3]);
            }
            _ => {
                out.push(0xfe);
                out.extend_from_slice(&self.0.to_le_bytes());
            }
        }
    }

    /// Decode from the front of `buf`, returning the value and its width.
    /// `None` when `buf` is too short.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let first = *buf.first()?;
        match first {
            0..=250 => Some((Self(first as u64), 1)),
            0xfc => {
                let v = FixedInt::<2>::decode(&buf[1..])?;
                Some((Self(v.0), 3))
            }
            0xfd => {
                let v = FixedInt::<3>::decode(&buf[1..])?;
                Some((Self(v.0), 4))
            }
            0xfe => {
                let v = FixedInt::<8>::decode(&buf[1..])?;
                Some((Self(v.0), 9))
            }
            // 0xfb (NULL) and 0xff are not valid length-encoded integers
            _ => None,
        }
    }
}

// ============================================================================
// Strings
// ============================================================================

/// Append a null-terminated string.
pub fn encode_null_terminated(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Decode a null-terminated string, returning it and the bytes consumed
/// (including the terminator). `None` when no terminator is present.
pub fn decode_null_terminated(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.iter().position(|&b| b == 0)?;
    Some((&buf[..pos], pos + 1))
}

/// Append a length-encoded string.
pub fn encode_lenenc_bytes(s: &[u8], out: &mut Vec<u8>) {
    VarInt(s.len() as u64).encode_into(out);
    out.extend_from_slice(s);
}

/// Decode a length-encoded string, returning it and the bytes consumed.
pub fn decode_lenenc_bytes(buf: &[u8]) -> Option<(&[u8], usize)> {
    let (len, len_size) = VarInt::decode(buf)?;
    let len = len.0 as usize;

    if buf.len() < len_size + len {
        return None;
    }

    Some((&buf[len_size..len_size + len], len_size + len))
}

/// Decode a fixed-length string of `n` bytes.
pub fn decode_fixed_bytes(buf: &[u8], n: usize) -> Option<&[u8]> {
    if buf.len() < n {
        return None;
    }
    Some(&buf[..n])
}

// ============================================================================
// Commands
// ============================================================================

/// Command bytes the router recognizes for accounting purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Quit = 0x01,
    InitSchema = 0x02,
    Query = 0x03,
    ListFields = 0x04,
    Reload = 0x07,
    Statistics = 0x09,
    Kill = 0x0c,
    Ping = 0x0e,
    ChangeUser = 0x11,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtParamAppendData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    ResetConnection = 0x1f,
    Clone = 0x20,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Command::Quit),
            0x02 => Some(Command::InitSchema),
            0x03 => Some(Command::Query),
            0x04 => Some(Command::ListFields),
            0x07 => Some(Command::Reload),
            0x09 => Some(Command::Statistics),
            0x0c => Some(Command::Kill),
            0x0e => Some(Command::Ping),
            0x11 => Some(Command::ChangeUser),
            0x16 => Some(Command::StmtPrepare),
            0x17 => Some(Command::StmtExecute),
            0x18 => Some(Command::StmtParamAppendData),
            0x19 => Some(Command::StmtClose),
            0x1a => Some(Command::StmtReset),
            0x1b => Some(Command::SetOption),
            0x1c => Some(Command::StmtFetch),
            0x1f => Some(Command::ResetConnection),
            0x20 => Some(Command::Clone),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Server-to-client response classifier; the byte at payload offset 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    Ok,
    Error,
    /// EOF packet or auth-switch request, depending on phase.
    Eof,
    Other(u8),
}

pub fn classify_response(first_payload_byte: u8) -> ResponseKind {
    match first_payload_byte {
        0x00 => ResponseKind::Ok,
        0xff => ResponseKind::Error,
        0xfe => ResponseKind::Eof,
        other => ResponseKind::Other(other),
    }
}

// ============================================================================
// Router-built packets
// ============================================================================

/// Encode an error packet: `[0xff][code:u16le]['#'][sql_state:5][message]`,
/// framed with the given sequence id.
pub fn encode_error_packet(seq_id: u8, code: u16, message: &str, sql_state: &str) -> Vec<u8> {
    debug_assert_eq!(sql_state.len(), 5);

    let mut payload = Vec::with_capacity(9 + message.len());
    payload.push(0xff);
    FixedInt::<2>(code as u64).encode_into(&mut payload);
    payload.push(b'#');
    payload.extend_from_slice(&sql_state.as_bytes()[..5]);
    payload.extend_from_slice(message.as_bytes());

    encode_frame(seq_id, &payload)
}

/// Encode the canonical fake login sent to a backend when a client host is
/// blocked, so the backend increments its own error counter for symmetric
/// quarantining. User `ROUTER`, schema `fake_router_login`, seq 1.
pub fn encode_fake_login_packet() -> Vec<u8> {
    let caps = CAPABILITY_PROTOCOL_41;

    let mut payload = Vec::with_capacity(64);
    FixedInt::<4>(caps as u64).encode_into(&mut payload);
    FixedInt::<4>(0x0100_0000).encode_into(&mut payload); // max packet size
    payload.push(0x08); // charset: latin1
    payload.extend_from_slice(&[0u8; 23]); // reserved
    encode_null_terminated("ROUTER", &mut payload);
    encode_lenenc_bytes(b"", &mut payload); // empty auth response
    encode_null_terminated("fake_router_login", &mut payload);

    encode_frame(1, &payload)
}

/// Read the client capability flags out of a buffered handshake-response
/// frame. `None` when the frame is too short.
pub fn handshake_response_capabilities(frame: &[u8]) -> Option<u32> {
    let caps = FixedInt::<4>::decode(frame.get(HANDSHAKE_RESPONSE_CAPS_OFFSET..)?)?;
    Some(caps.0 as u32)
}

// ============================================================================
// Protocol state
// ============================================================================

/// Per-side classic protocol state.
///
/// Tracks the handshake sequence until it is complete; afterwards the
/// connection forwards frames without inspection.
#[derive(Clone, Debug, Default)]
pub struct ClassicProtocolState {
    /// Last observed sequence id.
    pub seq_id: u8,

    /// Handshake finished; sequence tracking disabled from here on.
    pub handshake_done: bool,

    /// Client capability flags, once the handshake response was seen.
    pub capabilities: u32,

    /// Authentication plugin requested in the greeting, when known.
    pub auth_plugin_name: String,
}

impl ClassicProtocolState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the client requested a TLS upgrade.
    pub fn wants_tls(&self) -> bool {
        self.capabilities & CAPABILITY_SSL != 0
    }
}

// ============================================================================
// Tests
// ============================================================================
