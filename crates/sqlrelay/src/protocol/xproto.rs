// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! X wire protocol codec.
//!
//! Frame layout:
//!
//! ```text
//! +----------------+--------------+------------------+
//! | len (4B LE)    | msg_type (1B)| protobuf payload |
//! +----------------+--------------+------------------+
//! ```
//!
//! `len` counts the message-type byte plus the payload. The router decodes
//! the payload only for the handshake subset in
//! [`xmessages`](super::xmessages); everything else is forwarded as opaque
//! bytes, 16 KiB at a time, with [`FrameInfo`] tracking how much of the
//! current frame has been moved.

use std::io;

use crate::channel::Channel;

// ============================================================================
// Frame header
// ============================================================================

/// Frame header size: 4-byte little-endian length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Header plus the message-type byte.
pub const MSG_PREFIX_SIZE: usize = 5;

/// Forwarding chunk size; bounds how much of a 16M frame is buffered at once.
pub const FORWARD_CHUNK_SIZE: usize = 16 * 1024;

/// Parser state of the frame currently crossing the router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    /// Size of the whole frame including the 4 header bytes.
    pub frame_size: usize,

    /// Bytes of the frame already forwarded.
    pub forwarded: usize,
}

impl FrameInfo {
    pub fn is_done(&self) -> bool {
        self.forwarded >= self.frame_size
    }
}

/// Decode a frame header from the front of `buf` without consuming.
///
/// `None` when fewer than [`FRAME_HEADER_SIZE`] bytes are available.
pub fn decode_frame_header(buf: &[u8]) -> Option<FrameInfo> {
    if buf.len() < FRAME_HEADER_SIZE {
        return None;
    }

    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    Some(FrameInfo {
        frame_size: FRAME_HEADER_SIZE + payload_len,
        forwarded: 0,
    })
}

/// Encode a frame header for a payload of `payload_len` bytes plus the
/// message-type byte.
pub fn encode_frame_header(msg_type: u8, payload_len: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&((payload_len as u32) + 1).to_le_bytes());
    out.push(msg_type);
}

// ============================================================================
// Message types
// ============================================================================

/// Client-to-server message types the router recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientMessageType {
    CapabilitiesGet = 1,
    CapabilitiesSet = 2,
    ConClose = 3,
    SessAuthenticateStart = 4,
    SessAuthenticateContinue = 5,
    SessReset = 6,
    SessClose = 7,
    StmtExecute = 12,
    CrudFind = 17,
    CrudInsert = 18,
    CrudUpdate = 19,
    CrudDelete = 20,
    ExpectOpen = 24,
    ExpectClose = 25,
    CrudCreateView = 30,
    CrudModifyView = 31,
    CrudDropView = 32,
    PreparePrepare = 40,
    PrepareExecute = 41,
    PrepareDeallocate = 42,
    CursorOpen = 43,
    CursorClose = 44,
    CursorFetch = 45,
    Compression = 46,
}

impl ClientMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        use ClientMessageType::*;
        match b {
            1 => Some(CapabilitiesGet),
            2 => Some(CapabilitiesSet),
            3 => Some(ConClose),
            4 => Some(SessAuthenticateStart),
            5 => Some(SessAuthenticateContinue),
            6 => Some(SessReset),
            7 => Some(SessClose),
            12 => Some(StmtExecute),
            17 => Some(CrudFind),
            18 => Some(CrudInsert),
            19 => Some(CrudUpdate),
            20 => Some(CrudDelete),
            24 => Some(ExpectOpen),
            25 => Some(ExpectClose),
            30 => Some(CrudCreateView),
            31 => Some(CrudModifyView),
            32 => Some(CrudDropView),
            40 => Some(PreparePrepare),
            41 => Some(PrepareExecute),
            42 => Some(PrepareDeallocate),
            43 => Some(CursorOpen),
            44 => Some(CursorClose),
            45 => Some(CursorFetch),
            46 => Some(Compression),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Server-to-client message types the router recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerMessageType {
    Ok = 0,
    Error = 1,
    ConnCapabilities = 2,
    SessAuthenticateContinue = 3,
    SessAuthenticateOk = 4,
    Notice = 11,
    ResultsetColumnMetaData = 12,
    ResultsetRow = 13,
    ResultsetFetchDone = 14,
    ResultsetFetchSuspended = 15,
    ResultsetFetchDoneMoreResultsets = 16,
    SqlStmtExecuteOk = 17,
    ResultsetFetchDoneMoreOutParams = 18,
    Compression = 19,
}

impl ServerMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        use ServerMessageType::*;
        match b {
            0 => Some(Ok),
            1 => Some(Error),
            2 => Some(ConnCapabilities),
            3 => Some(SessAuthenticateContinue),
            4 => Some(SessAuthenticateOk),
            11 => Some(Notice),
            12 => Some(ResultsetColumnMetaData),
            13 => Some(ResultsetRow),
            14 => Some(ResultsetFetchDone),
            15 => Some(ResultsetFetchSuspended),
            16 => Some(ResultsetFetchDoneMoreResultsets),
            17 => Some(SqlStmtExecuteOk),
            18 => Some(ResultsetFetchDoneMoreOutParams),
            19 => Some(Compression),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Protocol state
// ============================================================================

/// Per-side X protocol state.
#[derive(Debug, Default)]
pub struct XProtocolState {
    /// Frame currently being parsed or forwarded.
    pub current_frame: Option<FrameInfo>,

    /// Message type of the current frame, once read.
    pub current_msg_type: Option<u8>,

    /// Capabilities the server advertised, when the router asked for them.
    pub server_caps: Option<super::xmessages::Capabilities>,
}

impl XProtocolState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_frame_header(&self) -> bool {
        self.current_frame.is_some()
    }

    pub fn has_msg_type(&self) -> bool {
        self.current_msg_type.is_some()
    }

    /// Forget the current frame after it was fully forwarded or discarded.
    pub fn reset_frame(&mut self) {
        self.current_frame = None;
        self.current_msg_type = None;
    }
}

// ============================================================================
// Codec over a Channel
// ============================================================================

/// Outcome of a partial-input decode attempt.
#[derive(Debug)]
pub enum CodecError {
    /// More bytes are needed; suspend and retry after the next read.
    WantRead,

    /// The frame violates the protocol (e.g. no room for a message type).
    BadMessage,

    /// Transport failure.
    Io(io::Error),
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

/// Ensure the channel's receive view starts with a decodable frame header
/// and record it in the protocol state.
pub fn ensure_frame_header(
    channel: &mut Channel,
    state: &mut XProtocolState,
) -> Result<(), CodecError> {
    if state.has_frame_header() {
        return Ok(());
    }

    if channel.recv_plain_view().len() < FRAME_HEADER_SIZE {
        channel.read_to_plain(FRAME_HEADER_SIZE - channel.recv_plain_view().len())?;
    }

    match decode_frame_header(channel.recv_plain_view()) {
        Some(frame) => {
            state.current_frame = Some(frame);
            Ok(())
        }
        None => Err(CodecError::WantRead),
    }
}

/// Ensure frame header plus message type are known.
///
/// The message type is part of the framed payload; a frame too small to
/// carry one is a protocol violation.
pub fn ensure_has_msg_prefix(
    channel: &mut Channel,
    state: &mut XProtocolState,
) -> Result<(), CodecError> {
    if state.has_frame_header() && state.has_msg_type() {
        return Ok(());
    }

    ensure_frame_header(channel, state)?;

    if !state.has_msg_type() {
        let current_frame = state.current_frame.expect("frame header ensured");

        if current_frame.frame_size < MSG_PREFIX_SIZE {
            // expected a frame with at least one msg-type byte
            return Err(CodecError::BadMessage);
        }

        if current_frame.forwarded >= FRAME_HEADER_SIZE {
            return Err(CodecError::BadMessage);
        }

        let msg_type_pos = FRAME_HEADER_SIZE - current_frame.forwarded;

        if msg_type_pos >= channel.recv_plain_view().len() {
            channel.read_to_plain(1)?;

            if msg_type_pos >= channel.recv_plain_view().len() {
                return Err(CodecError::WantRead);
            }
        }

        state.current_msg_type = Some(channel.recv_plain_view()[msg_type_pos]);
    }

    Ok(())
}

/// Ensure the whole current frame is buffered in the receive view.
pub fn ensure_has_full_frame(
    channel: &mut Channel,
    state: &mut XProtocolState,
) -> Result<(), CodecError> {
    let current_frame = state.current_frame.as_ref().expect("frame header ensured");

    let min_size = current_frame.frame_size;
    let cur_size = channel.recv_plain_view().len();
    if cur_size >= min_size {
        return Ok(());
    }

    channel.read_to_plain(min_size - cur_size)?;

    if channel.recv_plain_view().len() < min_size {
        return Err(CodecError::WantRead);
    }

    Ok(())
}

/// Drop the fully-buffered current message without forwarding it.
pub fn discard_current_msg(channel: &mut Channel, state: &mut XProtocolState) {
    let current_frame = match state.current_frame {
        Some(f) => f,
        None => return,
    };

    debug_assert!(current_frame.frame_size <= channel.recv_plain_view().len());
    debug_assert_eq!(current_frame.forwarded, 0);

    channel.consume_plain(current_frame.frame_size);
    state.reset_frame();
}

/// The protobuf payload of the fully-buffered current message.
pub fn current_msg_payload<'c>(channel: &'c Channel, state: &XProtocolState) -> &'c [u8] {
    let current_frame = state.current_frame.as_ref().expect("frame header ensured");
    &channel.recv_plain_view()[MSG_PREFIX_SIZE..current_frame.frame_size]
}

// ============================================================================
// Tests
// ============================================================================
