// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tunnel frame format.
//!
//! Every websocket binary message carries exactly one frame: a 24-byte
//! header followed by the payload.
//!
//! ```text
//! offset  size  field
//! 0       1     version (currently 1)
//! 1       1     kind
//! 2       8     message id (big-endian i64)
//! 10      8     connection id (big-endian i64)
//! 18      4     deadline in ms (big-endian u32, Connect only, 0 = none)
//! 22      2     text length (big-endian u16)
//! 24      ...   text (address / client key / error reason), then data
//! ```
//!
//! Frames on one connection id are delivered in order; frames on different
//! connection ids may interleave arbitrarily. A `Connect` always precedes
//! `Data` for its connection id; `Error` ends the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::TunnelError;

pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Connect = 1,
    Data = 2,
    Error = 3,
    AddClient = 4,
    RemoveClient = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, TunnelError> {
        match value {
            1 => Ok(FrameKind::Connect),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Error),
            4 => Ok(FrameKind::AddClient),
            5 => Ok(FrameKind::RemoveClient),
            other => Err(TunnelError::Frame(format!("unknown frame kind {other}"))),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: i64,
    pub conn_id: i64,
    pub kind: FrameKind,
    /// Dial deadline for `Connect`; zero means the dialer's default.
    pub deadline_ms: u32,
    /// Address (`Connect`), peer client key (`AddClient`/`RemoveClient`) or
    /// reason (`Error`).
    pub text: String,
    /// Raw bytes for `Data`; empty otherwise.
    pub data: Bytes,
}

impl Frame {
    pub fn connect(id: i64, conn_id: i64, address: &str, deadline_ms: u32) -> Self {
        Self {
            id,
            conn_id,
            kind: FrameKind::Connect,
            deadline_ms,
            text: address.to_string(),
            data: Bytes::new(),
        }
    }

    pub fn data(id: i64, conn_id: i64, data: Bytes) -> Self {
        Self {
            id,
            conn_id,
            kind: FrameKind::Data,
            deadline_ms: 0,
            text: String::new(),
            data,
        }
    }

    pub fn error(id: i64, conn_id: i64, reason: &str) -> Self {
        Self {
            id,
            conn_id,
            kind: FrameKind::Error,
            deadline_ms: 0,
            text: reason.to_string(),
            data: Bytes::new(),
        }
    }

    pub fn add_client(id: i64, client_key: &str) -> Self {
        Self {
            id,
            conn_id: 0,
            kind: FrameKind::AddClient,
            deadline_ms: 0,
            text: client_key.to_string(),
            data: Bytes::new(),
        }
    }

    pub fn remove_client(id: i64, client_key: &str) -> Self {
        Self {
            id,
            conn_id: 0,
            kind: FrameKind::RemoveClient,
            deadline_ms: 0,
            text: client_key.to_string(),
            data: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.text.len() + self.data.len());
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_i64(self.id);
        buf.put_i64(self.conn_id);
        buf.put_u32(self.deadline_ms);
        buf.put_u16(self.text.len() as u16);
        buf.put_slice(self.text.as_bytes());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, TunnelError> {
        if raw.len() < HEADER_LEN {
            return Err(TunnelError::Frame(format!("short frame: {} bytes", raw.len())));
        }
        let version = raw.get_u8();
        if version != FRAME_VERSION {
            return Err(TunnelError::Frame(format!("unknown frame version {version}")));
        }
        let kind = FrameKind::try_from(raw.get_u8())?;
        let id = raw.get_i64();
        let conn_id = raw.get_i64();
        let deadline_ms = raw.get_u32();
        let text_len = raw.get_u16() as usize;
        if raw.len() < text_len {
            return Err(TunnelError::Frame("text length exceeds frame".to_string()));
        }
        let text = String::from_utf8(raw.split_to(text_len).to_vec())
            .map_err(|e| TunnelError::Frame(e.to_string()))?;
        Ok(Self {
            id,
            conn_id,
            kind,
            deadline_ms,
            text,
            data: raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_roundtrip() {
        let frame = Frame::data(7, 42, Bytes::from_static(b"payload bytes"));
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_connect_frame_roundtrip() {
        let frame = Frame::connect(1, 9, "tcp://127.0.0.1:10250", 15_000);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.kind, FrameKind::Connect);
        assert_eq!(decoded.text, "tcp://127.0.0.1:10250");
        assert_eq!(decoded.deadline_ms, 15_000);
    }

    #[test]
    fn test_header_is_twenty_four_bytes() {
        let frame = Frame::error(1, 2, "");
        assert_eq!(frame.encode().len(), HEADER_LEN);
    }

    #[test]
    fn test_short_and_corrupt_frames_rejected() {
        assert!(Frame::decode(Bytes::from_static(b"tiny")).is_err());
        let mut corrupted = BytesMut::from(&Frame::data(1, 1, Bytes::new()).encode()[..]);
        corrupted[0] = 9; // bogus version
        assert!(Frame::decode(corrupted.freeze()).is_err());
    }
}
