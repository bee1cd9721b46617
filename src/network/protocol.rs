//! Legacy Leader Query Protocol
//!
//! Point-to-point datagram exchange answering "who is the leader".
//!
//! Request: 4-byte big-endian xid.
//!
//! Response: up to 36 bytes, big-endian:
//! ```text
//! | xid (4) | server id (8) | leader id (8) | zxid (8) | zero padding (8) |
//! ```
//! A response whose zxid is unavailable stops after the leader id (20 bytes).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Size of a request datagram
pub const REQUEST_LEN: usize = 4;

/// Size of a complete response datagram
pub const RESPONSE_LEN: usize = 36;

/// Size of a response without the zxid field
pub const PARTIAL_RESPONSE_LEN: usize = 20;

const ZXID_END: usize = PARTIAL_RESPONSE_LEN + 8;

/// Encode a request carrying the given xid
pub fn encode_request(xid: u32) -> [u8; REQUEST_LEN] {
    xid.to_be_bytes()
}

/// Decode a request; anything other than exactly 4 bytes is rejected
pub fn decode_request(buf: &[u8]) -> Result<u32> {
    if buf.len() != REQUEST_LEN {
        return Err(Error::Protocol(format!(
            "Request must be exactly {} bytes, got {}",
            REQUEST_LEN,
            buf.len()
        )));
    }
    let mut buf = buf;
    Ok(buf.get_u32())
}

/// Answer to a leader query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderResponse {
    /// Request xid echoed back
    pub xid: u32,
    /// Id of the responding server
    pub server_id: u64,
    /// Leader the responder believes in (itself when leading)
    pub leader_id: u64,
    /// Zxid matching the leader field, if known
    pub zxid: Option<u64>,
}

impl LeaderResponse {
    /// Serialize to wire format
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RESPONSE_LEN);
        buf.put_u32(self.xid);
        buf.put_u64(self.server_id);
        buf.put_u64(self.leader_id);
        if let Some(zxid) = self.zxid {
            buf.put_u64(zxid);
            buf.resize(RESPONSE_LEN, 0);
        }
        buf
    }

    /// Parse from wire format
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PARTIAL_RESPONSE_LEN || buf.len() > RESPONSE_LEN {
            return Err(Error::Protocol(format!(
                "Bad response length {} (expected {}..={})",
                buf.len(),
                PARTIAL_RESPONSE_LEN,
                RESPONSE_LEN
            )));
        }

        let has_zxid = buf.len() >= ZXID_END;
        let mut buf = buf;
        let xid = buf.get_u32();
        let server_id = buf.get_u64();
        let leader_id = buf.get_u64();
        let zxid = if has_zxid { Some(buf.get_u64()) } else { None };

        Ok(Self {
            xid,
            server_id,
            leader_id,
            zxid,
        })
    }
}
