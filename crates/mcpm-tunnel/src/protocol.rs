use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TunnelError;

/// One multiplexed frame on the tunnel control connection.
///
/// Wire shape (before `LengthDelimitedCodec` framing, which handles the
/// outer 4-byte length prefix): `[tag:u8][conn_id:u32][payload...]`. Payload
/// is only present for [`Frame::Data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A new public connection was accepted by the remote share host;
    /// `conn_id` identifies it for the lifetime of the stream.
    Open(u32),
    /// Bytes traveling in either direction for `conn_id`.
    Data(u32, Bytes),
    /// `conn_id` was closed (by either side); no further frames follow for
    /// that id.
    Close(u32),
}

const TAG_OPEN: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_CLOSE: u8 = 3;

impl Frame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Open(id) => {
                buf.put_u8(TAG_OPEN);
                buf.put_u32(*id);
            }
            Frame::Data(id, payload) => {
                buf.put_u8(TAG_DATA);
                buf.put_u32(*id);
                buf.put_slice(payload);
            }
            Frame::Close(id) => {
                buf.put_u8(TAG_CLOSE);
                buf.put_u32(*id);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, TunnelError> {
        if bytes.len() < 5 {
            return Err(TunnelError::Protocol(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        let tag = bytes.get_u8();
        let conn_id = bytes.get_u32();
        match tag {
            TAG_OPEN => Ok(Frame::Open(conn_id)),
            TAG_DATA => Ok(Frame::Data(conn_id, bytes)),
            TAG_CLOSE => Ok(Frame::Close(conn_id)),
            other => Err(TunnelError::Protocol(format!("unknown frame tag {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_each_variant() {
        for frame in [
            Frame::Open(7),
            Frame::Data(7, Bytes::from_static(b"hello")),
            Frame::Close(7),
        ] {
            let encoded = frame.encode();
            let decoded = Frame::decode(encoded).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn rejects_truncated_frame() {
        assert!(Frame::decode(Bytes::from_static(b"\x01")).is_err());
    }
}
