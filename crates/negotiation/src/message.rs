//! Negotiation message and its body encoding
//!
//! Layout inside an `RPC_NEGOTIATION` / `RPC_NEGOTIATION_ACK` body:
//!
//! ```text
//! u32 LE status | u32 LE payload length | payload
//! ```

use crate::error::{Error, Result};
use crate::status::NegotiationStatus;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const HEADER_LEN: usize = 8;

/// One round of the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationMessage {
    pub status: NegotiationStatus,
    pub payload: Bytes,
}

impl NegotiationMessage {
    pub fn new(status: NegotiationStatus, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    pub fn empty(status: NegotiationStatus) -> Self {
        Self::new(status, Bytes::new())
    }

    /// Payload as text, for statuses that carry names or reasons
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| {
            Error::codec_error(&format!("{} payload is not utf-8", self.status))
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32_le(self.status.into());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::codec_error(&format!(
                "negotiation message needs {} header bytes, got {}",
                HEADER_LEN,
                buf.len()
            )));
        }
        let raw_status = buf.get_u32_le();
        let status = NegotiationStatus::try_from(raw_status)
            .map_err(|_| Error::codec_error(&format!("unknown negotiation status {}", raw_status)))?;
        let len = buf.get_u32_le() as usize;
        if buf.len() != len {
            return Err(Error::codec_error(&format!(
                "payload length {} does not match remaining {} bytes",
                len,
                buf.len()
            )));
        }
        Ok(Self {
            status,
            payload: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let msg = NegotiationMessage::new(NegotiationStatus::SelectMechanisms, "GSSAPI");
        let encoded = msg.encode();
        assert_eq!(&encoded[..4], &3u32.to_le_bytes());
        assert_eq!(&encoded[4..8], &6u32.to_le_bytes());
        assert_eq!(&encoded[8..], b"GSSAPI");

        let decoded = NegotiationMessage::decode(encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.payload_str().unwrap(), "GSSAPI");
    }

    #[test]
    fn test_empty_payload() {
        let msg = NegotiationMessage::empty(NegotiationStatus::ListMechanisms);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(NegotiationMessage::decode(encoded).unwrap(), msg);
    }

    #[test]
    fn test_decode_errors() {
        assert!(NegotiationMessage::decode(Bytes::from_static(b"\x01\x00")).is_err());

        let mut unknown = BytesMut::new();
        unknown.put_u32_le(42);
        unknown.put_u32_le(0);
        assert!(NegotiationMessage::decode(unknown.freeze()).is_err());

        let mut truncated = BytesMut::new();
        truncated.put_u32_le(6);
        truncated.put_u32_le(10);
        truncated.put_slice(b"abc");
        assert!(NegotiationMessage::decode(truncated.freeze()).is_err());

        let msg = NegotiationMessage::new(NegotiationStatus::AuthFailed, vec![0xff, 0xfe]);
        assert!(msg.payload_str().is_err());
    }
}
