//! Stream framing for agent messages.
//!
//! Every message travels as a big-endian `u32` length followed by that many
//! payload bytes. The decoder hands complete payloads to
//! [`protocol::decode_response`]; the encoder prefixes
//! [`protocol::encode_request`] output with its length.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::AgentError;
use crate::protocol::{self, Request, Response};

/// Upper bound on a declared frame length. An agent answering a list of
/// ordinary keys stays far below this; anything larger is garbage.
pub const DEFAULT_MAX_FRAME: usize = 256 * 1024;

/// Length-prefixed frame codec for one agent connection.
#[derive(Debug, Clone)]
pub struct AgentCodec {
    max_frame: usize,
}

impl AgentCodec {
    pub fn new(max_frame: usize) -> Self {
        AgentCodec { max_frame }
    }
}

impl Default for AgentCodec {
    fn default() -> Self {
        AgentCodec::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for AgentCodec {
    type Item = Response;
    type Error = AgentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, AgentError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&src[..4]);
        let frame_len = u32::from_be_bytes(prefix) as usize;

        if frame_len > self.max_frame {
            return Err(AgentError::BadResponse(format!(
                "frame length {frame_len} exceeds the {} byte cap",
                self.max_frame
            )));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(frame_len);
        protocol::decode_response(&frame).map(Some)
    }
}

impl Encoder<Request> for AgentCodec {
    type Error = AgentError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), AgentError> {
        let payload = protocol::encode_request(&request);
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_identities_frame_bytes() {
        let mut codec = AgentCodec::default();
        let mut out = BytesMut::new();
        codec.encode(Request::RequestIdentities, &mut out).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 1, 11]);
    }

    #[test]
    fn failure_frame_decodes() {
        let mut codec = AgentCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 5][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Response::Failure));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = AgentCodec::default();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0, 0]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&[0, 2]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        // The length prefix must not be consumed while waiting.
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&[27, 99]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Response::Unsupported(27))
        );
    }

    #[test]
    fn back_to_back_frames_decode_separately() {
        let mut codec = AgentCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 1, 6, 0, 0, 0, 1, 5]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Response::Success));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Response::Failure));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = AgentCodec::new(16);
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(AgentError::BadResponse(_))
        ));
    }

    #[test]
    fn decode_error_propagates_from_the_payload() {
        let mut codec = AgentCodec::default();
        // SUCCESS with one stray byte inside the frame.
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 6, 9][..]);
        assert_eq!(codec.decode(&mut buf), Err(AgentError::TrailingBytes(1)));
    }
}
