//! Length-prefixed transport codec for encrypted envelopes.
//!
//! Frames a payload produced by [`SessionCipher`] with a 4-byte big-endian
//! length prefix for reliable delimitation over TCP. Big-endian is part of
//! the protocol, not a platform artifact; both ends must agree.
//!
//! Frame format:
//! ```text
//! +----------------+----------------------+
//! |  4 bytes       |  N bytes             |
//! |  (length BE)   |  (base64 ciphertext) |
//! +----------------+----------------------+
//! ```
//!
//! Payload-level corruption (bad base64, wrong key, bad zlib, bad JSON) is
//! surfaced as [`Decoded::Corrupt`] so the framed stream keeps running and
//! the session decides what to do with the broken frame. Only framing-level
//! problems (oversized length, I/O) are hard [`CodecError`]s.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::crypto::{FrameError, SessionCipher};
use crate::protocol::Envelope;

/// Maximum payload size (8 MB)
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

/// One decoded frame: either a parsed envelope or a description of why the
/// payload could not be parsed.
#[derive(Debug)]
pub enum Decoded {
    Envelope(Envelope),
    Corrupt(FrameError),
}

/// Codec for length-prefixed encrypted envelopes
#[derive(Debug)]
pub struct FrameCodec {
    cipher: Arc<SessionCipher>,
    current_length: Option<usize>,
}

impl FrameCodec {
    #[must_use]
    pub fn new(cipher: Arc<SessionCipher>) -> Self {
        Self {
            cipher,
            current_length: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current_length.is_none() {
            if src.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let len = src.get_u32() as usize;

            if len > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge(len));
            }

            self.current_length = Some(len);
        }

        let Some(length) = self.current_length else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let payload = src.split_to(length);
        self.current_length = None;

        let decoded = match self
            .cipher
            .decode(&payload)
            .and_then(|json| Envelope::parse(&json).map_err(FrameError::from))
        {
            Ok(envelope) => Decoded::Envelope(envelope),
            Err(e) => Decoded::Corrupt(e),
        };

        Ok(Some(decoded))
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = CodecError;

    // Payload size is checked against MAX_FRAME_SIZE (fits in u32)
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = item.to_json().map_err(|e| {
            CodecError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })?;
        let payload = self
            .cipher
            .encode(&json)
            .map_err(|e| CodecError::Io(io::Error::other(e.to_string())))?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);

        Ok(())
    }
}

/// Framing-level errors. Unlike [`Decoded::Corrupt`], these terminate the
/// stream: the length prefix can no longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::cast_possible_truncation)] // Test constants bounded to u32

    use super::*;

    fn codec(passphrase: &str) -> FrameCodec {
        FrameCodec::new(Arc::new(SessionCipher::new(passphrase)))
    }

    fn expect_envelope(decoded: Decoded) -> Envelope {
        match decoded {
            Decoded::Envelope(env) => env,
            Decoded::Corrupt(e) => panic!("expected envelope, got corrupt frame: {e}"),
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = codec("secret");
        let mut buf = BytesMut::new();

        let env = Envelope::chat("survival", "Steve", "hi");
        codec.encode(env.clone(), &mut buf).unwrap();

        let decoded = expect_envelope(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_plaintext_roundtrip() {
        let mut codec = codec("");
        let mut buf = BytesMut::new();

        codec.encode(Envelope::ping(), &mut buf).unwrap();
        let decoded = expect_envelope(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(decoded, Envelope::ping());
    }

    #[test]
    fn test_partial_decode() {
        let mut codec = codec("secret");
        let mut buf = BytesMut::new();
        codec.encode(Envelope::Stop, &mut buf).unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..2]); // half the length prefix
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[2..6]); // rest of prefix + some payload
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[6..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut codec = codec("secret");
        assert!(codec.decode(&mut BytesMut::new()).unwrap().is_none());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut codec = codec("secret");
        let mut buf = BytesMut::new();

        codec.encode(Envelope::ping(), &mut buf).unwrap();
        codec.encode(Envelope::pong(), &mut buf).unwrap();

        let first = expect_envelope(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(first, Envelope::ping());
        let second = expect_envelope(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(second, Envelope::pong());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = codec("secret");
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_corrupt_payload_keeps_stream_alive() {
        let mut codec = codec("secret");
        let mut buf = BytesMut::new();

        // A well-framed frame whose payload is garbage.
        let garbage = b"%%%% definitely not base64 %%%%";
        buf.put_u32(garbage.len() as u32);
        buf.extend_from_slice(garbage);

        // Followed by a valid frame.
        codec.encode(Envelope::ping(), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Decoded::Corrupt(_)));

        let second = expect_envelope(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(second, Envelope::ping());
    }

    #[test]
    fn test_wrong_key_yields_corrupt_frame() {
        let mut writer = codec("alpha");
        let mut reader = codec("beta");
        let mut buf = BytesMut::new();

        writer.encode(Envelope::ping(), &mut buf).unwrap();
        let decoded = reader.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Decoded::Corrupt(_)));
    }

    #[test]
    fn test_unknown_action_is_a_protocol_violation() {
        let cipher = Arc::new(SessionCipher::new("secret"));
        let mut codec = FrameCodec::new(cipher.clone());
        let mut buf = BytesMut::new();

        // A perfectly framed, perfectly encrypted payload that is not a
        // recognizable envelope.
        let payload = cipher.encode(r#"{"action":"dance"}"#).unwrap();
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        match codec.decode(&mut buf).unwrap().unwrap() {
            Decoded::Corrupt(e) => assert!(e.is_protocol_violation()),
            Decoded::Envelope(env) => panic!("unexpected envelope: {env:?}"),
        }
    }

    #[test]
    fn test_decrypt_failure_is_not_a_violation() {
        let mut writer = codec("alpha");
        let mut reader = codec("beta");
        let mut buf = BytesMut::new();

        writer.encode(Envelope::ping(), &mut buf).unwrap();
        match reader.decode(&mut buf).unwrap().unwrap() {
            Decoded::Corrupt(e) => assert!(!e.is_protocol_violation()),
            Decoded::Envelope(env) => panic!("unexpected envelope: {env:?}"),
        }
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let mut codec = codec("secret");
        let mut buf = BytesMut::new();

        codec.encode(Envelope::Stop, &mut buf).unwrap();

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(length, buf.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::FrameTooLarge(20_000_000);
        assert!(err.to_string().contains("20000000"));
        assert!(err.to_string().contains("too large"));
    }
}
