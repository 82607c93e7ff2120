//! Symmetric payload cipher for the CBR wire format.
//!
//! The configured passphrase is hashed with SHA-256 and truncated to 16
//! bytes to form an AES-128 key. Payloads travel as
//! `base64(aes_cbc(deflate(json)))`; an empty passphrase selects the
//! explicit [`SessionCipher::Plaintext`] mode, which skips only the cipher
//! step (compression and base64 still apply).
//!
//! CBC runs with IV fixed equal to the key. This is a known weakness of the
//! deployed wire format and is kept for compatibility; changing it requires
//! a protocol version bump, not a quiet swap.

use std::io::{Read, Write};

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sha2::{Digest, Sha256};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const KEY_LEN: usize = 16;

/// Payload-level failure: the frame arrived intact but its contents could
/// not be turned back into an envelope. Never fatal to a session by itself.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decrypt failed (wrong key or corrupt ciphertext)")]
    Decrypt,

    #[error("inflate failed: {0}")]
    Inflate(#[from] std::io::Error),

    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// True when the payload decoded cleanly but did not contain a
    /// recognizable envelope. Peers that speak the wrong protocol are cut
    /// off; transport-level corruption only costs the one frame.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, FrameError::Json(_))
    }
}

/// Per-connection symmetric cipher, derived once from the shared passphrase.
#[derive(Debug, Clone)]
pub enum SessionCipher {
    Aes { key: [u8; KEY_LEN] },
    /// Compatibility/testing path selected by an empty passphrase.
    Plaintext,
}

impl SessionCipher {
    /// Derive a cipher from the configured passphrase. An empty passphrase
    /// selects plaintext mode explicitly.
    #[must_use]
    pub fn new(passphrase: &str) -> Self {
        if passphrase.is_empty() {
            return SessionCipher::Plaintext;
        }

        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest[..KEY_LEN]);
        SessionCipher::Aes { key }
    }

    #[must_use]
    pub fn is_plaintext(&self) -> bool {
        matches!(self, SessionCipher::Plaintext)
    }

    /// Turn envelope JSON into wire payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Inflate` if compression fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, FrameError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes())?;
        let compressed = encoder.finish()?;

        let body = match self {
            SessionCipher::Aes { key } => {
                // IV = key, matching the deployed wire format.
                Aes128CbcEnc::new(key.into(), key.into())
                    .encrypt_padded_vec_mut::<Pkcs7>(&compressed)
            }
            SessionCipher::Plaintext => compressed,
        };

        Ok(BASE64.encode(body).into_bytes())
    }

    /// Turn wire payload bytes back into envelope JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing the first stage that failed:
    /// base64, decrypt, inflate, or UTF-8.
    pub fn decode(&self, payload: &[u8]) -> Result<String, FrameError> {
        let body = BASE64.decode(payload)?;

        let compressed = match self {
            SessionCipher::Aes { key } => Aes128CbcDec::new(key.into(), key.into())
                .decrypt_padded_vec_mut::<Pkcs7>(&body)
                .map_err(|_| FrameError::Decrypt)?,
            SessionCipher::Plaintext => body,
        };

        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        let mut text = Vec::new();
        decoder.read_to_end(&mut text)?;

        Ok(String::from_utf8(text)?)
    }
}
