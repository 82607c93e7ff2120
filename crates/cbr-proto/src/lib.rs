//! Wire protocol definitions for the CBR chat relay.
//!
//! This crate provides the envelope types, the symmetric payload cipher, and
//! the length-prefixed transport codec shared by the relay server and bridge
//! clients.
//!
//! # Architecture
//!
//! - [`protocol`]: tagged [`Envelope`] union and the `command`/`api` result
//!   sub-object
//! - [`crypto`]: SHA-256-derived AES-128-CBC payload cipher with explicit
//!   plaintext mode
//! - [`transport`]: 4-byte big-endian length-prefixed codec whose decoder
//!   survives payload corruption
//!
//! # Example
//!
//! ```
//! use cbr_proto::{Envelope, SessionCipher};
//!
//! let cipher = SessionCipher::new("shared secret");
//! let json = Envelope::chat("survival", "Steve", "hi").to_json().unwrap();
//! let payload = cipher.encode(&json).unwrap();
//! assert_eq!(cipher.decode(&payload).unwrap(), json);
//! ```

pub mod crypto;
pub mod protocol;
pub mod transport;

// Re-export protocol types
pub use protocol::{
    CallResult, Envelope, LIB_VERSION, LOGIN_FAIL, LOGIN_SUCCESS, PingKind, result_kind,
};

// Re-export crypto types
pub use crypto::{FrameError, SessionCipher};

// Re-export transport types
pub use transport::{CodecError, Decoded, FrameCodec};
