//! Bridge-client library for the CBR chat relay.
//!
//! A [`RelayClient`] keeps one persistent encrypted TCP connection to the
//! relay: it logs in, relays chat to a [`BridgeHandler`], answers
//! `command`/`api` requests, and keeps the link alive with a keepalive
//! guardian. When the link drops, a reconnect guardian retries on an
//! escalating backoff schedule until stopped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cbr_client::{ClientOptions, NoopHandler, RelayClient};
//!
//! # async fn example() -> Result<(), cbr_client::ClientError> {
//! let mut options = ClientOptions::new("127.0.0.1:30001", "survival", "hunter2");
//! options.client_type = "mc".to_string();
//!
//! let client = RelayClient::new(options, Arc::new(NoopHandler));
//! client.start();
//! client.wait_connected().await?;
//! client.send_chat("Steve", "hello from the bridge").await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod error;
pub mod guardian;

pub use client::{BridgeHandler, ClientOptions, ConnState, NoopHandler, RelayClient};
pub use error::{ClientError, Result};
pub use guardian::{GuardianEvent, ReconnectGuardian};
