//! CBR relay daemon library: client registry, session state machine, chat
//! router, RPC correlator, liveness probing, and the handler dispatch
//! boundary.

pub mod config;
pub mod correlator;
pub mod error;
pub mod liveness;
pub mod plugin;
pub mod registry;
pub mod router;
pub mod server;

pub use config::{ClientEntry, ServerConfig, TimingConfig};
pub use correlator::CallOutcome;
pub use error::{Result, ServerError};
pub use plugin::{
    CommandEvent, EventHandler, HandlerFuture, HandlerRegistry, MessageEvent, RelayContext,
    ReplyHandle,
};
pub use registry::{ClientRecord, ClientRegistry, Connection, SessionId};
pub use server::{ServerState, run, serve};
