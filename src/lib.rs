//! Ephemeral Chat - pairing service for time-boxed 1-on-1 conversations
//!
//! Participants wait in a FIFO queue, get paired two at a time, chat for a
//! fixed round and are then re-queued. A skip ends the round early. Nothing
//! is persisted.

pub mod config;
pub mod error;
pub mod metrics;
pub mod pairing;
pub mod service;
pub mod session;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{PairingError, Result};
pub use types::*;

// Re-export key components
pub use pairing::{Connection, EngineConfig, PairSelector, PairingEngine};
pub use session::{InMemorySessionStore, SessionResolver};
pub use transport::{create_router, ApiState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
