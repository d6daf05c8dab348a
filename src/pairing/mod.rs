//! Pairing engine: waiting queue, conversation table, matchmaking and rounds
//!
//! This module contains the core logic for pairing participants into
//! time-boxed 1-on-1 conversations and relaying messages between them.

pub mod conversation;
pub mod engine;
pub mod lifecycle;
pub mod matchmaker;
pub mod queue;
pub mod registry;
pub mod relay;

pub use conversation::{Conversation, ConversationState, ConversationSummary, ConversationTable};
pub use engine::{
    ConnectOutcome, EngineConfig, EngineSnapshot, PairingEngine, PairingStats, Placement,
};
pub use lifecycle::{DisconnectOutcome, SkipOutcome};
pub use matchmaker::{FirstEligiblePairSelector, PairSelector};
pub use queue::{WaitingEntry, WaitingQueue};
pub use registry::{Connection, ConnectionRegistry, ConnectionSender, Delivery, CLOSE_REPLACED};
pub use relay::{DropReason, RelayOutcome};
