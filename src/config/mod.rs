//! Configuration management for the ephemeral-chat service
//!
//! This module handles configuration loading from TOML files and environment
//! variables, validation, and default values for the pairing service.

pub mod app;

// Re-export commonly used types
pub use app::{validate_config, AppConfig, PairingSettings, ServiceSettings, SessionSettings};
