//! Mech layer core - platform-independent building blocks
//!
//! This crate provides the configuration, error types, process abstractions,
//! log sink, channel and connection bootstrapper shared by the platform
//! launchers and the lifecycle coordinator.

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod error;
pub mod log_sink;
pub mod process;

pub use bootstrap::*;
pub use channel::*;
pub use config::*;
pub use error::*;
pub use log_sink::*;
pub use process::*;
