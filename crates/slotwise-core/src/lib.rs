//! # Slotwise Core
//! Shared types, boundary traits, errors and configuration for the
//! scheduling crates.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::SlotwiseConfig;
pub use error::{Result, SlotwiseError};
