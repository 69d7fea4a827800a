//! distcache Common - Shared types and utilities
//!
//! This crate provides the content-hash key type, the clock abstraction,
//! cache policy types, error definitions and configuration used across all
//! distcache components.

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use hash::{HASH_LEN, HashKey};
pub use types::*;
