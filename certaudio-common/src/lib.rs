//! # certaudio Common Library
//!
//! Shared code for the certaudio pipeline crates:
//! - Common error and result types
//! - TOML bootstrap configuration and root folder resolution
//! - Pipeline event types and the broadcast event bus

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
