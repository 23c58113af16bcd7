//! Configuration parsing for credbridge
//!
//! This crate handles parsing of:
//! - Bridge settings (`~/.config/credbridge/config.toml`)
//! - Credential helper configuration (`<root>/config.json`, Docker compatible)

mod docker;
mod error;
mod global;

pub use docker::*;
pub use error::*;
pub use global::*;
