//! Common types and constants shared across the retina engine crates.
//!
//! This crate sits at the bottom of the dependency hierarchy:
//! - Has NO dependencies on other workspace crates
//! - Provides configuration and constants every other crate can use

pub mod config;
pub mod constants;

pub use config::{Device, DevicePreference, EngineConfig};
