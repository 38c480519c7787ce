//! Configuration module for the daily camera merge daemon
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and load-time validation.

pub mod config;

pub use config::*;
