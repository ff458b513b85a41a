//! Configuration module
//!
//! Handles loading client configuration.

mod client;

pub use client::*;
