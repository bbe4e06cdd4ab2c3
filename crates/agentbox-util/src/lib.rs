//! Shared utilities for agentbox.
//!
//! - Logging setup with tracing
//! - Host binary discovery for providers that wrap external tools

pub mod bin;
pub mod log;

pub use bin::{find_binary, find_on_path};
