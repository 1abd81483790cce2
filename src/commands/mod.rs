//! Command implementations for the CLI
//!
//! - serve: start the audit server
//! - logs: inspect rows in the embedded store
//! - config: configuration display and validation

pub mod config;
pub mod logs;
pub mod serve;
