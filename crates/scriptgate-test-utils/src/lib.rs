#![deny(unsafe_code)]

//! Shared test utilities for the scriptgate workspace.
//!
//! Provides config builders, an in-memory session harness, and tracing
//! helpers so that individual crate tests stay concise.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! scriptgate-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod session;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use session::{ModuleDir, Transcript, run_requests, run_session};
