#![deny(unsafe_code)]

//! scriptgate core: a persistent, policy-gated Lua execution gateway.
//!
//! A host process spawns the gateway and talks to it over line-delimited
//! JSON on stdin/stdout. Each request is validated against the
//! [`SecurityPolicy`](scriptgate_config::SecurityPolicy) for its privilege
//! tier, executed against a persistent context, and answered with exactly
//! one response line.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future for async trait methods that
/// need dynamic dispatch.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Request routing and the per-request fault boundary.
pub mod dispatcher;
/// Per-request fault taxonomy.
pub mod error;
/// Process-wide memory and CPU ceilings.
pub mod governor;
/// Syntax diagnostics and completion.
pub mod introspection;
/// Wire records.
pub mod protocol;
/// Embedded Lua engine, execution context and gateway modules.
pub mod runtime;
/// Line-delimited session loop.
pub mod session;
/// OS command passthrough.
pub mod shell;

pub use dispatcher::{Dispatcher, Flow};
pub use error::GatewayError;
pub use introspection::Introspection;
pub use protocol::{Operation, ReadyRecord, Request, Response};
pub use runtime::{Execution, ScriptRuntime};
pub use session::{EndReason, Session, SessionError, SessionSummary, serve_stdio};
pub use shell::{ShellOutcome, ShellRunner};
