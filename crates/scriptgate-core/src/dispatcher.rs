//! Routes decoded requests to the runtime, introspection and shell services.
//!
//! [`Dispatcher::dispatch`] is the fault boundary: every per-request error
//! becomes a failure [`Response`] here and nothing propagates further.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value as Json, json};
use tracing::{debug, info, warn};

use scriptgate_config::{GatewayConfig, PrivilegeTier, Violation};

use crate::build_info;
use crate::error::GatewayError;
use crate::introspection::Introspection;
use crate::protocol::{Operation, Request, Response};
use crate::runtime::ScriptRuntime;
use crate::session::SessionError;
use crate::shell::ShellRunner;

/// Whether the session keeps reading after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Owns the per-session services and executes one request at a time.
pub struct Dispatcher {
    runtime: ScriptRuntime,
    introspection: Introspection,
    shell: ShellRunner,
    shell_admin_only: bool,
}

impl Dispatcher {
    /// Build every service from a validated configuration.
    pub fn new(config: &GatewayConfig) -> Result<Self, SessionError> {
        let policy = Arc::new(config.build_policy()?);
        let runtime = ScriptRuntime::new(policy, &config.runtime.module_paths)
            .map_err(|e| SessionError::Engine(e.to_string()))?;
        Ok(Self {
            runtime,
            introspection: Introspection::from_config(&config.introspection),
            shell: ShellRunner::from_config(&config.shell),
            shell_admin_only: config.shell.admin_only,
        })
    }

    /// Replace the introspection services.
    pub fn with_introspection(mut self, introspection: Introspection) -> Self {
        self.introspection = introspection;
        self
    }

    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    /// Handle one request. Never fails; faults become failure responses.
    pub async fn dispatch(&mut self, request: Request) -> (Response, Flow) {
        let started = Instant::now();
        let command = request.command.clone();

        let (response, flow) = match request.into_operation() {
            Ok((Operation::Shutdown, _)) => {
                info!("shutdown requested");
                (Response::ok("shutting down"), Flow::Stop)
            }
            Ok((operation, tier)) => {
                let response = self
                    .run(operation, tier)
                    .await
                    .unwrap_or_else(|err| reject(&command, err));
                (response, Flow::Continue)
            }
            Err(err) => (reject(&command, err), Flow::Continue),
        };

        debug!(
            command = %command,
            success = response.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request handled"
        );
        (response, flow)
    }

    async fn run(&mut self, operation: Operation, tier: PrivilegeTier) -> Result<Response, GatewayError> {
        let response = match operation {
            Operation::Execute { code, variables } => {
                let execution = self.runtime.execute(&code, &variables, tier)?;
                Response::ok(execution.result).with_output(execution.output)
            }
            Operation::Evaluate {
                expression,
                variables,
            } => Response::ok(self.runtime.evaluate(&expression, &variables, tier)?),
            Operation::CallModule {
                module,
                function,
                args,
                kwargs,
            } => Response::ok(
                self.runtime
                    .call_capability(&module, &function, &args, &kwargs, tier)?,
            ),
            Operation::Version => Response::ok(self.version_info()),
            Operation::ListModules => Response::ok(self.runtime.modules().to_vec()),
            Operation::ClearGlobals => {
                self.runtime.clear_context()?;
                info!("execution context cleared");
                Response::ok("Globals cleared")
            }
            Operation::CheckSyntax { code } => {
                Response::ok(to_json(&self.introspection.check_syntax(&code).await)?)
            }
            Operation::GetCompletions { code, line, column } => Response::ok(to_json(
                &self.introspection.get_completions(&code, line, column).await,
            )?),
            Operation::ExecuteShell { command, timeout } => {
                self.authorize_shell(tier)?;
                info!(%tier, "shell passthrough");
                Response::ok(to_json(&self.shell.run(&command, timeout).await?)?)
            }
            Operation::Ping => Response::ok("pong"),
            Operation::Shutdown => Response::ok("shutting down"),
        };
        Ok(response)
    }

    fn authorize_shell(&self, tier: PrivilegeTier) -> Result<(), Violation> {
        if self.shell_admin_only && tier != PrivilegeTier::Admin {
            return Err(Violation {
                reason: "shell passthrough requires the ADMIN tier".to_string(),
                tier,
                allowed: self.runtime.policy().allowed(tier),
            });
        }
        Ok(())
    }

    fn version_info(&self) -> Json {
        let engine = self.runtime.engine_version();
        let (major, minor) = engine_release(&engine);
        let build = build_info::BuildInfo::current();
        json!({
            "gateway": build.gateway,
            "git_hash": build.git_hash,
            "build_profile": build.build_profile,
            "build_timestamp": build.build_timestamp,
            "version": engine,
            "version_info": {"major": major, "minor": minor},
            "engine": "mlua",
            "executable": std::env::current_exe().ok().map(|p| p.display().to_string()),
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "pid": std::process::id(),
        })
    }
}

fn reject(command: &str, err: GatewayError) -> Response {
    match &err {
        GatewayError::Security(violation) => {
            warn!(command, tier = %violation.tier, reason = %violation.reason, "request denied");
        }
        other => debug!(command, kind = other.kind(), error = %other, "request failed"),
    }
    Response::from(err)
}

fn to_json<T: Serialize>(value: &T) -> Result<Json, GatewayError> {
    serde_json::to_value(value).map_err(|e| GatewayError::runtime(format!("result encoding failed: {e}")))
}

/// Major and minor release from a `_VERSION` string like `Lua 5.4`.
fn engine_release(version: &str) -> (Option<u32>, Option<u32>) {
    let mut parts = version
        .rsplit(' ')
        .next()
        .unwrap_or_default()
        .split('.')
        .map(|n| n.parse::<u32>().ok());
    (parts.next().flatten(), parts.next().flatten())
}
