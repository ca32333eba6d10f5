//! Line-delimited JSON wire protocol.
//!
//! One request record per input line, one [`Response`] per output line,
//! preceded by a single [`ReadyRecord`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use scriptgate_config::PrivilegeTier;

use crate::error::GatewayError;

/// A decoded request line. Fields beyond `command` are operation-specific.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_str: Option<String>,
    /// Shell timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_mode: Option<String>,
}

/// The operation a request resolves to, with its required fields present.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Execute {
        code: String,
        variables: Map<String, Value>,
    },
    Evaluate {
        expression: String,
        variables: Map<String, Value>,
    },
    CallModule {
        module: String,
        function: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Version,
    ListModules,
    ClearGlobals,
    CheckSyntax {
        code: String,
    },
    GetCompletions {
        code: String,
        line: u32,
        column: u32,
    },
    ExecuteShell {
        command: String,
        timeout: Option<Duration>,
    },
    Ping,
    Shutdown,
}

impl Operation {
    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Execute { .. } => "execute",
            Operation::Evaluate { .. } => "evaluate",
            Operation::CallModule { .. } => "call_module",
            Operation::Version => "version",
            Operation::ListModules => "list_modules",
            Operation::ClearGlobals => "clear_globals",
            Operation::CheckSyntax { .. } => "check_syntax",
            Operation::GetCompletions { .. } => "get_completions",
            Operation::ExecuteShell { .. } => "execute_shell",
            Operation::Ping => "ping",
            Operation::Shutdown => "shutdown",
        }
    }

    /// Whether the operation runs at the requested privilege tier.
    pub fn uses_tier(&self) -> bool {
        matches!(
            self,
            Operation::Execute { .. }
                | Operation::Evaluate { .. }
                | Operation::CallModule { .. }
                | Operation::ExecuteShell { .. }
        )
    }
}

impl Request {
    /// Create a request for `command` with no other fields.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Decode one input line.
    pub fn decode(line: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(line).map_err(|e| GatewayError::Decode(format!("JSON decode error: {e}")))
    }

    /// The requested tier. Absent means RESTRICTED; an unknown name is a
    /// decode error rather than a silent downgrade.
    pub fn tier(&self) -> Result<PrivilegeTier, GatewayError> {
        match &self.security_mode {
            None => Ok(PrivilegeTier::default()),
            Some(name) => name
                .parse()
                .map_err(|_| GatewayError::Decode(format!("unknown security_mode {name:?}"))),
        }
    }

    /// Resolve the command name and required fields into an [`Operation`].
    ///
    /// `security_mode` is only checked for operations that use it, so
    /// `ping` and `shutdown` succeed whatever it holds.
    pub fn into_operation(self) -> Result<(Operation, PrivilegeTier), GatewayError> {
        let tier = self.tier();
        let op = match self.command.as_str() {
            "execute" => Operation::Execute {
                code: self.code.unwrap_or_default(),
                variables: self.variables.unwrap_or_default(),
            },
            "evaluate" => Operation::Evaluate {
                expression: required(self.expression, "expression", "evaluate")
                    .and_then(non_blank("expression", "evaluate"))?,
                variables: self.variables.unwrap_or_default(),
            },
            "call_module" => Operation::CallModule {
                module: required(self.module, "module", "call_module")?,
                function: required(self.function, "function", "call_module")?,
                args: self.args.unwrap_or_default(),
                kwargs: self.kwargs.unwrap_or_default(),
            },
            "version" => Operation::Version,
            "list_modules" => Operation::ListModules,
            "clear_globals" => Operation::ClearGlobals,
            "check_syntax" => Operation::CheckSyntax {
                code: self.code.unwrap_or_default(),
            },
            "get_completions" => Operation::GetCompletions {
                code: self.code.unwrap_or_default(),
                line: self.line.unwrap_or(1),
                column: self.column.unwrap_or(0),
            },
            "execute_shell" => Operation::ExecuteShell {
                command: required(self.command_str, "command_str", "execute_shell")?,
                timeout: self.timeout.map(timeout_from_secs).transpose()?,
            },
            "ping" => Operation::Ping,
            "shutdown" => Operation::Shutdown,
            _ => return Err(GatewayError::UnknownCommand(self.command)),
        };
        let tier = if op.uses_tier() { tier? } else { PrivilegeTier::default() };
        Ok((op, tier))
    }
}

fn required(field: Option<String>, name: &str, command: &str) -> Result<String, GatewayError> {
    field.ok_or_else(|| GatewayError::Decode(format!("'{command}' requires field '{name}'")))
}

fn non_blank<'a>(name: &'a str, command: &'a str) -> impl FnOnce(String) -> Result<String, GatewayError> + 'a {
    move |value| {
        if value.trim().is_empty() {
            Err(GatewayError::Decode(format!("'{command}' requires a non-empty '{name}'")))
        } else {
            Ok(value)
        }
    }
}

fn timeout_from_secs(secs: f64) -> Result<Duration, GatewayError> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| GatewayError::Decode(format!("timeout must be a positive number, got {secs}")))
}

/// One reply line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Text captured from `print` during `execute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Response {
    /// A successful reply carrying `result`.
    pub fn ok(result: impl Into<Value>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
            traceback: None,
            output: None,
        }
    }

    /// A failed reply with an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            traceback: None,
            output: None,
        }
    }

    pub fn with_traceback(mut self, traceback: Option<String>) -> Self {
        self.traceback = traceback;
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Attach captured output; empty output is omitted.
    pub fn with_output(mut self, output: String) -> Self {
        if !output.is_empty() {
            self.output = Some(output);
        }
        self
    }

    /// Encode as a single line (no trailing newline).
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            // Only reachable for non-string map keys, which `Value` cannot hold.
            Err(e) => format!(r#"{{"success":false,"error":"response encoding failed: {e}"}}"#),
        }
    }
}

/// First record written by the session, before any request is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyRecord {
    pub status: String,
    pub version: String,
}

impl ReadyRecord {
    pub fn new() -> Self {
        Self {
            status: "ready".to_string(),
            version: crate::build_info::VERSION.to_string(),
        }
    }
}

impl Default for ReadyRecord {
    fn default() -> Self {
        Self::new()
    }
}
