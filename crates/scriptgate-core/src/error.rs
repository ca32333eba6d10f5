//! Per-request fault taxonomy.
//!
//! Every variant converts into a [`Response`] at the dispatcher boundary.
//! Security and decode faults never carry a trace.

use std::time::Duration;

use serde_json::json;

use scriptgate_config::Violation;

use crate::protocol::Response;

/// A fault produced while handling one request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Denied by the security policy, before or during execution.
    #[error(transparent)]
    Security(#[from] Violation),

    /// The request line could not be decoded.
    #[error("{0}")]
    Decode(String),

    /// Fault raised by executed code or an invoked capability.
    #[error("{message}")]
    Runtime {
        message: String,
        trace: Option<String>,
    },

    /// The requested capability member does not exist.
    #[error("module '{module}' has no attribute '{member}'")]
    AttributeMissing { module: String, member: String },

    /// A shell command exceeded its wall-clock bound.
    #[error("command timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

impl GatewayError {
    /// Shorthand for a runtime fault without a trace.
    pub fn runtime(message: impl Into<String>) -> Self {
        GatewayError::Runtime {
            message: message.into(),
            trace: None,
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Security(_) => "security",
            GatewayError::Decode(_) => "decode",
            GatewayError::Runtime { .. } => "runtime",
            GatewayError::AttributeMissing { .. } => "attribute_missing",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::UnknownCommand(_) => "unknown_command",
        }
    }
}

impl From<GatewayError> for Response {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        match err {
            GatewayError::Runtime { trace, .. } => Response::failure(message).with_traceback(trace),
            GatewayError::Timeout(_) => Response::failure(message).with_result(json!({
                "stdout": "",
                "stderr": "",
                "exit_code": -1,
            })),
            GatewayError::Security(_)
            | GatewayError::Decode(_)
            | GatewayError::AttributeMissing { .. }
            | GatewayError::UnknownCommand(_) => Response::failure(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scriptgate_config::PrivilegeTier;

    #[test]
    fn test_security_response_has_no_trace() {
        let err = GatewayError::Security(Violation {
            reason: "module 'os' is privileged".to_string(),
            tier: PrivilegeTier::Restricted,
            allowed: vec!["json".to_string(), "math".to_string()],
        });
        let resp = Response::from(err);
        assert!(!resp.success);
        assert!(resp.traceback.is_none());
        assert_eq!(
            resp.error.as_deref(),
            Some("security violation: module 'os' is privileged (allowed at RESTRICTED: json, math)")
        );
    }

    #[test]
    fn test_runtime_response_keeps_trace() {
        let err = GatewayError::Runtime {
            message: "boom".to_string(),
            trace: Some("stack traceback:\n\t[C]: in ?".to_string()),
        };
        let resp = Response::from(err);
        assert_eq!(resp.error.as_deref(), Some("boom"));
        assert!(resp.traceback.unwrap().starts_with("stack traceback:"));
    }

    #[test]
    fn test_timeout_response_shape() {
        let resp = Response::from(GatewayError::Timeout(Duration::from_secs(1)));
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("command timed out after 1s"));
        assert_eq!(resp.result.unwrap()["exit_code"], -1);
    }

    #[test]
    fn test_attribute_missing_message() {
        let err = GatewayError::AttributeMissing {
            module: "json".to_string(),
            member: "nope".to_string(),
        };
        assert_eq!(err.to_string(), "module 'json' has no attribute 'nope'");
        assert_eq!(err.kind(), "attribute_missing");
    }
}
