//! Analyzers backed by external commands.
//!
//! The linter receives the code on stdin and prints `name:line:col: message`
//! lines (columns 1-based). The completion engine receives
//! `{"code", "line", "column"}` on stdin and prints a JSON array of records.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value as Json, json};
use tokio::io::AsyncWriteExt;

use scriptgate_config::ExternalToolConfig;

use crate::BoxFuture;

use super::{CompletionEngine, Diagnostic, IntrospectionError, Linter, Severity};

/// Static analyzer run as a child process per request.
pub struct ExternalLinter {
    tool: ExternalToolConfig,
    timeout: Duration,
}

impl ExternalLinter {
    pub fn new(tool: ExternalToolConfig, timeout: Duration) -> Self {
        Self { tool, timeout }
    }
}

impl Linter for ExternalLinter {
    fn name(&self) -> &str {
        &self.tool.command
    }

    fn lint<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<Vec<Diagnostic>, IntrospectionError>> {
        Box::pin(async move {
            let output = run_tool(&self.tool, code.as_bytes(), self.timeout).await?;
            let found: Vec<Diagnostic> = output.stdout.lines().filter_map(parse_lint_line).collect();
            if found.is_empty() && !output.success {
                return Err(IntrospectionError::Failed(output.stderr));
            }
            Ok(found)
        })
    }
}

/// Completion engine run as a child process per request.
pub struct ExternalCompleter {
    tool: ExternalToolConfig,
    timeout: Duration,
}

impl ExternalCompleter {
    pub fn new(tool: ExternalToolConfig, timeout: Duration) -> Self {
        Self { tool, timeout }
    }
}

impl CompletionEngine for ExternalCompleter {
    fn name(&self) -> &str {
        &self.tool.command
    }

    fn complete<'a>(
        &'a self,
        code: &'a str,
        line: u32,
        column: u32,
    ) -> BoxFuture<'a, Result<Vec<Json>, IntrospectionError>> {
        Box::pin(async move {
            let input = json!({"code": code, "line": line, "column": column}).to_string();
            let output = run_tool(&self.tool, input.as_bytes(), self.timeout).await?;
            if !output.success {
                return Err(IntrospectionError::Failed(output.stderr));
            }
            serde_json::from_str(&output.stdout).map_err(|e| IntrospectionError::Parse(e.to_string()))
        })
    }
}

struct ToolOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Spawn `tool`, feed it `input`, and collect its output within `timeout`.
/// The child is killed if the bound elapses.
async fn run_tool(
    tool: &ExternalToolConfig,
    input: &[u8],
    timeout: Duration,
) -> Result<ToolOutput, IntrospectionError> {
    let mut child = tokio::process::Command::new(&tool.command)
        .args(&tool.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IntrospectionError::NotInstalled(tool.command.clone()),
            _ => IntrospectionError::Failed(format!("spawn {}: {e}", tool.command)),
        })?;

    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A tool may exit without reading its input.
            if let Err(e) = stdin.write_all(input).await {
                tracing::debug!(error = %e, "analyzer closed stdin early");
            }
        }
    };

    let (_, waited) = tokio::time::timeout(timeout, async { tokio::join!(feed, child.wait_with_output()) })
        .await
        .map_err(|_| IntrospectionError::Timeout(timeout))?;
    let output = waited.map_err(|e| IntrospectionError::Failed(format!("wait failed: {e}")))?;

    Ok(ToolOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Parse one `name:line:col: message` line. The name may itself contain
/// colons.
fn parse_lint_line(line: &str) -> Option<Diagnostic> {
    let mut rest = line;
    while let Some(idx) = rest.find(':') {
        rest = &rest[idx + 1..];
        let mut fields = rest.splitn(3, ':');
        let (Some(row), Some(col), Some(message)) = (fields.next(), fields.next(), fields.next()) else {
            return None;
        };
        if let (Ok(row), Ok(col)) = (row.trim().parse::<u32>(), col.trim().parse::<u32>()) {
            return Some(Diagnostic {
                line: row,
                column: col.saturating_sub(1),
                message: message.trim().to_string(),
                severity: Severity::Warning,
            });
        }
    }
    None
}
