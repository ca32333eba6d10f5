//! Syntax diagnostics and position-based completion.
//!
//! Syntax checking always starts with a pure parse in the embedded engine;
//! a parse failure yields exactly one error diagnostic. Static analysis and
//! completion are delegated to optional external tools behind the
//! [`Linter`] and [`CompletionEngine`] traits. A missing tool is never a
//! failure: it yields an empty list.

pub mod external;

pub use external::{ExternalCompleter, ExternalLinter};

use std::time::Duration;

use mlua::Lua;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use scriptgate_config::IntrospectionConfig;

use crate::BoxFuture;
use crate::runtime::CHUNK_NAME;

/// Upper bound on completion items per reply.
pub const MAX_COMPLETIONS: usize = 50;
/// Completion descriptions are cut to this many characters.
pub const MAX_DESCRIPTION_CHARS: usize = 200;
/// Completion signatures are cut to this many characters.
pub const MAX_SIGNATURE_CHARS: usize = 120;

/// Errors from external analyzers. Never surfaced as request failures.
#[derive(Debug, thiserror::Error)]
pub enum IntrospectionError {
    #[error("analyzer not installed: {0}")]
    NotInstalled(String),

    #[error("analyzer failed: {0}")]
    Failed(String),

    #[error("analyzer timed out after {0:?}")]
    Timeout(Duration),

    #[error("analyzer output unreadable: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A positioned finding. `line` is 1-based, `column` 0-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub severity: Severity,
}

/// Reply body for `check_syntax`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxReport {
    pub errors: Vec<Diagnostic>,
}

/// One completion candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionItem {
    /// Display text.
    pub text: String,
    /// Kind, e.g. `function`, `module`, `keyword`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Text to insert.
    pub complete: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl CompletionItem {
    /// Extract an item from an engine record. Records without a display
    /// text yield `None`.
    pub fn from_json(value: &Json) -> Option<Self> {
        let text = value
            .get("text")
            .or_else(|| value.get("name"))?
            .as_str()?
            .to_string();
        let field = |name: &str| value.get(name).and_then(Json::as_str).filter(|s| !s.is_empty());
        Some(Self {
            kind: field("type").unwrap_or("unknown").to_string(),
            complete: field("complete").map_or_else(|| text.clone(), str::to_string),
            description: field("description").map(|s| truncate(s, MAX_DESCRIPTION_CHARS)),
            signature: field("signature").map(|s| truncate(s, MAX_SIGNATURE_CHARS)),
            text,
        })
    }
}

/// Reply body for `get_completions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completions {
    pub completions: Vec<CompletionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Completions {
    fn unavailable(note: impl Into<String>) -> Self {
        Self {
            completions: Vec::new(),
            note: Some(note.into()),
        }
    }
}

/// External static analyzer.
pub trait Linter: Send + Sync {
    fn name(&self) -> &str;

    /// Analyze syntactically valid code, returning warnings.
    fn lint<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<Vec<Diagnostic>, IntrospectionError>>;
}

/// External completion engine.
pub trait CompletionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Raw candidate records for the given position.
    fn complete<'a>(
        &'a self,
        code: &'a str,
        line: u32,
        column: u32,
    ) -> BoxFuture<'a, Result<Vec<Json>, IntrospectionError>>;
}

/// Introspection services: a parse-only engine plus optional analyzers.
pub struct Introspection {
    parser: Lua,
    linter: Option<Box<dyn Linter>>,
    completer: Option<Box<dyn CompletionEngine>>,
}

impl Introspection {
    /// Parse-only services with no external analyzers.
    pub fn new() -> Self {
        Self {
            parser: Lua::new(),
            linter: None,
            completer: None,
        }
    }

    /// Services with the analyzers named in `config`.
    pub fn from_config(config: &IntrospectionConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut services = Self::new();
        if let Some(tool) = &config.linter {
            services = services.with_linter(Box::new(ExternalLinter::new(tool.clone(), timeout)));
        }
        if let Some(tool) = &config.completer {
            services =
                services.with_completer(Box::new(ExternalCompleter::new(tool.clone(), timeout)));
        }
        services
    }

    pub fn with_linter(mut self, linter: Box<dyn Linter>) -> Self {
        self.linter = Some(linter);
        self
    }

    pub fn with_completer(mut self, completer: Box<dyn CompletionEngine>) -> Self {
        self.completer = Some(completer);
        self
    }

    /// Compile without running. Returns the syntax error, if any.
    pub fn parse(&self, code: &str) -> Option<Diagnostic> {
        match self.parser.load(code).set_name(CHUNK_NAME).into_function() {
            Ok(_) => None,
            Err(mlua::Error::SyntaxError { message, .. }) => Some(syntax_diagnostic(&message, code)),
            Err(other) => Some(syntax_diagnostic(&other.to_string(), code)),
        }
    }

    /// Parse, then lint if the parse succeeded and a linter is bound.
    pub async fn check_syntax(&self, code: &str) -> SyntaxReport {
        if let Some(error) = self.parse(code) {
            return SyntaxReport {
                errors: vec![error],
            };
        }
        let Some(linter) = &self.linter else {
            return SyntaxReport::default();
        };
        match linter.lint(code).await {
            Ok(mut warnings) => {
                for warning in &mut warnings {
                    warning.severity = Severity::Warning;
                }
                SyntaxReport { errors: warnings }
            }
            Err(IntrospectionError::NotInstalled(tool)) => {
                debug!(%tool, "linter not installed");
                SyntaxReport::default()
            }
            Err(e) => {
                warn!(linter = linter.name(), error = %e, "linter failed");
                SyntaxReport::default()
            }
        }
    }

    /// Completion candidates at a position. Never fails.
    pub async fn get_completions(&self, code: &str, line: u32, column: u32) -> Completions {
        let Some(engine) = &self.completer else {
            return Completions::unavailable("no completion engine configured");
        };
        match engine.complete(code, line, column).await {
            Ok(records) => Completions {
                completions: records
                    .iter()
                    .filter_map(CompletionItem::from_json)
                    .take(MAX_COMPLETIONS)
                    .collect(),
                note: None,
            },
            Err(IntrospectionError::NotInstalled(tool)) => {
                Completions::unavailable(format!("completion engine '{tool}' is not installed"))
            }
            Err(e) => {
                warn!(engine = engine.name(), error = %e, "completion engine failed");
                Completions::unavailable(format!("completion unavailable: {e}"))
            }
        }
    }
}

impl Default for Introspection {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Build a diagnostic from an engine message like
/// `input:3: unexpected symbol near 'x'`.
fn syntax_diagnostic(message: &str, code: &str) -> Diagnostic {
    let body = message.strip_prefix("input:").unwrap_or(message);
    let (line, text) = body
        .split_once(':')
        .and_then(|(n, rest)| n.trim().parse::<u32>().ok().map(|n| (n, rest.trim())))
        .unwrap_or((1, message.trim()));
    Diagnostic {
        line,
        column: error_column(text, code, line),
        message: text.to_string(),
        severity: Severity::Error,
    }
}

/// Column of the token named in `near '...'`, or end of line for `<eof>`.
/// A token that occurs more than once on the line gives column 0.
fn error_column(text: &str, code: &str, line: u32) -> u32 {
    let source_line = code
        .lines()
        .nth(line.saturating_sub(1) as usize)
        .unwrap_or_default();
    if text.ends_with("near <eof>") {
        return source_line.chars().count() as u32;
    }
    let token = text
        .rsplit_once("near '")
        .and_then(|(_, rest)| rest.strip_suffix('\''));
    let Some(token) = token.filter(|tok| !tok.is_empty()) else {
        return 0;
    };
    let mut found = source_line.match_indices(token).map(|(byte, _)| byte);
    match (found.next(), found.next()) {
        (Some(byte), None) => source_line[..byte].chars().count() as u32,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct FixedLinter(Vec<Diagnostic>);

    impl Linter for FixedLinter {
        fn name(&self) -> &str {
            "fixed"
        }

        fn lint<'a>(&'a self, _code: &'a str) -> BoxFuture<'a, Result<Vec<Diagnostic>, IntrospectionError>> {
            let found = self.0.clone();
            Box::pin(async move { Ok(found) })
        }
    }

    struct FixedEngine(Result<Vec<Json>, String>);

    impl CompletionEngine for FixedEngine {
        fn name(&self) -> &str {
            "fixed"
        }

        fn complete<'a>(
            &'a self,
            _code: &'a str,
            _line: u32,
            _column: u32,
        ) -> BoxFuture<'a, Result<Vec<Json>, IntrospectionError>> {
            let outcome = self.0.clone().map_err(IntrospectionError::Failed);
            Box::pin(async move { outcome })
        }
    }

    #[tokio::test]
    async fn test_syntax_error_is_single_diagnostic() {
        let services = Introspection::new();
        let report = services.check_syntax("def f(:").await;
        assert_eq!(report.errors.len(), 1);
        let error = &report.errors[0];
        assert_eq!(error.line, 1);
        assert_eq!(error.severity, Severity::Error);
        assert!(error.message.contains("near"), "{}", error.message);
    }

    #[tokio::test]
    async fn test_syntax_error_line_and_column() {
        let services = Introspection::new();
        let report = services.check_syntax("local a = 1\nlocal b = 1 +* 2\n").await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].line, 2);
        assert_eq!(report.errors[0].column, 13);
    }

    #[test]
    fn test_repeated_token_has_no_column() {
        let code = "y = 1\nx = x == = 2";
        assert_eq!(error_column("unexpected symbol near '='", code, 2), 0);
        assert_eq!(error_column("unexpected symbol near '2'", code, 2), 11);
        assert_eq!(error_column("malformed number", code, 2), 0);
    }

    #[tokio::test]
    async fn test_unclosed_block_points_at_end() {
        let services = Introspection::new();
        let report = services.check_syntax("if x then\n  y = 1").await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].line, 2);
        assert_eq!(report.errors[0].column, 7);
    }

    #[tokio::test]
    async fn test_valid_code_without_linter_is_clean() {
        let report = Introspection::new().check_syntax("x = 1").await;
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_parse_error_short_circuits_linter() {
        let warning = Diagnostic {
            line: 1,
            column: 0,
            message: "unused".to_string(),
            severity: Severity::Error,
        };
        let services = Introspection::new().with_linter(Box::new(FixedLinter(vec![warning])));

        let report = services.check_syntax("x = = 1").await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].severity, Severity::Error);

        let report = services.check_syntax("x = 1").await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_completions_absent_engine() {
        let completions = Introspection::new().get_completions("pri", 1, 3).await;
        assert!(completions.completions.is_empty());
        assert!(completions.note.is_some());
    }

    #[tokio::test]
    async fn test_completions_skip_bad_items_and_cap() {
        let mut records = vec![json!({"type": "function"}), json!(42)];
        for i in 0..60 {
            records.push(json!({"text": format!("item{i}"), "type": "function"}));
        }
        let services = Introspection::new().with_completer(Box::new(FixedEngine(Ok(records))));
        let completions = services.get_completions("", 1, 0).await;
        assert_eq!(completions.completions.len(), MAX_COMPLETIONS);
        assert_eq!(completions.completions[0].text, "item0");
        assert_eq!(completions.completions[0].complete, "item0");
    }

    #[tokio::test]
    async fn test_completions_engine_failure_is_empty() {
        let services = Introspection::new()
            .with_completer(Box::new(FixedEngine(Err("crashed".to_string()))));
        let completions = services.get_completions("", 1, 0).await;
        assert!(completions.completions.is_empty());
        assert!(completions.note.unwrap().contains("crashed"));
    }

    #[test]
    fn test_completion_item_truncation() {
        let long = "d".repeat(500);
        let item = CompletionItem::from_json(&json!({
            "name": "format",
            "type": "function",
            "complete": "mat(",
            "description": long,
            "signature": "s".repeat(300),
        }))
        .unwrap();
        assert_eq!(item.text, "format");
        assert_eq!(item.complete, "mat(");
        assert_eq!(item.description.unwrap().chars().count(), MAX_DESCRIPTION_CHARS);
        assert_eq!(item.signature.unwrap().chars().count(), MAX_SIGNATURE_CHARS);
    }

    #[test]
    fn test_completion_item_serializes_kind_as_type() {
        let item = CompletionItem::from_json(&json!({"text": "x"})).unwrap();
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value, json!({"text": "x", "type": "unknown", "complete": "x"}));
    }
}
