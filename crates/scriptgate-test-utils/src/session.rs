//! In-memory session harness.
//!
//! Feeds request lines through a real [`Session`] and collects the reply
//! lines, so integration tests exercise the same path as stdio.

use serde_json::Value;
use tempfile::TempDir;

use scriptgate_config::GatewayConfig;
use scriptgate_core::{Dispatcher, Session, SessionSummary};

/// Everything a session wrote, decoded.
#[derive(Debug)]
pub struct Transcript {
    pub ready: Value,
    pub responses: Vec<Value>,
    pub summary: SessionSummary,
}

/// Run a session over raw input lines.
pub async fn run_session(config: &GatewayConfig, lines: &[String]) -> Transcript {
    let dispatcher = Dispatcher::new(config).expect("failed to start dispatcher");
    let mut session = Session::new(dispatcher);

    let mut input = lines.join("\n");
    input.push('\n');
    let mut output = Vec::new();
    let summary = session
        .run(input.as_bytes(), &mut output)
        .await
        .expect("session failed");

    let text = String::from_utf8(output).expect("session wrote invalid UTF-8");
    let mut records = text
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("session wrote invalid JSON"));
    let ready = records.next().expect("no ready record");
    Transcript {
        ready,
        responses: records.collect(),
        summary,
    }
}

/// Run a session over JSON requests, one per line.
pub async fn run_requests(config: &GatewayConfig, requests: &[Value]) -> Transcript {
    let lines: Vec<String> = requests.iter().map(Value::to_string).collect();
    run_session(config, &lines).await
}

/// A temporary directory of Lua modules, removed on drop.
pub struct ModuleDir {
    dir: TempDir,
}

impl ModuleDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    /// Write `<name>.lua` with the given source.
    pub fn write(&self, name: &str, source: &str) -> &Self {
        std::fs::write(self.dir.path().join(format!("{name}.lua")), source)
            .expect("failed to write module");
        self
    }

    /// The directory as a `runtime.module_paths` entry.
    pub fn path_string(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }
}

impl Default for ModuleDir {
    fn default() -> Self {
        Self::new()
    }
}
