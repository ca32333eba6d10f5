//! End-to-end behavior of a gateway session, driven through the same
//! line-delimited loop used over stdio.

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use scriptgate_config::CapabilityTier;
use scriptgate_core::EndReason;
use scriptgate_test_utils::tracing_setup::init_test_tracing;
use scriptgate_test_utils::{ModuleDir, TestConfigBuilder, run_requests, run_session};

fn execute(code: &str, tier: &str) -> Value {
    json!({"command": "execute", "code": code, "security_mode": tier})
}

fn evaluate(expression: &str) -> Value {
    json!({"command": "evaluate", "expression": expression})
}

#[test_log::test(tokio::test)]
async fn test_privileged_denial_lifts_at_admin() {
    let config = TestConfigBuilder::new().build();
    let code = "local os = require('os')\nresult = os.time() > 0";
    let t = run_requests(&config, &[execute(code, "RESTRICTED"), execute(code, "ADMIN")]).await;

    assert_eq!(t.responses[0]["success"], false);
    assert!(t.responses[0].get("traceback").is_none());
    assert_eq!(t.responses[1], json!({"success": true, "result": true}));
}

#[tokio::test]
async fn test_admin_stdout_never_reaches_protocol_stream() {
    let config = TestConfigBuilder::new().build();
    let lines = vec![
        execute("io.write('one\\n'); result = 1", "ADMIN").to_string(),
        execute("_G.print('two'); result = 2", "ADMIN").to_string(),
        execute("io.stdout:write('three\\n'); result = 3", "ADMIN").to_string(),
    ];
    // `run_session` fails on any line that is not JSON.
    let t = run_session(&config, &lines).await;
    assert_eq!(t.responses.len(), 3);
    assert_eq!(t.responses[0], json!({"success": true, "result": 1, "output": "one\n"}));
    assert_eq!(t.responses[1], json!({"success": true, "result": 2, "output": "two\n"}));
    assert_eq!(t.responses[2], json!({"success": true, "result": 3, "output": "three\n"}));
}

#[tokio::test]
async fn test_untiered_commands_ignore_bad_security_mode() {
    let config = TestConfigBuilder::new().build();
    let t = run_requests(
        &config,
        &[
            json!({"command": "ping", "security_mode": "bogus"}),
            json!({"command": "execute", "code": "result = 1", "security_mode": "bogus"}),
            json!({"command": "shutdown", "security_mode": "bogus"}),
            json!({"command": "ping"}),
        ],
    )
    .await;
    assert_eq!(t.responses.len(), 3);
    assert_eq!(t.responses[0]["result"], "pong");
    assert_eq!(t.responses[1]["success"], false);
    assert_eq!(t.responses[2]["result"], "shutting down");
    assert_eq!(t.summary.reason, EndReason::Shutdown);
}

#[tokio::test]
async fn test_evaluate_without_expression_fails() {
    let config = TestConfigBuilder::new().build();
    let t = run_requests(
        &config,
        &[json!({"command": "evaluate"}), json!({"command": "evaluate", "expression": ""})],
    )
    .await;
    for response in &t.responses {
        assert_eq!(response["success"], false, "{response}");
    }
}

#[tokio::test]
async fn test_forbidden_denied_at_every_tier() {
    let config = TestConfigBuilder::new().build();
    let mut requests = Vec::new();
    for code in ["local d = require('debug')", "result = debug.traceback()", "require('coroutine')"] {
        for tier in ["RESTRICTED", "ADMIN"] {
            requests.push(execute(code, tier));
        }
    }
    let t = run_requests(&config, &requests).await;
    assert_eq!(t.responses.len(), requests.len());
    for response in &t.responses {
        assert_eq!(response["success"], false, "{response}");
        assert!(response["error"].as_str().unwrap().contains("security violation"));
    }
}

#[tokio::test]
async fn test_context_persists_and_clears() {
    let config = TestConfigBuilder::new().build();
    let t = run_requests(
        &config,
        &[
            execute("result = 2 + 2", "RESTRICTED"),
            evaluate("result"),
            json!({"command": "clear_globals"}),
            evaluate("result"),
        ],
    )
    .await;

    assert_eq!(t.responses[0]["result"], 4);
    assert_eq!(t.responses[1]["result"], 4);
    assert_eq!(t.responses[2]["result"], "Globals cleared");
    assert_eq!(t.responses[3]["success"], false);
    assert!(
        t.responses[3]["error"].as_str().unwrap().contains("'result' is not defined"),
        "{}",
        t.responses[3]
    );
}

#[tokio::test]
async fn test_malformed_line_then_recovery() {
    let config = TestConfigBuilder::new().build();
    let lines = vec![
        "{\"command\": ".to_string(),
        "[1, 2, 3]".to_string(),
        json!({"command": "ping"}).to_string(),
    ];
    let t = run_session(&config, &lines).await;
    assert_eq!(t.ready["status"], "ready");
    assert_eq!(t.responses.len(), 3);
    assert_eq!(t.responses[0]["success"], false);
    assert_eq!(t.responses[1]["success"], false);
    assert_eq!(t.responses[2]["result"], "pong");
    assert_eq!(t.summary.reason, EndReason::EndOfStream);
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_timeout_is_prompt() {
    init_test_tracing();
    let config = TestConfigBuilder::new().build();
    let started = Instant::now();
    let t = run_requests(
        &config,
        &[json!({
            "command": "execute_shell",
            "command_str": "sleep 5",
            "timeout": 1,
            "security_mode": "ADMIN",
        })],
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(4));

    let response = &t.responses[0];
    assert_eq!(response["success"], false);
    assert_eq!(response["result"], json!({"stdout": "", "stderr": "", "exit_code": -1}));
    assert!(response["error"].as_str().unwrap().contains("timed out"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_default_timeout_from_config() {
    let config = TestConfigBuilder::new().shell_timeouts(1, 2).build();
    let started = Instant::now();
    let t = run_requests(
        &config,
        &[
            json!({"command": "execute_shell", "command_str": "sleep 5", "security_mode": "ADMIN"}),
            json!({"command": "execute_shell", "command_str": "sleep 5", "timeout": 60, "security_mode": "ADMIN"}),
        ],
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(t.responses[0]["error"], "command timed out after 1s");
    assert_eq!(t.responses[1]["error"], "command timed out after 2s");
}

#[tokio::test]
async fn test_shell_gated_to_admin_by_default() {
    let config = TestConfigBuilder::new().build();
    let t = run_requests(&config, &[json!({"command": "execute_shell", "command_str": "true"})]).await;
    assert_eq!(t.responses[0]["success"], false);
    assert!(t.responses[0].get("traceback").is_none());
}

#[tokio::test]
async fn test_check_syntax_single_error() {
    let config = TestConfigBuilder::new().build();
    let t = run_requests(&config, &[json!({"command": "check_syntax", "code": "def f(:"})]).await;
    let errors = t.responses[0]["result"]["errors"].as_array().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["line"], 1);
    assert_eq!(errors[0]["severity"], "error");
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_analyzers_from_config() {
    let config = TestConfigBuilder::new()
        .linter_script("cat >/dev/null; echo 'stdin:1:7: unused variable y'")
        .completer_script(r#"cat >/dev/null; echo '[{"text":"print","type":"function","description":"Prints values"}]'"#)
        .build();
    let t = run_requests(
        &config,
        &[
            json!({"command": "check_syntax", "code": "local y = 1"}),
            json!({"command": "get_completions", "code": "pri", "line": 1, "column": 3}),
        ],
    )
    .await;

    assert_eq!(
        t.responses[0]["result"]["errors"],
        json!([{"line": 1, "column": 6, "message": "unused variable y", "severity": "warning"}])
    );
    assert_eq!(
        t.responses[1]["result"]["completions"],
        json!([{"text": "print", "type": "function", "complete": "print", "description": "Prints values"}])
    );
}

#[tokio::test]
async fn test_completions_without_engine() {
    let config = TestConfigBuilder::new().build();
    let t = run_requests(&config, &[json!({"command": "get_completions", "code": "str"})]).await;
    assert_eq!(t.responses[0]["success"], true);
    assert_eq!(t.responses[0]["result"]["completions"], json!([]));
}

#[tokio::test]
async fn test_ping_never_mutates_context() {
    let config = TestConfigBuilder::new().build();
    let ping = json!({"command": "ping"});
    let t = run_requests(
        &config,
        &[
            execute("result = 7", "RESTRICTED"),
            ping.clone(),
            ping.clone(),
            ping,
            evaluate("result"),
        ],
    )
    .await;
    for response in &t.responses[1..4] {
        assert_eq!(response, &json!({"success": true, "result": "pong"}));
    }
    assert_eq!(t.responses[4]["result"], 7);
}

#[tokio::test]
async fn test_responses_in_order_despite_failures() {
    let config = TestConfigBuilder::new().build();
    let mut requests = Vec::new();
    for i in 0..20 {
        requests.push(match i % 4 {
            0 => evaluate(&i.to_string()),
            1 => json!({"command": "no_such_command"}),
            2 => execute("error('boom')", "RESTRICTED"),
            _ => evaluate(&format!("{i} * 1")),
        });
    }
    let t = run_requests(&config, &requests).await;
    assert_eq!(t.responses.len(), 20);
    assert_eq!(t.summary.handled, 20);
    for (i, response) in t.responses.iter().enumerate() {
        match i % 4 {
            0 | 3 => assert_eq!(response["result"], i as u64),
            1 => assert_eq!(response["error"], "Unknown command: no_such_command"),
            _ => assert!(response["traceback"].is_string() || response["error"].is_string()),
        }
    }
}

#[tokio::test]
async fn test_shutdown_ends_session() {
    let config = TestConfigBuilder::new().build();
    let t = run_requests(
        &config,
        &[json!({"command": "ping"}), json!({"command": "shutdown"}), json!({"command": "ping"})],
    )
    .await;
    assert_eq!(t.responses.len(), 2);
    assert_eq!(t.responses[1]["result"], "shutting down");
    assert_eq!(t.summary.reason, EndReason::Shutdown);
}

#[tokio::test]
async fn test_module_paths_and_operator_capabilities() {
    let modules = ModuleDir::new();
    modules.write(
        "greeter",
        "local M = {}\nfunction M.greet(name, opts)\n  local mark = opts and opts.mark or '.'\n  return 'hello ' .. name .. mark\nend\nreturn M",
    );
    modules.write("vault", "return { open = function() return 'opened' end }");

    let config = TestConfigBuilder::new()
        .module_path(modules.path_string())
        .capability("greeter", CapabilityTier::Safe)
        .build();
    let t = run_requests(
        &config,
        &[
            json!({"command": "call_module", "module": "greeter", "function": "greet",
                   "args": ["ada"], "kwargs": {"mark": "!"}}),
            json!({"command": "call_module", "module": "vault", "function": "open"}),
            json!({"command": "call_module", "module": "vault", "function": "open", "security_mode": "ADMIN"}),
            json!({"command": "list_modules"}),
        ],
    )
    .await;

    assert_eq!(t.responses[0]["result"], "hello ada!");
    assert_eq!(t.responses[1]["success"], false);
    assert_eq!(t.responses[2]["result"], "opened");
    let inventory = t.responses[3]["result"].as_array().unwrap();
    assert!(inventory.contains(&json!("greeter")));
    assert!(inventory.contains(&json!("vault")));
}

#[tokio::test]
async fn test_unknown_capability_can_be_forbidden() {
    let modules = ModuleDir::new();
    modules.write("vault", "return { open = function() return 'opened' end }");
    let config = TestConfigBuilder::new()
        .module_path(modules.path_string())
        .unknown_capability(CapabilityTier::Forbidden)
        .build();
    let t = run_requests(
        &config,
        &[json!({"command": "call_module", "module": "vault", "function": "open", "security_mode": "ADMIN"})],
    )
    .await;
    assert_eq!(t.responses[0]["success"], false);
    assert!(t.responses[0]["error"].as_str().unwrap().contains("security violation"));
}
