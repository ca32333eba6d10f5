//! Configuration builders for tests.

use scriptgate_config::{CapabilityTier, ExternalToolConfig, GatewayConfig};

/// Fluent builder for [`GatewayConfig`]. Resource ceilings start disabled
/// so tests never limit the test process.
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .capability("yaml", CapabilityTier::Safe)
///     .shell_admin_only(false)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: GatewayConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = GatewayConfig::default();
        config.limits.enabled = false;
        Self { config }
    }

    pub fn module_path(mut self, path: impl Into<String>) -> Self {
        self.config.runtime.module_paths.push(path.into());
        self
    }

    pub fn unknown_capability(mut self, tier: CapabilityTier) -> Self {
        self.config.policy.unknown_capability = tier;
        self
    }

    pub fn capability(mut self, name: &str, tier: CapabilityTier) -> Self {
        self.config.policy.capabilities.insert(name.to_string(), tier);
        self
    }

    pub fn shell_admin_only(mut self, admin_only: bool) -> Self {
        self.config.shell.admin_only = admin_only;
        self
    }

    pub fn shell_timeouts(mut self, default_secs: u64, max_secs: u64) -> Self {
        self.config.shell.default_timeout_secs = default_secs;
        self.config.shell.max_timeout_secs = max_secs;
        self
    }

    /// Bind a `sh -c` script as the linter.
    pub fn linter_script(mut self, script: &str) -> Self {
        self.config.introspection.linter = Some(sh(script));
        self
    }

    /// Bind a `sh -c` script as the completion engine.
    pub fn completer_script(mut self, script: &str) -> Self {
        self.config.introspection.completer = Some(sh(script));
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn sh(script: &str) -> ExternalToolConfig {
    ExternalToolConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}
