#![deny(unsafe_code)]

//! Configuration loading, validation, capability registry and security
//! policy engine for scriptgate.
//!
//! Loads TOML configuration files and validates them. Provides
//! [`GatewayConfig`] as the central configuration structure, the
//! [`capability`] module for the static capability table, and the
//! [`policy`] module for tier-based code validation.

/// Capability registry: module name to trust tier.
pub mod capability;
/// Lexical security policy engine.
pub mod policy;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capability::{CapabilityRegistry, CapabilityTier, PrivilegeTier};
pub use policy::{SecurityPolicy, Violation};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("capability table: {0}")]
    Registry(#[from] capability::RegistryError),

    #[error("failed to compile policy patterns: {0}")]
    Pattern(#[from] regex::Error),
}

/// Top-level gateway configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Process-wide resource ceilings.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Script runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Capability classification and audit settings.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Shell passthrough configuration.
    #[serde(default)]
    pub shell: ShellConfig,

    /// External syntax and completion analyzers.
    #[serde(default)]
    pub introspection: IntrospectionConfig,
}

/// Memory and CPU ceilings applied once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Apply ceilings at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address-space ceiling in MiB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// Cumulative CPU-time ceiling in seconds.
    #[serde(default = "default_cpu_seconds")]
    pub cpu_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_mb: default_memory_mb(),
            cpu_seconds: default_cpu_seconds(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_memory_mb() -> u64 {
    1024
}

fn default_cpu_seconds() -> u64 {
    300
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "scriptgate=trace").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append logs to this file instead of standard error.
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Script runtime configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directories searched for Lua modules, ahead of the engine defaults.
    #[serde(default)]
    pub module_paths: Vec<String>,
}

/// Capability classification as expressed in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Tier given to names absent from the capability table.
    #[serde(default = "default_unknown_capability")]
    pub unknown_capability: CapabilityTier,

    /// Log privileged-capability usage at ADMIN.
    #[serde(default = "default_true")]
    pub audit_privileged: bool,

    /// Extra (non-built-in) capability classifications.
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityTier>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            unknown_capability: default_unknown_capability(),
            audit_privileged: true,
            capabilities: BTreeMap::new(),
        }
    }
}

fn default_unknown_capability() -> CapabilityTier {
    CapabilityTier::Privileged
}

/// Shell passthrough configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Require the ADMIN tier for `execute_shell`.
    #[serde(default = "default_true")]
    pub admin_only: bool,

    /// Timeout used when a request does not carry one.
    #[serde(default = "default_shell_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Upper bound for requested timeouts.
    #[serde(default = "default_shell_max_timeout_secs")]
    pub max_timeout_secs: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            admin_only: true,
            default_timeout_secs: default_shell_timeout_secs(),
            max_timeout_secs: default_shell_max_timeout_secs(),
        }
    }
}

fn default_shell_timeout_secs() -> u64 {
    30
}

fn default_shell_max_timeout_secs() -> u64 {
    600
}

/// External analyzer commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrospectionConfig {
    /// Static analyzer producing `name:line:col: message` lines.
    #[serde(default)]
    pub linter: Option<ExternalToolConfig>,

    /// Completion engine speaking JSON over stdin/stdout.
    #[serde(default)]
    pub completer: Option<ExternalToolConfig>,

    /// Per-call bound for either tool.
    #[serde(default = "default_introspection_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            linter: None,
            completer: None,
            timeout_secs: default_introspection_timeout_secs(),
        }
    }
}

fn default_introspection_timeout_secs() -> u64 {
    10
}

/// A command line for an external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalToolConfig {
    /// Executable name or path.
    pub command: String,

    /// Arguments passed before any input.
    #[serde(default)]
    pub args: Vec<String>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.enabled {
            if self.limits.memory_mb == 0 {
                return Err(ConfigError::Validation(
                    "limits.memory_mb must be non-zero".to_string(),
                ));
            }
            if self.limits.cpu_seconds == 0 {
                return Err(ConfigError::Validation(
                    "limits.cpu_seconds must be non-zero".to_string(),
                ));
            }
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "logging.level must not be empty".to_string(),
            ));
        }

        if self.policy.unknown_capability == CapabilityTier::Safe {
            return Err(ConfigError::Validation(
                "policy.unknown_capability must be \"privileged\" or \"forbidden\"".to_string(),
            ));
        }
        for name in self.policy.capabilities.keys() {
            if name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "policy.capabilities keys must not be empty".to_string(),
                ));
            }
            if CapabilityRegistry::is_builtin(name.trim()) {
                return Err(ConfigError::Validation(format!(
                    "policy.capabilities cannot reclassify built-in {name:?}"
                )));
            }
        }

        if self.shell.default_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "shell.default_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.shell.max_timeout_secs < self.shell.default_timeout_secs {
            return Err(ConfigError::Validation(format!(
                "shell.max_timeout_secs ({}) must be >= shell.default_timeout_secs ({})",
                self.shell.max_timeout_secs, self.shell.default_timeout_secs
            )));
        }

        if self.introspection.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "introspection.timeout_secs must be at least 1".to_string(),
            ));
        }
        for (label, tool) in [
            ("linter", &self.introspection.linter),
            ("completer", &self.introspection.completer),
        ] {
            if tool.as_ref().is_some_and(|t| t.command.trim().is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "introspection.{label}.command must not be empty"
                )));
            }
        }

        for (i, path) in self.runtime.module_paths.iter().enumerate() {
            if path.contains(';') || path.contains('?') {
                return Err(ConfigError::Validation(format!(
                    "runtime.module_paths[{i}] must not contain ';' or '?', got {path:?}"
                )));
            }
        }

        Ok(())
    }

    /// Build the immutable [`CapabilityRegistry`] from the policy section.
    pub fn build_registry(&self) -> Result<CapabilityRegistry, ConfigError> {
        Ok(CapabilityRegistry::with_overrides(
            &self.policy.capabilities,
            self.policy.unknown_capability,
        )?)
    }

    /// Build the [`SecurityPolicy`] engine from the policy section.
    pub fn build_policy(&self) -> Result<SecurityPolicy, ConfigError> {
        let registry = self.build_registry()?;
        Ok(SecurityPolicy::new(registry, self.policy.audit_privileged)?)
    }
}
