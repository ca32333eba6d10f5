//! Security policy engine: a lexical gate for submitted script text.
//!
//! [`SecurityPolicy::validate`] scans source text before execution:
//!
//! 1. References to every capability whose tier exceeds the requested
//!    [`PrivilegeTier`], in two shapes (case-insensitive):
//!    `require "name"` and qualified access `name.member` / `name:member`.
//! 2. Every literal `require` target, classified through the registry so
//!    unknown names get the configured default.
//! 3. At RESTRICTED only: dangerous primitive names and call-site patterns.
//!
//! This is textual matching, not semantic analysis. Aliasing or names built
//! at runtime evade it, which is why [`SecurityPolicy::check_import`] re-applies
//! the same rule when a module is actually resolved.

use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::capability::{CapabilityRegistry, CapabilityTier, PrivilegeTier};

/// Audit log target for privileged-capability usage at ADMIN.
pub const AUDIT_TARGET: &str = "scriptgate::audit";

/// Primitive names scanned for at RESTRICTED.
pub const DANGEROUS_PRIMITIVES: &[&str] = &[
    "load",
    "loadstring",
    "dofile",
    "loadfile",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "getmetatable",
    "setmetatable",
    "collectgarbage",
    "getfenv",
    "setfenv",
    "newproxy",
    "_G",
    "_ENV",
];

/// Call-site patterns scanned for at RESTRICTED, with the reason reported.
const DANGEROUS_CALL_SITES: &[(&str, &str)] = &[
    (r"\bstring\s*\.\s*dump\b", "bytecode dumping (string.dump)"),
    (r":\s*dump\s*\(", "bytecode dumping via method call"),
    (r"\b__gc\b", "finalizer metamethod (__gc)"),
    (
        r#"\[\s*["']_[A-Za-z_]*["']\s*\]"#,
        "string-indexed access to reserved names",
    ),
];

/// A structured denial. Carries the reason and the capability list that is
/// reachable at the requested tier; never any trace state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("security violation: {reason} (allowed at {tier}: {})", .allowed.join(", "))]
pub struct Violation {
    /// Human-readable denial reason.
    pub reason: String,
    /// Tier the request asked for.
    pub tier: PrivilegeTier,
    /// Capabilities reachable at that tier.
    pub allowed: Vec<String>,
}

/// Precompiled patterns for one non-SAFE capability.
#[derive(Debug)]
struct CapabilityPattern {
    name: String,
    tier: CapabilityTier,
    import: Regex,
    access: Regex,
}

impl CapabilityPattern {
    fn compile(name: &str, tier: CapabilityTier) -> Result<Self, regex::Error> {
        let escaped = regex::escape(name);
        let import = Regex::new(&format!(
            r#"(?i)\brequire\s*\(?\s*(?:"|'|\[\[){escaped}(?:[."']|\]\])"#
        ))?;
        let access = Regex::new(&format!(
            r"(?i)(?:^|[^.\w]){escaped}\s*[.:]\s*[A-Za-z_]"
        ))?;
        Ok(Self {
            name: name.to_string(),
            tier,
            import,
            access,
        })
    }

    fn referenced_by(&self, code: &str) -> bool {
        self.import.is_match(code) || self.access.is_match(code)
    }
}

/// Validates submitted code against a requested tier.
///
/// Built once at startup from an immutable [`CapabilityRegistry`]; all
/// patterns are compiled up front so validation never compiles regexes.
#[derive(Debug)]
pub struct SecurityPolicy {
    registry: CapabilityRegistry,
    patterns: Vec<CapabilityPattern>,
    require_literal: Regex,
    primitives: Regex,
    call_sites: Vec<(Regex, &'static str)>,
    audit_privileged: bool,
}

impl SecurityPolicy {
    /// Compile a policy over the given registry.
    pub fn new(registry: CapabilityRegistry, audit_privileged: bool) -> Result<Self, regex::Error> {
        let patterns = registry
            .iter()
            .filter(|(_, tier)| *tier != CapabilityTier::Safe)
            .map(|(name, tier)| CapabilityPattern::compile(name, tier))
            .collect::<Result<Vec<_>, _>>()?;

        let require_literal =
            Regex::new(r#"\brequire\s*\(?\s*(?:"([^"\n]+)"|'([^'\n]+)'|\[\[(.+?)\]\])"#)?;

        let alternation = DANGEROUS_PRIMITIVES
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let primitives = Regex::new(&format!(r"\b(?:{alternation})\b"))?;

        let call_sites = DANGEROUS_CALL_SITES
            .iter()
            .map(|(pattern, reason)| Regex::new(pattern).map(|re| (re, *reason)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            registry,
            patterns,
            require_literal,
            primitives,
            call_sites,
            audit_privileged,
        })
    }

    /// The registry this policy classifies against.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Validate `code` for execution at `tier`.
    pub fn validate(&self, code: &str, tier: PrivilegeTier) -> Result<(), Violation> {
        for pattern in &self.patterns {
            if !pattern.referenced_by(code) {
                continue;
            }
            if !tier.allows(pattern.tier) {
                return Err(self.violation(
                    tier,
                    format!(
                        "module '{}' is {} and not permitted at {tier}",
                        pattern.name, pattern.tier
                    ),
                ));
            }
            self.audit(tier, pattern.tier, &pattern.name, "referenced");
        }

        for name in self.required_literals(code) {
            let cap = self.registry.tier_of(&name);
            if !tier.allows(cap) {
                return Err(self.violation(
                    tier,
                    format!("module '{name}' is {cap} and not permitted at {tier}"),
                ));
            }
        }

        if tier == PrivilegeTier::Restricted {
            if let Some(found) = self.primitives.find(code) {
                return Err(self.violation(
                    tier,
                    format!("use of '{}' is not permitted at {tier}", found.as_str()),
                ));
            }
            for (pattern, reason) in &self.call_sites {
                if pattern.is_match(code) {
                    return Err(self.violation(
                        tier,
                        format!("{reason} is not permitted at {tier}"),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Re-apply the tier rule when `name` is resolved at runtime.
    pub fn check_import(&self, name: &str, tier: PrivilegeTier) -> Result<(), Violation> {
        let cap = self.registry.tier_of(name);
        if !tier.allows(cap) {
            return Err(self.violation(
                tier,
                format!("import of '{name}' ({cap}) denied at {tier}"),
            ));
        }
        self.audit(tier, cap, name, "imported");
        Ok(())
    }

    /// Capabilities reachable at `tier`, sorted.
    pub fn allowed(&self, tier: PrivilegeTier) -> Vec<String> {
        self.registry.allowed(tier)
    }

    fn required_literals(&self, code: &str) -> Vec<String> {
        self.require_literal
            .captures_iter(code)
            .filter_map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(2))
                    .or_else(|| caps.get(3))
                    .map(|m| m.as_str().trim().to_string())
            })
            .collect()
    }

    fn violation(&self, tier: PrivilegeTier, reason: String) -> Violation {
        Violation {
            reason,
            tier,
            allowed: self.registry.allowed(tier),
        }
    }

    fn audit(&self, tier: PrivilegeTier, cap: CapabilityTier, name: &str, how: &str) {
        if self.audit_privileged && tier == PrivilegeTier::Admin && cap == CapabilityTier::Privileged
        {
            info!(target: AUDIT_TARGET, capability = %name, usage = how, "privileged capability used");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    fn policy() -> SecurityPolicy {
        SecurityPolicy::new(CapabilityRegistry::builtin(), true).unwrap()
    }

    #[test]
    fn test_safe_code_passes_both_tiers() {
        let policy = policy();
        let code = r#"local json = require("json"); result = json.encode({a = 1})"#;
        assert!(policy.validate(code, PrivilegeTier::Restricted).is_ok());
        assert!(policy.validate(code, PrivilegeTier::Admin).is_ok());
    }

    #[test]
    fn test_privileged_import_denied_restricted_allowed_admin() {
        let policy = policy();
        for code in [
            r#"local os = require("os")"#,
            r#"local os = require 'os'"#,
            r#"local f = REQUIRE "IO""#,
            r#"local http = require("socket.http")"#,
        ] {
            let err = policy.validate(code, PrivilegeTier::Restricted).unwrap_err();
            assert_eq!(err.tier, PrivilegeTier::Restricted);
            assert!(policy.validate(code, PrivilegeTier::Admin).is_ok(), "{code}");
        }
    }

    #[test]
    fn test_qualified_access_denied_restricted() {
        let policy = policy();
        let err = policy
            .validate("result = os.time()", PrivilegeTier::Restricted)
            .unwrap_err();
        assert!(err.reason.contains("'os'"), "{}", err.reason);
        assert!(policy.validate("result = os.time()", PrivilegeTier::Admin).is_ok());
    }

    #[test]
    fn test_member_named_like_capability_not_flagged() {
        let policy = policy();
        // `cfg.io.x` is field access on a local table, not the `io` module.
        assert!(policy
            .validate("local cfg = {io = {x = 1}}; result = cfg.io.x", PrivilegeTier::Restricted)
            .is_ok());
    }

    #[test]
    fn test_forbidden_denied_everywhere() {
        let policy = policy();
        for code in [
            "debug.getinfo(1)",
            r#"local c = require("coroutine")"#,
            "package.loadlib('x', 'y')",
            r#"local ffi = require "ffi""#,
        ] {
            assert!(policy.validate(code, PrivilegeTier::Restricted).is_err(), "{code}");
            assert!(policy.validate(code, PrivilegeTier::Admin).is_err(), "{code}");
        }
    }

    #[test]
    fn test_dangerous_primitives_restricted_only() {
        let policy = policy();
        for code in [
            "load('return 1')()",
            "local t = setmetatable({}, {})",
            "rawset(_G, 'x', 1)",
            "collectgarbage()",
            "print(_ENV)",
        ] {
            assert!(policy.validate(code, PrivilegeTier::Restricted).is_err(), "{code}");
            assert!(policy.validate(code, PrivilegeTier::Admin).is_ok(), "{code}");
        }
    }

    #[test]
    fn test_primitive_names_need_word_boundary() {
        let policy = policy();
        assert!(policy
            .validate("local payload = 'downloading'; result = payload", PrivilegeTier::Restricted)
            .is_ok());
    }

    #[test]
    fn test_call_site_patterns() {
        let policy = policy();
        for code in [
            "result = string.dump(f)",
            "result = s:dump()",
            "local mt = {__gc = function() end}",
            r#"local g = env["_G"]"#,
        ] {
            assert!(policy.validate(code, PrivilegeTier::Restricted).is_err(), "{code}");
        }
    }

    #[test]
    fn test_unknown_literal_require_uses_default() {
        let policy = policy();
        let code = r#"local m = require("mystery")"#;
        assert!(policy.validate(code, PrivilegeTier::Restricted).is_err());
        assert!(policy.validate(code, PrivilegeTier::Admin).is_ok());

        let registry =
            CapabilityRegistry::with_overrides(&BTreeMap::new(), CapabilityTier::Forbidden)
                .unwrap();
        let strict = SecurityPolicy::new(registry, false).unwrap();
        assert!(strict.validate(code, PrivilegeTier::Admin).is_err());
    }

    #[test]
    fn test_violation_carries_allowed_list() {
        let policy = policy();
        let err = policy
            .validate("require('os')", PrivilegeTier::Restricted)
            .unwrap_err();
        assert!(err.allowed.contains(&"math".to_string()));
        assert!(!err.allowed.contains(&"os".to_string()));
        let text = err.to_string();
        assert!(text.starts_with("security violation:"), "{text}");
        assert!(text.contains("allowed at RESTRICTED"), "{text}");
    }

    #[test]
    fn test_check_import_matches_validate() {
        let policy = policy();
        assert!(policy.check_import("json", PrivilegeTier::Restricted).is_ok());
        assert!(policy.check_import("fs", PrivilegeTier::Restricted).is_err());
        assert!(policy.check_import("fs", PrivilegeTier::Admin).is_ok());
        assert!(policy.check_import("debug", PrivilegeTier::Admin).is_err());
    }

    #[test_log::test]
    fn test_admin_privileged_use_is_not_blocked() {
        let policy = policy();
        assert!(policy
            .validate("local f = io.open('/tmp/x')", PrivilegeTier::Admin)
            .is_ok());
    }

    /// Shared buffer the fmt layer writes into.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn audit_lines(policy: &SecurityPolicy, code: &str, tier: PrivilegeTier) -> Vec<String> {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let _ = policy.validate(code, tier);
            let _ = policy.check_import("fs", tier);
        });
        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        text.lines()
            .filter(|line| line.contains(AUDIT_TARGET))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_admin_privileged_use_is_audited() {
        let code = "local f = io.open('/tmp/x')";
        let lines = audit_lines(&policy(), code, PrivilegeTier::Admin);
        let has = |capability: &str, usage: &str| {
            lines.iter().any(|line| {
                line.contains(&format!("capability={capability}"))
                    && line.contains(&format!("usage=\"{usage}\""))
            })
        };
        assert!(has("io", "referenced"), "{lines:?}");
        assert!(has("fs", "imported"), "{lines:?}");
    }

    #[test]
    fn test_audit_skipped_when_restricted_or_disabled() {
        let code = "local f = io.open('/tmp/x')";
        assert!(audit_lines(&policy(), code, PrivilegeTier::Restricted).is_empty());

        let quiet = SecurityPolicy::new(CapabilityRegistry::builtin(), false).unwrap();
        assert!(audit_lines(&quiet, code, PrivilegeTier::Admin).is_empty());
        assert!(audit_lines(&quiet, "local x = 1", PrivilegeTier::Admin).is_empty());
    }
}
