//! Capability registry: static classification of `require`-able modules.
//!
//! Every capability belongs to exactly one [`CapabilityTier`]. A request runs
//! under a [`PrivilegeTier`], which decides which capability tiers it may
//! reach. `FORBIDDEN` capabilities are unreachable at every tier.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Trust tier of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    /// Pure computation, text, time, serialization, hashing.
    Safe,
    /// Process, filesystem, network and data-analysis facilities.
    Privileged,
    /// Facilities able to defeat the sandbox.
    Forbidden,
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityTier::Safe => write!(f, "safe"),
            CapabilityTier::Privileged => write!(f, "privileged"),
            CapabilityTier::Forbidden => write!(f, "forbidden"),
        }
    }
}

impl FromStr for CapabilityTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "safe" => Ok(CapabilityTier::Safe),
            "privileged" => Ok(CapabilityTier::Privileged),
            "forbidden" => Ok(CapabilityTier::Forbidden),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// Privilege tier a request executes under. Supplied per request, never
/// persisted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrivilegeTier {
    /// Operators: SAFE capabilities only, dangerous primitives removed.
    #[default]
    Restricted,
    /// Administrators: SAFE and PRIVILEGED capabilities, full primitive set.
    Admin,
}

impl PrivilegeTier {
    /// Whether a capability of the given tier is reachable at this tier.
    pub fn allows(self, capability: CapabilityTier) -> bool {
        match capability {
            CapabilityTier::Safe => true,
            CapabilityTier::Privileged => self == PrivilegeTier::Admin,
            CapabilityTier::Forbidden => false,
        }
    }
}

impl fmt::Display for PrivilegeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivilegeTier::Restricted => write!(f, "RESTRICTED"),
            PrivilegeTier::Admin => write!(f, "ADMIN"),
        }
    }
}

impl FromStr for PrivilegeTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RESTRICTED" => Ok(PrivilegeTier::Restricted),
            "ADMIN" => Ok(PrivilegeTier::Admin),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// A tier name that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier {0:?}")]
pub struct UnknownTier(pub String);

/// Built-in classification table.
pub const BUILTIN_CAPABILITIES: &[(&str, CapabilityTier)] = &[
    // Pure computation / text / time / serialization
    ("string", CapabilityTier::Safe),
    ("table", CapabilityTier::Safe),
    ("math", CapabilityTier::Safe),
    ("utf8", CapabilityTier::Safe),
    ("json", CapabilityTier::Safe),
    ("base64", CapabilityTier::Safe),
    ("time", CapabilityTier::Safe),
    // Process, filesystem, network, data analysis
    ("os", CapabilityTier::Privileged),
    ("io", CapabilityTier::Privileged),
    ("fs", CapabilityTier::Privileged),
    ("process", CapabilityTier::Privileged),
    ("socket", CapabilityTier::Privileged),
    ("http", CapabilityTier::Privileged),
    ("lfs", CapabilityTier::Privileged),
    ("posix", CapabilityTier::Privileged),
    ("csv", CapabilityTier::Privileged),
    ("dataframe", CapabilityTier::Privileged),
    // Able to defeat the sandbox
    ("debug", CapabilityTier::Forbidden),
    ("ffi", CapabilityTier::Forbidden),
    ("jit", CapabilityTier::Forbidden),
    ("package", CapabilityTier::Forbidden),
    ("coroutine", CapabilityTier::Forbidden),
];

/// Errors building a registry from operator overrides.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("capability {0:?} is built in and cannot be reclassified")]
    BuiltinOverride(String),

    #[error("capability name must not be empty")]
    EmptyName,
}

/// Immutable name → tier table, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, CapabilityTier>,
    unknown: CapabilityTier,
}

impl CapabilityRegistry {
    /// The built-in table with unknown names treated as PRIVILEGED.
    pub fn builtin() -> Self {
        let entries = BUILTIN_CAPABILITIES
            .iter()
            .map(|(name, tier)| (name.to_string(), *tier))
            .collect();
        Self {
            entries,
            unknown: CapabilityTier::Privileged,
        }
    }

    /// Extend the built-in table with operator classifications.
    ///
    /// Built-in names cannot be reclassified, so a FORBIDDEN capability can
    /// never be made reachable through configuration.
    pub fn with_overrides(
        overrides: &BTreeMap<String, CapabilityTier>,
        unknown: CapabilityTier,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::builtin();
        registry.unknown = unknown;
        for (name, tier) in overrides {
            let key = name.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if Self::is_builtin(&key) {
                return Err(RegistryError::BuiltinOverride(name.clone()));
            }
            registry.entries.insert(key, *tier);
        }
        Ok(registry)
    }

    /// Whether `name` is part of the built-in table.
    pub fn is_builtin(name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        BUILTIN_CAPABILITIES.iter().any(|(n, _)| *n == key)
    }

    /// Classify a capability name. Total: unknown names get the configured
    /// default. Dotted submodules (`socket.http`) inherit their root's tier
    /// unless listed themselves.
    pub fn tier_of(&self, name: &str) -> CapabilityTier {
        let key = name.trim().to_ascii_lowercase();
        if let Some(tier) = self.entries.get(&key) {
            return *tier;
        }
        if let Some((root, _)) = key.split_once('.') {
            if let Some(tier) = self.entries.get(root) {
                return *tier;
            }
        }
        self.unknown
    }

    /// Tier assigned to names absent from the table.
    pub fn unknown_default(&self) -> CapabilityTier {
        self.unknown
    }

    /// Sorted names reachable at `tier`.
    pub fn allowed(&self, tier: PrivilegeTier) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, cap)| tier.allows(**cap))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Iterate over every `(name, tier)` entry in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, CapabilityTier)> {
        self.entries.iter().map(|(name, tier)| (name.as_str(), *tier))
    }

    /// Number of classified capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
