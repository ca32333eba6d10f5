//! Build metadata stamped in by `build.rs`, reported by the `version`
//! command and the startup log line.

use chrono::DateTime;
use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit hash, `-dirty` when built from a modified tree.
pub const GIT_HASH: &str = env!("SCRIPTGATE_GIT_HASH");

pub const BUILD_PROFILE: &str = env!("SCRIPTGATE_BUILD_PROFILE");

const BUILD_EPOCH: &str = env!("SCRIPTGATE_BUILD_TIMESTAMP");

/// Provenance of the running gateway binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub gateway: &'static str,
    pub git_hash: &'static str,
    pub build_profile: &'static str,
    /// RFC 3339 build time; `None` when the stamp is unreadable.
    pub build_timestamp: Option<String>,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            gateway: VERSION,
            git_hash: GIT_HASH,
            build_profile: BUILD_PROFILE,
            build_timestamp: rfc3339(BUILD_EPOCH),
        }
    }
}

/// `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

fn rfc3339(epoch: &str) -> Option<String> {
    let secs = epoch.parse::<i64>().ok()?;
    DateTime::from_timestamp(secs, 0).map(|at| at.to_rfc3339())
}
