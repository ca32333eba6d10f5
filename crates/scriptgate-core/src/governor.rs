//! Process-wide resource ceilings, applied once before the session starts.
//!
//! Ceilings are best effort. An unsupported platform or a refused
//! `setrlimit` is reported and startup continues. Exceeding an applied
//! ceiling ends the process.

use std::fmt;

use tracing::{info, warn};

use scriptgate_config::LimitsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ceiling {
    /// Address-space size in bytes.
    Memory,
    /// Cumulative CPU time in seconds.
    CpuTime,
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ceiling::Memory => write!(f, "memory"),
            Ceiling::CpuTime => write!(f, "cpu time"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitOutcome {
    Applied(u64),
    Disabled,
    Unsupported,
    Failed(String),
}

/// Ceilings to apply. `None` leaves a resource unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limits {
    pub memory_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
}

impl Limits {
    pub fn from_config(config: &LimitsConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        Self {
            memory_bytes: Some(config.memory_mb.saturating_mul(1024 * 1024)),
            cpu_seconds: Some(config.cpu_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorReport {
    pub memory: LimitOutcome,
    pub cpu: LimitOutcome,
}

/// Apply `limits` to the current process and log each outcome.
pub fn apply(limits: &Limits) -> GovernorReport {
    let report = GovernorReport {
        memory: apply_one(Ceiling::Memory, limits.memory_bytes),
        cpu: apply_one(Ceiling::CpuTime, limits.cpu_seconds),
    };
    for (ceiling, outcome) in [(Ceiling::Memory, &report.memory), (Ceiling::CpuTime, &report.cpu)] {
        match outcome {
            LimitOutcome::Applied(value) => info!(%ceiling, value, "resource ceiling applied"),
            LimitOutcome::Disabled => info!(%ceiling, "resource ceiling disabled"),
            LimitOutcome::Unsupported => {
                warn!(%ceiling, "resource ceiling not supported on this platform")
            }
            LimitOutcome::Failed(error) => warn!(%ceiling, %error, "resource ceiling not applied"),
        }
    }
    report
}

fn apply_one(ceiling: Ceiling, value: Option<u64>) -> LimitOutcome {
    match value {
        None => LimitOutcome::Disabled,
        Some(value) => set_limit(ceiling, value),
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn set_limit(ceiling: Ceiling, value: u64) -> LimitOutcome {
    #[allow(clippy::useless_conversion)]
    let v = value as libc::rlim_t;
    let limit = libc::rlimit {
        rlim_cur: v,
        rlim_max: v,
    };
    // SAFETY: setrlimit only reads `limit`, which is initialised and lives
    // across the call.
    let rc = match ceiling {
        Ceiling::CpuTime => unsafe { libc::setrlimit(libc::RLIMIT_CPU, &limit) },
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Ceiling::Memory => unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) },
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        Ceiling::Memory => return LimitOutcome::Unsupported,
    };
    if rc == 0 {
        LimitOutcome::Applied(value)
    } else {
        LimitOutcome::Failed(std::io::Error::last_os_error().to_string())
    }
}

#[cfg(not(unix))]
fn set_limit(_ceiling: Ceiling, _value: u64) -> LimitOutcome {
    LimitOutcome::Unsupported
}
