//! Fuzz target for policy validation.
//!
//! Run with: cargo +nightly fuzz run fuzz_policy_validate
//!
//! Code permitted at RESTRICTED must also be permitted at ADMIN.

#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use scriptgate_config::{CapabilityRegistry, PrivilegeTier, SecurityPolicy};

fn policy() -> &'static SecurityPolicy {
    static POLICY: OnceLock<SecurityPolicy> = OnceLock::new();
    POLICY.get_or_init(|| {
        SecurityPolicy::new(CapabilityRegistry::builtin(), false).expect("builtin policy compiles")
    })
}

fuzz_target!(|data: &[u8]| {
    let code = String::from_utf8_lossy(data);
    if policy().validate(&code, PrivilegeTier::Restricted).is_ok() {
        assert!(policy().validate(&code, PrivilegeTier::Admin).is_ok());
    }
});
