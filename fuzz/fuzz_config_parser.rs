//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = scriptgate_config::GatewayConfig::parse(s) {
            // A config that validates must also yield a policy.
            let _ = config.build_policy();
        }
    }
});
