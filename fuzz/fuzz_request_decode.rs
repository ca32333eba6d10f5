//! Fuzz target for request decoding.
//!
//! Run with: cargo +nightly fuzz run fuzz_request_decode
//!
//! Any input line must decode to a request or a decode error, and every
//! failure must still encode as a single response line.

#![no_main]

use libfuzzer_sys::fuzz_target;
use scriptgate_core::{Request, Response};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let outcome = Request::decode(line).and_then(Request::into_operation);
    if let Err(err) = outcome {
        let encoded = Response::from(err).to_line();
        assert!(!encoded.contains('\n'));
    }
});
