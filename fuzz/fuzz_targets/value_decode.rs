#![no_main]
//! Fuzz target for the canonical value decoder.
//!
//! Feeds arbitrary bytes through `Value::from_bytes`. The decoder handles
//! untrusted network payloads, so no input may cause a panic, unbounded
//! allocation, or stack overflow (nesting depth is capped); and any value
//! that decodes successfully must re-encode canonically and round-trip to
//! a structurally equal value.

use libfuzzer_sys::fuzz_target;
use mpcal_tla::Value;

fuzz_target!(|data: &[u8]| {
    // Phase 1: bounded decoding — must never panic.
    let value = match Value::from_bytes(data) {
        Ok(value) => value,
        Err(_) => return, // Expected for most fuzz inputs.
    };

    // Phase 2: canonical round-trip — re-encoding a decoded value must
    // succeed and decode back to an equal value.
    let bytes = value.to_bytes().expect("re-encode decoded value");
    let again = Value::from_bytes(&bytes).expect("decode canonical bytes");
    assert_eq!(value, again);
});
