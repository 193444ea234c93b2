//! Shared wiring for the end-to-end scenario tests: hand-written
//! equivalents of compiler-emitted archetypes plus deployment helpers.

#[allow(dead_code)]
pub mod kv;
#[allow(dead_code)]
pub mod proxy;

use std::time::Duration;

use mpcal_tla::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long a scenario waits for any single expected output.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Receive the next host-visible output or fail the test.
#[allow(dead_code)]
pub async fn expect_output(out: &mut mpsc::Receiver<Value>) -> Value {
    timeout(TEST_TIMEOUT, out.recv())
        .await
        .expect("timed out waiting for archetype output")
        .expect("output channel closed")
}
