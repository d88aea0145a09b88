//! Shared helpers for the scenario tests in this directory.

use rand::Rng;

/// Picks a high ephemeral port at random rather than hardcoding one, so
/// parallel test binaries don't collide on the same listener port.
#[allow(dead_code)]
pub fn random_high_port() -> u16 {
    rand::rng().random_range(20_000..60_000)
}

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
