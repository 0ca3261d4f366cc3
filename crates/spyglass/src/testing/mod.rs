//! Testing utilities for spyglass.
//!
//! Scripted provider clients and canned provider payloads, so capture can be
//! exercised without real API calls.
//!
//! # Components
//!
//! - [`fixtures`]: Provider requests, responses and stream chunks
//! - [`mock_client`]: Mock clients for each supported client shape

pub mod fixtures;
pub mod mock_client;

use std::time::Duration;

pub use mock_client::{MockAnthropic, MockGenerate, MockOpenAi, Script};

/// Poll `condition` until it holds.
///
/// Background stream consumers finish on their own tasks; tests use this to
/// wait for them.
///
/// # Panics
///
/// Panics if the condition does not hold within two seconds.
pub async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
