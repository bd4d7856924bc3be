//! Encoder reliability: a declarative step sequencer for video encoder
//! lifecycle tests
//!
//! Each test case is a flat list of symbolic steps (`encode:configure`,
//! `stream:start`, `encode:error`, ...). The sequencer issues one lifecycle
//! call per step against an encoder behind the [`codec::VideoEncoder`]
//! trait, asserts that each call fails exactly when the case says it
//! should, and drains the encoder's output into a file while the case runs.
//!
//! # Quick Start
//!
//! ```no_run
//! use encoder_reliability::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let platform = Arc::new(SimPlatform::default());
//!     let mut runner = TestRunner::with_platform(TestConfig::default(), platform);
//!     runner.add_suite(ScenarioSuite::builtin()?);
//!     let report = runner.run_all().await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! A case flows: suite JSON → [`scenario`] → [`step`] program → [`sequencer`] → [`test_runner`] report
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`step`], [`sequencer`], [`error`](Error) |
//! | **Platform** | [`codec`], [`stream`], [`sim`] |
//! | **Tooling** | [`scenario`], [`test_runner`] |
#![allow(clippy::enum_variant_names)]

pub mod codec;
pub mod scenario;
pub mod sequencer;
pub mod sim;
pub mod step;
pub mod stream;
pub mod test_runner;
pub mod prelude;

mod error;

pub use error::{AssertionFailure, Error, Result};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the data of a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
