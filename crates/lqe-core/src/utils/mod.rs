//! Engine Utilities
//!
//! Hashing and clock helpers shared by the cache and telemetry.

mod hashing;
mod time;

pub use hashing::fingerprint;
pub use time::{Clock, ManualClock, SystemClock, elapsed_secs};
