//! Injectable time source
//!
//! Expiry math goes through [`Clock`] so tests can pin the session at any
//! point of a token's lifetime without sleeping.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" in Unix epoch seconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_epoch(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64)
    }
}
