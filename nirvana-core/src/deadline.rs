// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Absolute execution deadline on the process-local monotonic clock.
/// Smaller is more urgent; all scheduling order derives from this.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Deadline(u64);

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl Deadline {
    /// No deadline: scheduled after everything that has one.
    pub const INFINITE: Deadline = Deadline(u64::MAX);

    pub const fn from_raw(ns: u64) -> Deadline {
        Deadline(ns)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Deadline `d` from now.
    pub fn after(d: Duration) -> Deadline {
        let now = epoch().elapsed().as_nanos() as u64;
        Deadline(now.saturating_add(d.as_nanos() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_urgency() {
        assert!(Deadline::from_raw(10) < Deadline::from_raw(50));
        assert!(Deadline::from_raw(50) < Deadline::INFINITE);
        let near = Deadline::after(Duration::from_millis(1));
        let far = Deadline::after(Duration::from_secs(10));
        assert!(near < far);
    }
}
