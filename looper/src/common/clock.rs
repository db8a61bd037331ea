// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Monotonic uptime clock used for all message scheduling.
//!
//! Delivery times ([`Message::when`]) are expressed in milliseconds since an
//! arbitrary process-local epoch (the first call into this module). The clock
//! is backed by [`std::time::Instant`], so it is non-decreasing and immune to
//! wall-clock adjustments. Wall-clock time is used nowhere in scheduling -
//! only in human-readable debug dumps.
//!
//! [`Message::when`]: crate::runtime::message::Message::when

use std::{sync::OnceLock, time::Instant};

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the process-local clock epoch.
///
/// The epoch is captured lazily on first use, so the very first call returns
/// `0`. Values are safe to subtract from each other and to compare across
/// threads.
#[must_use]
pub fn uptime_millis() -> u64 {
    let epoch = *CLOCK_EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn test_uptime_is_monotonic() {
        let t1 = uptime_millis();
        thread::sleep(Duration::from_millis(5));
        let t2 = uptime_millis();
        assert!(t2 >= t1 + 5, "expected at least 5 ms to elapse: {t1} -> {t2}");
    }
}
