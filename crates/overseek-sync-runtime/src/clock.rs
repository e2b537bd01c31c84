//! Monotonic millisecond clock shared by every tab in the process.
//!
//! Built on `tokio::time::Instant` so paused-time tests drive it too.

use std::sync::OnceLock;

use tokio::time::{Duration, Instant};

static ORIGIN: OnceLock<Instant> = OnceLock::new();

fn origin() -> Instant {
    // Set in the past: a runtime created before the first call (paused test
    // clocks start at their creation time) must never read before it.
    *ORIGIN.get_or_init(|| {
        let now = Instant::now();
        [3_600, 60, 1]
            .into_iter()
            .find_map(|secs| now.checked_sub(Duration::from_secs(secs)))
            .unwrap_or(now)
    })
}

/// Milliseconds since the process clock origin.
pub fn now_ms() -> u64 {
    Instant::now().saturating_duration_since(origin()).as_millis() as u64
}

/// The instant corresponding to `ms` on this clock.
pub fn instant_at(ms: u64) -> Instant {
    origin() + Duration::from_millis(ms)
}
