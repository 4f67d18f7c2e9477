//! Wall-clock helpers for the wire protocol and the health endpoint

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static STARTED_AT: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the Unix epoch, sent to peers in `Welcome`
pub fn unix_millis() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    since_epoch.as_millis() as u64
}

/// Record process start. Later calls are no-ops.
pub fn init_server_time() {
    STARTED_AT.get_or_init(Instant::now);
}

/// Seconds since [`init_server_time`], or 0 if it was never called
pub fn uptime_secs() -> u64 {
    STARTED_AT
        .get()
        .map_or(0, |started| started.elapsed().as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_starts_near_zero() {
        init_server_time();
        assert!(uptime_secs() < 5);
        assert!(unix_millis() > 1_600_000_000_000);
    }
}
