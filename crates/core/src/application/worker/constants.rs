// Worker constants (no magic values)
use std::time::Duration;

/// Longest idle wait before polling the queue again (5s).
/// Bounds discovery latency for delayed jobs when no wakeup arrives.
pub const IDLE_WAIT: Duration = Duration::from_secs(5);

/// Sleep duration after worker error before retry (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Leases are renewed this many times per lease period
pub const HEARTBEAT_DIVISOR: i64 = 3;
