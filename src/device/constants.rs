/**
 * How many adapter events may be queued for the reconciler before the adapter side has to wait.
 */
pub const EVENT_BUFFER_SIZE: usize = 64;

/**
 * How long (milliseconds) a single connection check against the adapter may take while refreshing.
 * A check that takes longer is treated as "not connected".
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * Smallest allowed interval (milliseconds) for periodic connection polling.
 */
pub const MIN_POLL_INTERVAL: u64 = 250;
