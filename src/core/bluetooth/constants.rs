//! Constants used throughout the bridge
//! Default timings, cadences and name filters. Service and characteristic ids
//! live in the registry.

/// Name tokens that identify a COR power hub
pub const COR_NAME_TOKENS: &[&str] = &["COR2", "COR"];

/// Name tokens that identify an MPPT controller
pub const MPPT_NAME_TOKENS: &[&str] = &["MPPT"];

/// Scan window in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 5;

/// Report every advertisement, not only the first per peripheral
pub const DEFAULT_ALLOW_DUPLICATES: bool = true;

/// Timeout for establishing a connection in milliseconds
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Timeout for a single read or write in milliseconds
pub const OPERATION_TIMEOUT_MS: u64 = 2000;

/// Settle delay between connecting and retrieving services in milliseconds
pub const SERVICE_DISCOVERY_DELAY_MS: u64 = 900;

/// Primary telemetry cadence in milliseconds
pub const PRIMARY_POLL_INTERVAL_MS: u64 = 2000;

/// Slow telemetry cadence in milliseconds
pub const SLOW_POLL_INTERVAL_MS: u64 = 29000;

/// Control mirror cadence in milliseconds
pub const CONTROL_MIRROR_INTERVAL_MS: u64 = 2000;

/// Tick sent in write headers until the peripheral reports one
pub const DEFAULT_TIME_TICK: u16 = 1234;

/// Buffered session events per subscriber
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Buffered link events per subscriber
pub const LINK_EVENT_CHANNEL_CAPACITY: usize = 32;
