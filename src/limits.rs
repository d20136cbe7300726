use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single appointment or block (31 days covers a vacation block).
pub const MAX_INTERVAL_DURATION_MS: Ms = 31 * 24 * 3_600_000;

/// Widest window a list query may ask the store for.
pub const MAX_QUERY_WINDOW_MS: Ms = 93 * 24 * 3_600_000;

pub const MAX_DATE_SCAN_DAYS: u32 = 366;
pub const MAX_LAYOUT_STAFF: usize = 256;
pub const MAX_SLOTS_PER_QUERY: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ENTRIES_PER_STAFF: usize = 100_000;

/// Resolve -> validate -> commit attempts before a booking gives up as stale.
pub const MAX_COMMIT_RETRIES: u32 = 3;
