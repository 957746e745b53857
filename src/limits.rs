use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00 local.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00 local.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest single rental or block.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
/// Widest window accepted by availability and calendar queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * DAY_MS;

pub const MAX_SLOTS_PER_DAY: usize = 3;
pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_BLOCKS_PER_RESOURCE: usize = 10_000;
pub const MAX_RENTALS_PER_RESOURCE: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ID_LEN: usize = 128;
pub const MAX_REASON_LEN: usize = 1024;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
