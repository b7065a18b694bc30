use crate::model::Ms;

pub const MAX_RESOURCES: usize = 100_000;
/// Counts occupying reservations only; cancelled history never fills a resource.
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_WINDOWS_PER_RESOURCE: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REQUESTER_ID_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single reservation may not exceed seven days.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;

/// Upper bound on candidate dates a single recurring request may expand to.
pub const MAX_SERIES_OCCURRENCES: usize = 366;

/// Largest page any paged query hands out.
pub const MAX_LIST_RESULTS: usize = 1000;

/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
