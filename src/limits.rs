//! Hard limits on user-supplied input. Enforced by the engine before any
//! state is touched.

use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single slot may not be wider than 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

/// Max spans accepted by one `create_slots` call.
pub const MAX_BATCH_SIZE: usize = 2_000;

/// Max weeks a recurring pattern may expand to (two years).
pub const MAX_WEEK_COUNT: u32 = 104;

/// Max live slots kept on one resource, across all actors.
pub const MAX_SLOTS_PER_RESOURCE: usize = 100_000;

/// Max distinct resources one engine will track.
pub const MAX_RESOURCES: usize = 1_000_000;
