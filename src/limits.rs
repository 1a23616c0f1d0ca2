//! Input bounds enforced at the engine boundary.

pub const MAX_CAR_FIELD_LEN: usize = 100;
pub const MAX_CAR_YEAR_LEN: usize = 4;
pub const MAX_COMMENT_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_PRICE: u32 = 10_000_000;
pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;
/// Widest window accepted by `available_slots`.
pub const MAX_QUERY_DAYS: i64 = 92;
/// Most rows a single scheduler transaction may touch.
pub const MAX_BATCH_SIZE: usize = 10_000;
