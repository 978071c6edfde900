//! Time-based rotation over the source pool
//!
//! The UTC day is cut into [`SLOT_COUNT`] equal slots by minute of day. A run
//! uses the source at `pool[slot % pool.len()]`, so with a scheduler firing a
//! handful of times a day each source gets its turn without any stored state.

use chrono::{DateTime, Timelike, Utc};

pub const SLOT_COUNT: u32 = 7;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Minute of the UTC day, `0..1440`
pub fn minute_of_day(now: DateTime<Utc>) -> u32 {
    now.hour() * 60 + now.minute()
}

/// Index of the slot containing `now`, in `0..SLOT_COUNT`
///
/// Equivalent to `floor(minute / (1440 / 7))` computed without floats.
pub fn current_slot(now: DateTime<Utc>) -> u32 {
    minute_of_day(now) * SLOT_COUNT / MINUTES_PER_DAY
}

/// First minute of the day that falls in `slot`
pub fn slot_start_minute(slot: u32) -> u32 {
    (slot * MINUTES_PER_DAY).div_ceil(SLOT_COUNT)
}

/// Pick the source for the slot containing `now`
///
/// Returns `None` for an empty pool.
pub fn select_source(pool: &[String], now: DateTime<Utc>) -> Option<&String> {
    if pool.is_empty() {
        return None;
    }
    let index = current_slot(now) as usize % pool.len();
    pool.get(index)
}
