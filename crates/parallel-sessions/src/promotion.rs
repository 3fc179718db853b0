//! Rule deciding when a channel memory becomes global knowledge.

/// Default importance at or above which memories are promoted.
pub const DEFAULT_AUTO_PROMOTE_THRESHOLD: u8 = 8;

/// Highest importance a memory may carry.
pub const MAX_IMPORTANCE: u8 = 10;

pub fn should_promote(importance: u8, threshold: u8) -> bool {
    importance >= threshold
}

/// Confidence of a promoted entry, `importance / 10` clamped to `0.0..=1.0`.
pub fn confidence_for(importance: u8) -> f64 {
    (f64::from(importance.min(MAX_IMPORTANCE)) / f64::from(MAX_IMPORTANCE)).clamp(0.0, 1.0)
}
