//! Half-open interval arithmetic over session time ranges.
//!
//! `[start, end)`: a range that ends exactly when another starts does not
//! overlap it.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use slotwise_core::error::{Result, SlotwiseError};
use slotwise_core::types::Timestamp;

/// True iff `[a_start, a_end)` and `[b_start, b_end)` share any instant.
pub fn overlaps<T: PartialOrd>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && b_start < a_end
}

/// Length of `[start, end)`. Fails unless `end > start`.
pub fn duration(start: Timestamp, end: Timestamp) -> Result<Duration> {
    if end <= start {
        return Err(SlotwiseError::InvalidRange { start, end });
    }
    Ok(end - start)
}

/// A validated `[start, end)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    start: Timestamp,
    end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self> {
        duration(start, end)?;
        Ok(Self { start, end })
    }

    /// Range of `length` starting at `start`.
    pub fn starting_at(start: Timestamp, length: Duration) -> Result<Self> {
        let end = start.checked_add_signed(length).ok_or_else(out_of_range)?;
        Self::new(start, end)
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn overlaps_raw(&self, start: Timestamp, end: Timestamp) -> bool {
        overlaps(self.start, self.end, start, end)
    }

    /// Same length, moved by `delta`. Fails past the representable range.
    pub fn shifted(&self, delta: Duration) -> Result<Self> {
        Ok(Self {
            start: self.start.checked_add_signed(delta).ok_or_else(out_of_range)?,
            end: self.end.checked_add_signed(delta).ok_or_else(out_of_range)?,
        })
    }
}

fn out_of_range() -> SlotwiseError {
    SlotwiseError::validation("time range runs past the supported date range")
}
