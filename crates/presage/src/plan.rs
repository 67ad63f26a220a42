//! Batch planning: split a half-open time range into fixed-duration windows.
//!
//! Planning is pure and deterministic. Each (machine, window) pair later
//! becomes one prediction request, so the window duration directly controls
//! request granularity.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::ClientError;

/// A half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}

/// Tile `[start, end)` with contiguous windows of at most `window` duration.
///
/// Every window except possibly the last has exactly the nominal duration;
/// the last is truncated so the sequence ends exactly at `end`. Adjacent
/// windows share a boundary instant, so no instant is covered twice and none
/// is skipped.
pub fn plan_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window: Duration,
) -> Result<Vec<TimeWindow>, ClientError> {
    if end <= start {
        return Err(ClientError::InvalidRange { start, end });
    }

    let step = TimeDelta::from_std(window)
        .map_err(|_| ClientError::configuration("batch window duration out of range"))?;
    if step <= TimeDelta::zero() {
        return Err(ClientError::configuration(
            "batch window duration must be positive",
        ));
    }

    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        // checked_add_signed only fails near the representable time limit;
        // clamping to `end` keeps the tiling well-formed in that case too.
        let next = match cursor.checked_add_signed(step) {
            Some(t) if t < end => t,
            _ => end,
        };
        windows.push(TimeWindow {
            start: cursor,
            end: next,
        });
        cursor = next;
    }

    Ok(windows)
}
