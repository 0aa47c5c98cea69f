use crate::error::AppError;
use crate::models::RangeKey;
use chrono::{DateTime, Datelike, Duration, Utc};

pub const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Aggregation window for one range. Day and month windows use fixed-width
/// bins measured from `start`; the year window buckets by the UTC calendar
/// month of each timestamp, so its bins are 28 to 31 days wide.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub range: RangeKey,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step_seconds: u32,
    pub bin_labels: Vec<String>,
}

impl TimeWindow {
    pub fn build(range: RangeKey, now: DateTime<Utc>) -> Self {
        let (span, step_seconds) = match range {
            RangeKey::Day => (Duration::hours(24), 3_600),
            RangeKey::Month => (Duration::days(30), 86_400),
            // Nominal; year bins are calendar months.
            RangeKey::Year => (Duration::days(365), 86_400),
        };

        Self {
            range,
            start: now - span,
            end: now,
            step_seconds,
            bin_labels: bin_labels(range),
        }
    }

    pub fn bin_count(&self) -> usize {
        self.bin_labels.len()
    }

    /// Maps a unix timestamp to its bin. Fixed-width ranges clamp to the first
    /// or last bin; the year range ignores `start` entirely.
    pub fn bin_of(&self, ts: i64) -> Option<usize> {
        let count = self.bin_count();
        if count == 0 {
            return None;
        }

        match self.range {
            RangeKey::Day | RangeKey::Month => {
                let offset = (ts - self.start.timestamp()).div_euclid(i64::from(self.step_seconds));
                Some(offset.clamp(0, count as i64 - 1) as usize)
            }
            RangeKey::Year => {
                let at = DateTime::<Utc>::from_timestamp(ts, 0)?;
                let idx = at.month0() as usize;
                (idx < count).then_some(idx)
            }
        }
    }
}

pub fn bin_labels(range: RangeKey) -> Vec<String> {
    match range {
        RangeKey::Day => (0..24).map(|h| format!("{h:02}:00")).collect(),
        RangeKey::Month => (1..=30).map(|d| format!("D{d}")).collect(),
        RangeKey::Year => MONTH_LABELS.iter().map(|m| m.to_string()).collect(),
    }
}

pub fn build_window(range_key: &str, now: DateTime<Utc>) -> Result<TimeWindow, AppError> {
    Ok(TimeWindow::build(range_key.parse()?, now))
}
