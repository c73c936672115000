use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;

use crate::models::{Broadcast, BroadcastMode, WindowConfig};

/// A daily time-of-day interval in minutes since local midnight.
/// `end <= start` denotes a window that wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyWindow {
    pub start_min: u32,
    pub end_min: u32,
}

impl DailyWindow {
    pub fn new(start_min: u32, end_min: u32) -> Self {
        Self { start_min, end_min }
    }

    fn contains_minute(self, m: u32) -> bool {
        if self.start_min <= self.end_min {
            self.start_min <= m && m < self.end_min
        } else {
            m >= self.start_min || m < self.end_min
        }
    }
}

/// Resolve the window a broadcast is actually constrained by: the campaign's
/// own window first, the enabled global fallback second. A `limited`
/// broadcast with no effective window behaves as `full`.
pub fn effective_window(broadcast: &Broadcast, global: Option<&WindowConfig>) -> (BroadcastMode, Option<DailyWindow>) {
    match broadcast.mode() {
        BroadcastMode::Full => (BroadcastMode::Full, None),
        BroadcastMode::Limited => {
            if let (Some(start), Some(end)) = (broadcast.window_start_min, broadcast.window_end_min) {
                return (BroadcastMode::Limited, Some(DailyWindow::new(start as u32, end as u32)));
            }
            match global {
                Some(cfg) if cfg.enabled => (
                    BroadcastMode::Limited,
                    Some(DailyWindow::new(cfg.start_min as u32, cfg.end_min as u32)),
                ),
                _ => (BroadcastMode::Full, None),
            }
        }
    }
}

pub fn is_within_window(instant: DateTime<Tz>, mode: BroadcastMode, window: Option<DailyWindow>) -> bool {
    match (mode, window) {
        (BroadcastMode::Full, _) | (_, None) => true,
        (BroadcastMode::Limited, Some(w)) => w.contains_minute(instant.hour() * 60 + instant.minute()),
    }
}

/// The earliest instant at or after `reference` that is inside the window.
/// Returns `reference` unchanged for `full` mode or when already inside.
///
/// Handles DST gaps the same way schedule resolution does elsewhere: a local
/// window start that does not exist on some day is skipped to the next day.
pub fn next_window_start(reference: DateTime<Tz>, mode: BroadcastMode, window: Option<DailyWindow>) -> DateTime<Tz> {
    let w = match (mode, window) {
        (BroadcastMode::Full, _) | (_, None) => return reference,
        (BroadcastMode::Limited, Some(w)) => w,
    };
    if is_within_window(reference, mode, Some(w)) {
        return reference;
    }

    let tz = reference.timezone();
    let start_time = NaiveTime::from_num_seconds_from_midnight_opt(w.start_min * 60, 0)
        .unwrap_or(NaiveTime::MIN);
    let today = reference.date_naive();

    // Try today and the next few days (handles DST gaps)
    for day_offset in 0..4i64 {
        let date = today + Duration::days(day_offset);
        if let Some(candidate) = tz.from_local_datetime(&date.and_time(start_time)).earliest()
            && candidate >= reference
        {
            return candidate;
        }
    }

    // Unreachable with a sane timezone database
    reference
}
