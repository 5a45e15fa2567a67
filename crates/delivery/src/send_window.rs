//! Send-window resolution — quiet hours and weekend skips are hard
//! constraints. A candidate instant inside a blocked window is pushed
//! forward to the next allowed instant, never merely flagged.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Utc, Weekday};

use drip_campaigns::QuietHours;

/// Push `candidate` forward until it falls outside the campaign's
/// quiet-hours window and (when `weekend_skip` is set) outside Saturday and
/// Sunday, evaluated in the contact's UTC offset.
pub fn next_allowed(
    candidate: DateTime<Utc>,
    quiet_hours: Option<&QuietHours>,
    weekend_skip: bool,
    utc_offset_minutes: i32,
) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    let mut local: DateTime<FixedOffset> = candidate.with_timezone(&offset);

    // Each adjustment can re-trigger the other rule (a quiet-hours push can
    // land on a Saturday, a weekend push can land inside quiet hours), so
    // loop until stable. The bound is generous: a week of weekend days plus
    // one quiet window per day.
    for _ in 0..32 {
        if weekend_skip && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            local = local + Duration::days(1);
            continue;
        }
        if let Some(window) = quiet_hours {
            if in_quiet_window(local.time(), window) {
                local = push_past_window(local, window);
                continue;
            }
        }
        break;
    }

    local.with_timezone(&Utc)
}

/// Whether `t` falls inside the window. `start > end` spans midnight.
fn in_quiet_window(t: NaiveTime, window: &QuietHours) -> bool {
    if window.start <= window.end {
        t >= window.start && t < window.end
    } else {
        t >= window.start || t < window.end
    }
}

/// Move a blocked instant to the end of the quiet window, on the correct
/// day for overnight windows.
fn push_past_window(local: DateTime<FixedOffset>, window: &QuietHours) -> DateTime<FixedOffset> {
    let same_day_end = local.date_naive().and_time(window.end);
    let target = if local.time() < window.end {
        // Morning tail of an overnight window, or inside a same-day window.
        same_day_end
    } else {
        // Evening head of an overnight window: the window ends tomorrow.
        same_day_end + Duration::days(1)
    };
    // Fixed offsets have no DST gaps, so wall-clock arithmetic is exact.
    local + (target - local.naive_local())
}
