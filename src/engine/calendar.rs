use chrono::{Datelike, FixedOffset, NaiveDate, NaiveTime};

use crate::model::*;

use super::slots::{merge_overlapping, subtract_intervals};

const DAY_MS: Ms = 86_400_000;

// ── Operating Calendar ────────────────────────────────────────────

/// Instant of `time` on `date` in the engine's fixed offset.
pub fn instant(offset: &FixedOffset, date: NaiveDate, time: NaiveTime) -> Ms {
    let local_ms = date.and_time(time).and_utc().timestamp_millis();
    local_ms - offset.local_minus_utc() as Ms * 1000
}

/// `[date 00:00, next day 00:00)` in the engine's fixed offset.
pub fn day_span(offset: &FixedOffset, date: NaiveDate) -> Span {
    let start = instant(offset, date, NaiveTime::MIN);
    Span::new(start, start + DAY_MS)
}

/// The interval `window` covers on `date`. An `end_time` of 00:00 reaches
/// the next midnight; anything else that does not end after it starts is empty.
pub fn window_span(offset: &FixedOffset, window: &OperatingWindow, date: NaiveDate) -> Option<Span> {
    let start = instant(offset, date, window.start_time);
    let end = if window.end_time == NaiveTime::MIN {
        day_span(offset, date).end
    } else {
        instant(offset, date, window.end_time)
    };
    (start < end).then(|| Span::new(start, end))
}

/// Windows in force on `date`: date-specific windows replace the weekly template.
pub fn windows_for_date(windows: &[OperatingWindow], date: NaiveDate) -> Vec<&OperatingWindow> {
    let dated: Vec<&OperatingWindow> = windows
        .iter()
        .filter(|w| w.day == WindowDay::Date(date))
        .collect();
    if !dated.is_empty() {
        return dated;
    }
    windows
        .iter()
        .filter(|w| w.day == WindowDay::Weekly(date.weekday()))
        .collect()
}

/// Bookable time on `date`: union of available windows minus unavailable ones.
/// Each returned span is a separate segment; segments never touch.
pub fn bookable_spans(offset: &FixedOffset, windows: &[OperatingWindow], date: NaiveDate) -> Vec<Span> {
    let mut open: Vec<Span> = Vec::new();
    let mut closed: Vec<Span> = Vec::new();

    for w in windows_for_date(windows, date) {
        // zero-length or inverted windows contribute nothing
        let Some(span) = window_span(offset, w, date) else {
            continue;
        };
        if w.is_available {
            open.push(span);
        } else {
            closed.push(span);
        }
    }

    open.sort_by_key(|s| s.start);
    let open = merge_overlapping(&open);
    if closed.is_empty() {
        return open;
    }
    closed.sort_by_key(|s| s.start);
    subtract_intervals(&open, &merge_overlapping(&closed))
}
