use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::calendar::{day_span, instant};
use super::conflict::{validate_reason, validate_requester};
use super::{Engine, EngineError, ErrorKind};

const WORKWEEK: [Weekday; 5] = [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri];

/// A date the expander tried and could not hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDate {
    pub date: NaiveDate,
    pub error: ErrorKind,
}

/// Partial success is the normal result: `created` and `failed` together
/// cover every candidate date exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesOutcome {
    pub series_id: Ulid,
    pub created: Vec<Reservation>,
    pub failed: Vec<FailedDate>,
}

/// Result of [`Engine::update_series`]: the stored series afterwards plus
/// what happened to its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesChange {
    pub series: RecurringSeries,
    pub created: Vec<Reservation>,
    pub failed: Vec<FailedDate>,
    pub cancelled: usize,
}

/// Reduce the two request shapes to one weekday set, Monday first, weekends dropped.
pub fn resolve_weekdays(
    pattern: Option<RecurrencePattern>,
    days_of_week: Option<&[Weekday]>,
    first_date: NaiveDate,
) -> Result<Vec<Weekday>, EngineError> {
    let requested: Vec<Weekday> = match (pattern, days_of_week) {
        (Some(RecurrencePattern::Daily), None) => WORKWEEK.to_vec(),
        (Some(RecurrencePattern::Weekly), None) => vec![first_date.weekday()],
        (None, Some(days)) => days.to_vec(),
        (Some(_), Some(_)) => {
            return Err(EngineError::validation("give either pattern or days_of_week, not both"));
        }
        (None, None) => return Err(EngineError::validation("pattern or days_of_week is required")),
    };

    Ok(WORKWEEK
        .iter()
        .copied()
        .filter(|d| requested.contains(d))
        .collect())
}

/// Every date in `[first, end]` whose weekday is in `days`.
pub fn candidate_dates(first: NaiveDate, end: NaiveDate, days: &[Weekday]) -> Vec<NaiveDate> {
    first
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| days.contains(&d.weekday()))
        .collect()
}

impl Engine {
    /// Hold the same time range on every matching date. Only request-level
    /// problems fail the call; per-date failures are returned as data.
    pub async fn expand_recurring(&self, request: RecurringRequest) -> Result<SeriesOutcome, EngineError> {
        validate_requester(&request.requester_id)?;
        validate_reason(request.reason.as_deref())?;
        if request.first_date > request.end_date {
            return Err(EngineError::validation("first_date must not be after end_date"));
        }
        if request.time_range.start >= request.time_range.end {
            return Err(EngineError::validation("time range start must be before end"));
        }
        if self.get_resource(&request.resource_id).is_none() {
            return Err(EngineError::NotFound(request.resource_id));
        }

        let days = resolve_weekdays(request.pattern, request.days_of_week.as_deref(), request.first_date)?;
        let dates = candidate_dates(request.first_date, request.end_date, &days);
        if dates.is_empty() {
            return Err(EngineError::validation("recurrence matches no weekdays in range"));
        }
        if dates.len() > MAX_SERIES_OCCURRENCES {
            return Err(EngineError::validation("too many occurrences in series"));
        }

        let series = RecurringSeries {
            id: Ulid::new(),
            resource_id: request.resource_id,
            requester_id: request.requester_id,
            pattern: request.pattern,
            days,
            first_date: request.first_date,
            end_date: request.end_date,
            time_range: request.time_range,
            reason: request.reason,
            members: Vec::new(),
            created_at: self.now_ms(),
        };
        let (created, failed) = self.hold_dates(&series, series.reason.clone(), &dates).await;

        let series_id = series.id;
        let series = RecurringSeries {
            members: created.iter().map(|r| r.id).collect(),
            ..series
        };
        self.record_series(Event::SeriesCreated { series }).await?;

        info!(
            "series {series_id}: {} held, {} failed",
            created.len(),
            failed.len()
        );
        Ok(SeriesOutcome {
            series_id,
            created,
            failed,
        })
    }

    /// Move a series' end date and/or change its reason.
    ///
    /// Extending holds the new dates like [`Engine::expand_recurring`] does.
    /// Shortening cancels members past the new end that have not started.
    /// A new reason is copied onto every member that has not started.
    pub async fn update_series(
        &self,
        series_id: Ulid,
        end_date: Option<NaiveDate>,
        reason: Option<String>,
    ) -> Result<SeriesChange, EngineError> {
        if end_date.is_none() && reason.is_none() {
            return Err(EngineError::validation("nothing to update"));
        }
        validate_reason(reason.as_deref())?;
        let before = self
            .series
            .get(&series_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(series_id))?;

        let new_end = end_date.unwrap_or(before.end_date);
        if new_end < before.first_date {
            return Err(EngineError::validation("end_date must not be before first_date"));
        }
        let all_dates = candidate_dates(before.first_date, new_end, &before.days);
        if all_dates.len() > MAX_SERIES_OCCURRENCES {
            return Err(EngineError::validation("too many occurrences in series"));
        }

        let mut created = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled = 0;
        if new_end > before.end_date {
            let fresh: Vec<NaiveDate> = all_dates.into_iter().filter(|d| *d > before.end_date).collect();
            let fresh_reason = reason.clone().or_else(|| before.reason.clone());
            (created, failed) = self.hold_dates(&before, fresh_reason, &fresh).await;
        } else if new_end < before.end_date {
            let cutoff = day_span(&self.settings.utc_offset, new_end).end;
            cancelled = self
                .cancel_members(&before.members, |r| r.span.start >= cutoff)
                .await?;
        }
        if let Some(reason) = reason.as_deref() {
            self.retitle_members(&before.members, reason).await?;
        }

        // Re-read under the lock: members may have been detached meanwhile.
        let mut guard = self.write_resource(before.resource_id).await?;
        let mut series = self
            .series
            .get(&series_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(series_id))?;
        series.end_date = new_end;
        if reason.is_some() {
            series.reason = reason;
        }
        series.members.extend(created.iter().map(|r| r.id));
        let event = Event::SeriesUpdated { series: series.clone() };
        self.persist_and_apply(series.resource_id, &mut guard, &event).await?;
        drop(guard);

        info!(
            "series {series_id} updated: {} held, {} failed, {cancelled} cancelled",
            created.len(),
            failed.len()
        );
        Ok(SeriesChange {
            series,
            created,
            failed,
            cancelled,
        })
    }

    /// One hold per date at the series' time of day.
    async fn hold_dates(
        &self,
        series: &RecurringSeries,
        reason: Option<String>,
        dates: &[NaiveDate],
    ) -> (Vec<Reservation>, Vec<FailedDate>) {
        let offset = self.settings.utc_offset;
        let mut created = Vec::new();
        let mut failed = Vec::new();

        for &date in dates {
            let span = Span {
                start: instant(&offset, date, series.time_range.start),
                end: instant(&offset, date, series.time_range.end),
            };
            match self
                .place_hold(
                    series.resource_id,
                    series.requester_id.clone(),
                    span,
                    reason.clone(),
                    Some(series.id),
                )
                .await
            {
                Ok(reservation) => created.push(reservation),
                Err(e) => failed.push(FailedDate { date, error: e.kind() }),
            }
        }
        (created, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn daily_is_the_workweek() {
        let days = resolve_weekdays(Some(RecurrencePattern::Daily), None, date(2024, 1, 5)).unwrap();
        assert_eq!(days, WORKWEEK.to_vec());
    }

    #[test]
    fn weekly_follows_first_date() {
        // 2024-01-03 is a Wednesday
        let days = resolve_weekdays(Some(RecurrencePattern::Weekly), None, date(2024, 1, 3)).unwrap();
        assert_eq!(days, vec![Weekday::Wed]);
    }

    #[test]
    fn raw_days_drop_weekends_and_sort() {
        let raw = [Weekday::Sat, Weekday::Thu, Weekday::Mon, Weekday::Sun, Weekday::Mon];
        let days = resolve_weekdays(None, Some(&raw), date(2024, 1, 1)).unwrap();
        assert_eq!(days, vec![Weekday::Mon, Weekday::Thu]);
    }

    #[test]
    fn both_or_neither_representation_is_rejected() {
        let d = date(2024, 1, 1);
        assert!(resolve_weekdays(None, None, d).is_err());
        assert!(resolve_weekdays(Some(RecurrencePattern::Daily), Some(&[Weekday::Mon]), d).is_err());
    }

    #[test]
    fn daily_friday_to_tuesday_skips_weekend() {
        // Fri 2024-01-05 .. Tue 2024-01-09
        let dates = candidate_dates(date(2024, 1, 5), date(2024, 1, 9), &WORKWEEK);
        assert_eq!(dates, vec![date(2024, 1, 5), date(2024, 1, 8), date(2024, 1, 9)]);
    }

    #[test]
    fn weekly_steps_by_seven_days() {
        let dates = candidate_dates(date(2024, 1, 1), date(2024, 1, 29), &[Weekday::Mon]);
        assert_eq!(
            dates,
            vec![date(2024, 1, 1), date(2024, 1, 8), date(2024, 1, 15), date(2024, 1, 22), date(2024, 1, 29)]
        );
    }

    #[test]
    fn weekend_only_range_is_empty() {
        assert!(candidate_dates(date(2024, 1, 6), date(2024, 1, 7), &WORKWEEK).is_empty());
    }
}
