use std::collections::HashSet;
use std::fmt;

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Abutting spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection with `bounds`, or `None` when nothing remains.
    pub fn clamp_to(&self, bounds: &Span) -> Option<Span> {
        let start = self.start.max(bounds.start);
        let end = self.end.min(bounds.end);
        (start < end).then(|| Span::new(start, end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    #[serde(rename = "ONHOLD")]
    OnHold,
    #[serde(rename = "CONFIRMED")]
    Confirmed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "NO_SHOW")]
    NoShow,
}

impl ReservationStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::NoShow)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OnHold => "ONHOLD",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::NoShow => "NO_SHOW",
        };
        f.write_str(s)
    }
}

/// Why a reservation ended up CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelCause {
    /// Hold TTL elapsed without confirmation.
    Expired,
    /// Requester or admin asked for it.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Set only while the status is ONHOLD.
    pub hold_expires_at: Option<Ms>,
    pub cancel_cause: Option<CancelCause>,
    pub recurring_series_id: Option<Ulid>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

impl Reservation {
    /// ONHOLD with a TTL that has already run out at `now`.
    pub fn is_expired_hold(&self, now: Ms) -> bool {
        self.status == ReservationStatus::OnHold
            && self.hold_expires_at.is_none_or(|exp| exp <= now)
    }

    /// Whether this reservation takes part in the overlap check at `now`.
    pub fn occupies(&self, now: Ms) -> bool {
        match self.status {
            ReservationStatus::OnHold => !self.is_expired_hold(now),
            ReservationStatus::Confirmed | ReservationStatus::Completed => true,
            ReservationStatus::Cancelled | ReservationStatus::NoShow => false,
        }
    }

    /// Neither occupying nor recent: nothing reads it but history, and
    /// compaction may drop it once its interval ended `retention_ms` ago.
    pub fn is_prunable(&self, now: Ms, retention_ms: Ms) -> bool {
        !self.occupies(now) && self.span.end.saturating_add(retention_ms) <= now
    }

    /// The record as every read path must see it: an expired hold reads as
    /// CANCELLED even before the sweeper has persisted that.
    pub fn effective(&self, now: Ms) -> Reservation {
        let mut view = self.clone();
        if view.is_expired_hold(now) {
            view.status = ReservationStatus::Cancelled;
            view.cancel_cause = Some(CancelCause::Expired);
            view.updated_at = view.hold_expires_at.unwrap_or(view.updated_at);
            view.hold_expires_at = None;
        }
        view
    }
}

/// Which day(s) an operating window applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowDay {
    /// One calendar date. Date windows replace the weekly template for that date.
    Date(NaiveDate),
    /// Every occurrence of a weekday.
    Weekly(Weekday),
}

/// `end_time` of 00:00 means the window runs to the end of its day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingWindow {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub day: WindowDay,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_available: bool,
}

/// Time-of-day range used by recurring requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRequest {
    pub resource_id: Ulid,
    pub requester_id: String,
    pub first_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub pattern: Option<RecurrencePattern>,
    #[serde(default)]
    pub days_of_week: Option<Vec<Weekday>>,
    pub time_range: TimeRange,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSeries {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: String,
    /// The pattern as requested, if one was used instead of raw weekdays.
    pub pattern: Option<RecurrencePattern>,
    /// Canonical recurrence: weekdays (never Saturday/Sunday), Monday first.
    pub days: Vec<Weekday>,
    pub first_date: NaiveDate,
    pub end_date: NaiveDate,
    pub time_range: TimeRange,
    pub reason: Option<String>,
    /// Member reservation ids. Non-owning: members stay individually cancellable.
    pub members: Vec<Ulid>,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    /// Longest interval a single hold may cover.
    pub max_duration_ms: Option<Ms>,
    /// Length AVAILABLE slots are cut into, if any.
    pub slot_granularity_ms: Option<Ms>,
    pub windows: Vec<OperatingWindow>,
    /// Reservations placed on this resource and not yet pruned by compaction,
    /// sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        name: Option<String>,
        active: bool,
        max_duration_ms: Option<Ms>,
        slot_granularity_ms: Option<Ms>,
    ) -> Self {
        Self {
            id,
            name,
            active,
            max_duration_ms,
            slot_granularity_ms,
            windows: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Reservations that count against the per-resource cap.
    pub fn occupying_count(&self, now: Ms) -> usize {
        self.reservations.iter().filter(|r| r.occupies(now)).count()
    }

    /// Ids of the reservations compaction may drop at `now`.
    pub fn prunable(&self, now: Ms, retention_ms: Ms) -> Vec<Ulid> {
        self.reservations
            .iter()
            .filter(|r| r.is_prunable(now, retention_ms))
            .map(|r| r.id)
            .collect()
    }

    pub fn remove_reservations(&mut self, ids: &HashSet<Ulid>) {
        self.reservations.retain(|r| !ids.contains(&r.id));
    }

    pub fn insert_window(&mut self, window: OperatingWindow) {
        self.windows.push(window);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<OperatingWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            active: self.active,
            max_duration_ms: self.max_duration_ms,
            slot_granularity_ms: self.slot_granularity_ms,
        }
    }
}

/// Every state change, as written to the WAL and broadcast to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        name: Option<String>,
        active: bool,
        max_duration_ms: Option<Ms>,
        slot_granularity_ms: Option<Ms>,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        active: bool,
        max_duration_ms: Option<Ms>,
        slot_granularity_ms: Option<Ms>,
    },
    WindowAdded {
        window: OperatingWindow,
    },
    WindowRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    /// A new hold, or (after compaction) a reservation in whatever status it had.
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        cause: CancelCause,
    },
    ReservationCompleted {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    ReservationNoShow {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    /// Carries the resulting values, not a diff.
    ReservationUpdated {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        reason: Option<String>,
        notes: Option<String>,
    },
    SeriesCreated {
        series: RecurringSeries,
    },
    /// Replaces the series record wholesale.
    SeriesUpdated {
        series: RecurringSeries,
    },
    SeriesMemberDetached {
        series_id: Ulid,
        reservation_id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub max_duration_ms: Option<Ms>,
    pub slot_granularity_ms: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Available,
    Booked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBooking {
    pub id: Ulid,
    pub requester_id: String,
    pub status: ReservationStatus,
}

/// One contiguous segment of a resource's timeline on a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub status: SlotStatus,
    pub booking_ref: Option<SlotBooking>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFilter {
    #[serde(default)]
    pub resource_id: Option<Ulid>,
    #[serde(default)]
    pub requester_id: Option<String>,
    #[serde(default)]
    pub status: Option<ReservationStatus>,
    /// Only reservations overlapping `[from, to)`.
    #[serde(default)]
    pub from: Option<Ms>,
    #[serde(default)]
    pub to: Option<Ms>,
}

fn first_page() -> usize {
    1
}

fn default_page_limit() -> usize {
    20
}

/// 1-based page selector shared by every paged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default = "first_page")]
    pub page: usize,
    #[serde(default = "default_page_limit")]
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: first_page(),
            limit: default_page_limit(),
        }
    }
}

impl PageRequest {
    pub fn new(page: usize, limit: usize) -> Self {
        Self { page, limit }
    }

    /// Index of the first item on this page. Saturates instead of overflowing.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }
}

/// One page of an ordered result set. `total` counts every match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

impl<T> Page<T> {
    /// Cut `page` out of the full, already ordered `all`.
    pub fn slice(all: Vec<T>, page: PageRequest) -> Self {
        let total = all.len();
        let items = all.into_iter().skip(page.offset()).take(page.limit).collect();
        Self {
            items,
            page: page.page,
            limit: page.limit,
            total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub series: RecurringSeries,
    pub members: Vec<Reservation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::nil(),
            requester_id: "u1".into(),
            span: Span::new(start, end),
            status,
            created_at: 0,
            updated_at: 0,
            hold_expires_at: None,
            cancel_cause: None,
            recurring_series_id: None,
            reason: None,
            notes: None,
        }
    }

    fn resource() -> ResourceState {
        ResourceState::new(Ulid::new(), None, true, None, None)
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // abutting, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_clamp() {
        let bounds = Span::new(100, 200);
        assert_eq!(Span::new(50, 150).clamp_to(&bounds), Some(Span::new(100, 150)));
        assert_eq!(Span::new(150, 300).clamp_to(&bounds), Some(Span::new(150, 200)));
        assert_eq!(Span::new(200, 300).clamp_to(&bounds), None);
        assert_eq!(Span::new(0, 100).clamp_to(&bounds), None);
    }

    #[test]
    fn hold_occupies_until_expiry() {
        let mut r = reservation(0, 100, ReservationStatus::OnHold);
        r.hold_expires_at = Some(1_000);
        assert!(r.occupies(999));
        assert!(!r.occupies(1_000));
        assert!(r.is_expired_hold(1_000));
    }

    #[test]
    fn occupying_statuses() {
        assert!(reservation(0, 1, ReservationStatus::Confirmed).occupies(0));
        assert!(reservation(0, 1, ReservationStatus::Completed).occupies(0));
        assert!(!reservation(0, 1, ReservationStatus::Cancelled).occupies(0));
        assert!(!reservation(0, 1, ReservationStatus::NoShow).occupies(0));
    }

    #[test]
    fn effective_view_of_expired_hold() {
        let mut r = reservation(0, 100, ReservationStatus::OnHold);
        r.hold_expires_at = Some(500);
        let live = r.effective(499);
        assert_eq!(live.status, ReservationStatus::OnHold);
        assert_eq!(live.hold_expires_at, Some(500));

        let view = r.effective(500);
        assert_eq!(view.status, ReservationStatus::Cancelled);
        assert_eq!(view.cancel_cause, Some(CancelCause::Expired));
        assert_eq!(view.hold_expires_at, None);
        // the stored record is untouched
        assert_eq!(r.status, ReservationStatus::OnHold);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ReservationStatus::OnHold.is_terminal());
        assert!(!ReservationStatus::Confirmed.is_terminal());
        assert!(ReservationStatus::Cancelled.is_terminal());
        assert!(ReservationStatus::Completed.is_terminal());
        assert!(ReservationStatus::NoShow.is_terminal());
    }

    #[test]
    fn reservation_ordering() {
        let mut rs = resource();
        rs.insert_reservation(reservation(300, 400, ReservationStatus::Confirmed));
        rs.insert_reservation(reservation(100, 200, ReservationStatus::Confirmed));
        rs.insert_reservation(reservation(200, 300, ReservationStatus::OnHold));
        let starts: Vec<Ms> = rs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = resource();
        rs.insert_reservation(reservation(100, 200, ReservationStatus::Confirmed));
        rs.insert_reservation(reservation(450, 600, ReservationStatus::Confirmed));
        rs.insert_reservation(reservation(1000, 1100, ReservationStatus::Confirmed));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = resource();
        rs.insert_reservation(reservation(100, 200, ReservationStatus::Confirmed));
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(rs.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_long_reservation_spanning_query() {
        let mut rs = resource();
        rs.insert_reservation(reservation(0, 10_000, ReservationStatus::Confirmed));
        assert_eq!(rs.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn remove_window_by_id() {
        let mut rs = resource();
        let id = Ulid::new();
        rs.insert_window(OperatingWindow {
            id,
            resource_id: rs.id,
            day: WindowDay::Weekly(Weekday::Mon),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            is_available: true,
        });
        assert!(rs.remove_window(Ulid::new()).is_none());
        assert_eq!(rs.remove_window(id).map(|w| w.id), Some(id));
        assert!(rs.windows.is_empty());
    }

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&ReservationStatus::OnHold).unwrap();
        assert_eq!(json, "\"ONHOLD\"");
        let json = serde_json::to_string(&ReservationStatus::NoShow).unwrap();
        assert_eq!(json, "\"NO_SHOW\"");
        assert_eq!(ReservationStatus::NoShow.to_string(), "NO_SHOW");
    }

    #[test]
    fn event_survives_bincode() {
        let event = Event::ReservationPlaced {
            reservation: reservation(100, 200, ReservationStatus::OnHold),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn prune_keeps_occupying_and_recent() {
        let mut rs = resource();
        let old_cancelled = reservation(0, 100, ReservationStatus::Cancelled);
        let old_no_show = reservation(100, 200, ReservationStatus::NoShow);
        let old_completed = reservation(200, 300, ReservationStatus::Completed);
        let recent_cancelled = reservation(900, 1000, ReservationStatus::Cancelled);
        let mut lapsed_hold = reservation(300, 400, ReservationStatus::OnHold);
        lapsed_hold.hold_expires_at = Some(50);
        for r in [&old_cancelled, &old_no_show, &old_completed, &recent_cancelled, &lapsed_hold] {
            rs.insert_reservation(r.clone());
        }
        assert_eq!(rs.occupying_count(1_000), 1);

        let pruned: HashSet<Ulid> = rs.prunable(1_000, 500).into_iter().collect();
        let expected: HashSet<Ulid> = [old_cancelled.id, old_no_show.id, lapsed_hold.id].into_iter().collect();
        assert_eq!(pruned, expected);
        rs.remove_reservations(&pruned);
        let kept: Vec<Ulid> = rs.reservations.iter().map(|r| r.id).collect();
        assert_eq!(kept, vec![old_completed.id, recent_cancelled.id]);
    }

    #[test]
    fn page_slices_and_counts() {
        let all: Vec<u32> = (0..45).collect();
        let second = Page::slice(all.clone(), PageRequest::new(2, 20));
        assert_eq!(second.items, (20..40).collect::<Vec<_>>());
        assert_eq!(second.total, 45);
        let last = Page::slice(all.clone(), PageRequest::new(3, 20));
        assert_eq!(last.items.len(), 5);
        assert!(Page::slice(all, PageRequest::new(9, 20)).items.is_empty());
        assert_eq!(PageRequest::new(usize::MAX, usize::MAX).offset(), usize::MAX);
    }

    #[test]
    fn page_request_defaults() {
        let page: PageRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(page, PageRequest::default());
        assert_eq!((page.page, page.limit), (1, 20));
    }
}
