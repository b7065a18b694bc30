use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::calendar::bookable_spans;
use super::slots::timeline;
use super::{Engine, EngineError};

fn matches_filter(r: &Reservation, filter: &ReservationFilter) -> bool {
    if filter.requester_id.as_deref().is_some_and(|q| q != r.requester_id) {
        return false;
    }
    if filter.status.is_some_and(|s| s != r.status) {
        return false;
    }
    let window = Span {
        start: filter.from.unwrap_or(Ms::MIN),
        end: filter.to.unwrap_or(Ms::MAX),
    };
    r.span.overlaps(&window)
}

fn is_upcoming(r: &Reservation, now: Ms) -> bool {
    matches!(r.status, ReservationStatus::OnHold | ReservationStatus::Confirmed) && r.span.end > now
}

fn validate_page(page: &PageRequest) -> Result<(), EngineError> {
    if page.page == 0 {
        return Err(EngineError::validation("page starts at 1"));
    }
    if page.limit == 0 || page.limit > MAX_LIST_RESULTS {
        return Err(EngineError::validation("limit out of range"));
    }
    Ok(())
}

impl Engine {
    /// The resource's timeline for one calendar date.
    ///
    /// Empty when no available window applies on that date. Inactive resources
    /// still get a timeline; only new holds are refused for them.
    pub async fn generate_slots(&self, resource_id: Ulid, date: NaiveDate) -> Result<Vec<Slot>, EngineError> {
        let guard = self.read_resource(resource_id).await?;
        let bookable = bookable_spans(&self.settings.utc_offset, &guard.windows, date);
        Ok(timeline(&bookable, &guard, self.now_ms()))
    }

    /// Effective view: a hold past its TTL reads as CANCELLED(EXPIRED) even
    /// before the sweeper has persisted it.
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let resource_id = self
            .get_resource_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.read_resource(resource_id).await?;
        guard
            .reservation(&id)
            .map(|r| r.effective(self.now_ms()))
            .ok_or(EngineError::NotFound(id))
    }

    /// Every reservation passing `keep`, effective view, ordered by (start, id).
    async fn collect_reservations(
        &self,
        resource_id: Option<Ulid>,
        keep: impl Fn(&Reservation) -> bool,
    ) -> Result<Vec<Reservation>, EngineError> {
        let resources = match resource_id {
            Some(id) => vec![self.get_resource(&id).ok_or(EngineError::NotFound(id))?],
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };

        let now = self.now_ms();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .map(|r| r.effective(now))
                    .filter(|r| keep(r)),
            );
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Reservations matching `filter`, ordered by (start, id), one page at a
    /// time. Status filtering applies to the effective status.
    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
        page: PageRequest,
    ) -> Result<Page<Reservation>, EngineError> {
        validate_page(&page)?;
        if let (Some(from), Some(to)) = (filter.from, filter.to)
            && from >= to
        {
            return Err(EngineError::validation("from must be before to"));
        }

        let all = self
            .collect_reservations(filter.resource_id, |r| matches_filter(r, filter))
            .await?;
        Ok(Page::slice(all, page))
    }

    /// A requester's reservations that still occupy time and have not ended,
    /// soonest first.
    pub async fn upcoming(&self, requester_id: &str, page: PageRequest) -> Result<Page<Reservation>, EngineError> {
        validate_page(&page)?;
        let now = self.now_ms();
        let all = self
            .collect_reservations(None, |r| r.requester_id == requester_id && is_upcoming(r, now))
            .await?;
        Ok(Page::slice(all, page))
    }

    /// Everything of a requester's that is not upcoming: ended, cancelled or
    /// marked. Newest first. Records pruned by compaction are gone from here.
    pub async fn history(&self, requester_id: &str, page: PageRequest) -> Result<Page<Reservation>, EngineError> {
        validate_page(&page)?;
        let now = self.now_ms();
        let mut all = self
            .collect_reservations(None, |r| r.requester_id == requester_id && !is_upcoming(r, now))
            .await?;
        all.reverse();
        Ok(Page::slice(all, page))
    }

    /// Series record plus the current (effective) state of each member.
    pub async fn get_series(&self, series_id: Ulid) -> Result<SeriesInfo, EngineError> {
        let series = self
            .series
            .get(&series_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(series_id))?;

        let guard = self.read_resource(series.resource_id).await?;
        let now = self.now_ms();
        let members = series
            .members
            .iter()
            .filter_map(|id| guard.reservation(id))
            .map(|r| r.effective(now))
            .collect();
        drop(guard);
        Ok(SeriesInfo { series, members })
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        Ok(self.read_resource(id).await?.info())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn list_windows(&self, resource_id: Ulid) -> Result<Vec<OperatingWindow>, EngineError> {
        Ok(self.read_resource(resource_id).await?.windows.clone())
    }
}
