use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveTime;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_notes, validate_reason, validate_requester, validate_span};
use super::{Engine, EngineError, SharedResourceState, WalCommand};

fn validate_resource_fields(
    name: Option<&str>,
    max_duration_ms: Option<Ms>,
    slot_granularity_ms: Option<Ms>,
) -> Result<(), EngineError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::validation("resource name too long"));
    }
    if max_duration_ms.is_some_and(|d| d <= 0) {
        return Err(EngineError::validation("max_duration_ms must be positive"));
    }
    if slot_granularity_ms.is_some_and(|g| g <= 0) {
        return Err(EngineError::validation("slot_granularity_ms must be positive"));
    }
    Ok(())
}

impl Engine {
    // ── Resource catalog ─────────────────────────────────────

    pub async fn register_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        active: bool,
        max_duration_ms: Option<Ms>,
        slot_granularity_ms: Option<Ms>,
    ) -> Result<ResourceInfo, EngineError> {
        validate_resource_fields(name.as_deref(), max_duration_ms, slot_granularity_ms)?;
        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::validation("too many resources"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceRegistered {
            id,
            name: name.clone(),
            active,
            max_duration_ms,
            slot_granularity_ms,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, active, max_duration_ms, slot_granularity_ms);
        let info = rs.info();
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        self.notify.send(id, &event);
        info!("registered resource {id}");
        Ok(info)
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        active: bool,
        max_duration_ms: Option<Ms>,
        slot_granularity_ms: Option<Ms>,
    ) -> Result<ResourceInfo, EngineError> {
        validate_resource_fields(name.as_deref(), max_duration_ms, slot_granularity_ms)?;
        let mut guard = self.write_resource(id).await?;
        let event = Event::ResourceUpdated {
            id,
            name,
            active,
            max_duration_ms,
            slot_granularity_ms,
        };
        self.persist_and_apply(id, &mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Flip only the active flag, keeping the other attributes.
    pub async fn set_active(&self, id: Ulid, active: bool) -> Result<ResourceInfo, EngineError> {
        let mut guard = self.write_resource(id).await?;
        let event = Event::ResourceUpdated {
            id,
            name: guard.name.clone(),
            active,
            max_duration_ms: guard.max_duration_ms,
            slot_granularity_ms: guard.slot_granularity_ms,
        };
        self.persist_and_apply(id, &mut guard, &event).await?;
        Ok(guard.info())
    }

    // ── Operating calendar ───────────────────────────────────

    pub async fn add_window(&self, window: OperatingWindow) -> Result<(), EngineError> {
        if window.end_time != NaiveTime::MIN && window.start_time >= window.end_time {
            return Err(EngineError::validation("window start_time must be before end_time"));
        }
        if self.entity_to_resource.contains_key(&window.id) {
            return Err(EngineError::AlreadyExists(window.id));
        }
        let resource_id = window.resource_id;
        let mut guard = self.write_resource(resource_id).await?;
        if guard.windows.len() >= MAX_WINDOWS_PER_RESOURCE {
            return Err(EngineError::validation("too many operating windows on resource"));
        }
        let event = Event::WindowAdded { window };
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    pub async fn remove_window(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::WindowRemoved { id, resource_id };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        Ok(resource_id)
    }

    // ── Hold / confirm protocol ──────────────────────────────

    /// First step of booking: reserve `span` for `hold_ttl` pending confirmation.
    pub async fn hold(
        &self,
        resource_id: Ulid,
        requester_id: String,
        span: Span,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        self.place_hold(resource_id, requester_id, span, reason, None).await
    }

    pub(super) async fn place_hold(
        &self,
        resource_id: Ulid,
        requester_id: String,
        span: Span,
        reason: Option<String>,
        recurring_series_id: Option<Ulid>,
    ) -> Result<Reservation, EngineError> {
        validate_span(&span)?;
        validate_requester(&requester_id)?;
        validate_reason(reason.as_deref())?;

        let mut guard = self.write_resource(resource_id).await?;
        if !guard.active {
            return Err(EngineError::Inactive(resource_id));
        }
        if guard.max_duration_ms.is_some_and(|max| span.duration_ms() > max) {
            return Err(EngineError::validation("interval exceeds the resource's max booking duration"));
        }
        let now = self.now_ms();
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE
            && guard.occupying_count(now) >= MAX_RESERVATIONS_PER_RESOURCE
        {
            return Err(EngineError::validation("too many reservations on resource"));
        }

        let candidate = Reservation {
            id: Ulid::new(),
            resource_id,
            requester_id,
            span,
            status: ReservationStatus::OnHold,
            created_at: now,
            updated_at: now,
            hold_expires_at: Some(now + self.settings.hold_ttl.as_millis() as Ms),
            cancel_cause: None,
            recurring_series_id,
            reason,
            notes: None,
        };
        self.try_insert(resource_id, &mut guard, candidate, now).await
    }

    /// Overlap check and insert under the caller's write lock. On conflict
    /// nothing is written and the blocking reservation ids are returned.
    async fn try_insert(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        candidate: Reservation,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        if let Err(e) = check_no_conflict(rs, &candidate.span, now) {
            metrics::counter!(crate::observability::HOLD_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }
        let event = Event::ReservationPlaced {
            reservation: candidate.clone(),
        };
        self.persist_and_apply(resource_id, rs, &event).await?;
        metrics::counter!(crate::observability::HOLDS_PLACED_TOTAL).increment(1);
        Ok(candidate)
    }

    /// Second step of booking. Must land before `hold_expires_at`.
    pub async fn confirm(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let now = self.now_ms();
        let current = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if current.is_expired_hold(now) {
            self.expire_locked(resource_id, &mut guard, id, now).await?;
            return Err(EngineError::Expired(id));
        }
        match current.status {
            ReservationStatus::OnHold => {}
            ReservationStatus::Cancelled if current.cancel_cause == Some(CancelCause::Expired) => {
                return Err(EngineError::Expired(id));
            }
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    reason: "only held reservations can be confirmed",
                });
            }
        }

        let event = Event::ReservationConfirmed { id, resource_id, at: now };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        self.current(&guard, id)
    }

    /// Cancel whatever is cancellable: a live hold or a confirmed reservation.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.cancel_where(id, &[ReservationStatus::OnHold, ReservationStatus::Confirmed])
            .await
    }

    pub async fn cancel_hold(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.cancel_where(id, &[ReservationStatus::OnHold]).await
    }

    pub async fn cancel_confirmed(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.cancel_where(id, &[ReservationStatus::Confirmed]).await
    }

    async fn cancel_where(
        &self,
        id: Ulid,
        allowed: &[ReservationStatus],
    ) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let now = self.now_ms();
        let current = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if current.is_expired_hold(now) && allowed.contains(&ReservationStatus::OnHold) {
            self.expire_locked(resource_id, &mut guard, id, now).await?;
            return Err(EngineError::Expired(id));
        }
        if !allowed.contains(&current.status) || current.is_expired_hold(now) {
            return Err(EngineError::InvalidState {
                id,
                status: current.effective(now).status,
                reason: "reservation cannot be cancelled from this status",
            });
        }

        let event = Event::ReservationCancelled {
            id,
            resource_id,
            at: now,
            cause: CancelCause::Explicit,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        self.current(&guard, id)
    }

    /// Edit the free-text fields of a live reservation. A field left as `None`
    /// keeps its current value.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        reason: Option<String>,
        notes: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if reason.is_none() && notes.is_none() {
            return Err(EngineError::validation("nothing to update"));
        }
        validate_reason(reason.as_deref())?;
        validate_notes(notes.as_deref())?;

        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let now = self.now_ms();
        let current = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if current.is_expired_hold(now) {
            self.expire_locked(resource_id, &mut guard, id, now).await?;
            return Err(EngineError::Expired(id));
        }
        if current.status.is_terminal() {
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
                reason: "only live reservations can be edited",
            });
        }

        let event = Event::ReservationUpdated {
            id,
            resource_id,
            at: now,
            reason: reason.or(current.reason),
            notes: notes.or(current.notes),
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        self.current(&guard, id)
    }

    /// Post-hoc marking: CONFIRMED → COMPLETED once the interval has ended.
    pub async fn mark_completed(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.mark_elapsed(id, |resource_id, at| Event::ReservationCompleted { id, resource_id, at })
            .await
    }

    /// Post-hoc marking: CONFIRMED → NO_SHOW once the interval has ended.
    pub async fn mark_no_show(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.mark_elapsed(id, |resource_id, at| Event::ReservationNoShow { id, resource_id, at })
            .await
    }

    async fn mark_elapsed(
        &self,
        id: Ulid,
        event_for: impl FnOnce(Ulid, Ms) -> Event,
    ) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let now = self.now_ms();
        let current = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if current.status != ReservationStatus::Confirmed {
            return Err(EngineError::InvalidState {
                id,
                status: current.effective(now).status,
                reason: "only confirmed reservations can be marked",
            });
        }
        if now < current.span.end {
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
                reason: "reservation has not ended yet",
            });
        }

        let event = event_for(resource_id, now);
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        self.current(&guard, id)
    }

    // ── Expiry ───────────────────────────────────────────────

    /// Persist ONHOLD → CANCELLED(EXPIRED). Caller holds the write lock and has
    /// already established the hold is expired.
    async fn expire_locked(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        id: Ulid,
        now: Ms,
    ) -> Result<(), EngineError> {
        let at = rs
            .reservation(&id)
            .and_then(|r| r.hold_expires_at)
            .unwrap_or(now);
        let event = Event::ReservationCancelled {
            id,
            resource_id,
            at,
            cause: CancelCause::Expired,
        };
        self.persist_and_apply(resource_id, rs, &event).await?;
        metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
        Ok(())
    }

    /// Expire one hold if it is still ONHOLD and past its TTL.
    /// Returns whether this call did the transition.
    pub async fn expire_hold(&self, id: Ulid) -> Result<bool, EngineError> {
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let now = self.now_ms();
        let expired = guard.reservation(&id).is_some_and(|r| r.is_expired_hold(now));
        if !expired {
            return Ok(false);
        }
        self.expire_locked(resource_id, &mut guard, id, now).await?;
        Ok(true)
    }

    /// (reservation id, resource id) of every hold whose TTL has run out at `now`.
    pub async fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut expired = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            expired.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.is_expired_hold(now))
                    .map(|r| (r.id, guard.id)),
            );
        }
        expired
    }

    /// Cancel every expired hold. Idempotent: already-cancelled or confirmed
    /// records are skipped, so a second run reports 0.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.now_ms();
        let mut count = 0;
        for (hold_id, resource_id) in self.collect_expired_holds(now).await {
            match self.expire_hold(hold_id).await {
                Ok(true) => {
                    count += 1;
                    info!("expired hold {hold_id} on resource {resource_id}");
                }
                Ok(false) => {}
                Err(e) => debug!("sweep skip {hold_id}: {e}"),
            }
        }
        count
    }

    // ── Recurring series bookkeeping ─────────────────────────

    /// Series records are written under their resource's lock so compaction
    /// sees either all of a series change or none of it.
    pub(super) async fn record_series(&self, event: Event) -> Result<(), EngineError> {
        let resource_id = match &event {
            Event::SeriesCreated { series } | Event::SeriesUpdated { series } => series.resource_id,
            _ => return Err(EngineError::validation("not a series event")),
        };
        let mut guard = self.write_resource(resource_id).await?;
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    /// Drop a reservation from its series. The reservation itself is untouched.
    pub async fn detach_member(&self, series_id: Ulid, reservation_id: Ulid) -> Result<(), EngineError> {
        let is_member = self
            .series
            .get(&series_id)
            .ok_or(EngineError::NotFound(series_id))?
            .members
            .contains(&reservation_id);
        if !is_member {
            return Err(EngineError::NotFound(reservation_id));
        }
        let (resource_id, mut guard) = self.resolve_entity_write(&reservation_id).await?;
        let event = Event::SeriesMemberDetached {
            series_id,
            reservation_id,
            resource_id,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    /// Cancel every member that has not started yet. Returns how many changed.
    pub async fn cancel_series(&self, series_id: Ulid) -> Result<usize, EngineError> {
        let members = self
            .series
            .get(&series_id)
            .ok_or(EngineError::NotFound(series_id))?
            .members
            .clone();

        let cancelled = self.cancel_members(&members, |_| true).await?;
        info!("cancelled {cancelled} future member(s) of series {series_id}");
        Ok(cancelled)
    }

    /// Cancel the members matching `only` that have not started and still
    /// hold their time. Lapsed holds among them are expired instead.
    pub(super) async fn cancel_members(
        &self,
        members: &[Ulid],
        only: impl Fn(&Reservation) -> bool,
    ) -> Result<usize, EngineError> {
        let mut cancelled = 0;
        for &id in members {
            // pruned by compaction
            let Some(resource_id) = self.get_resource_for_entity(&id) else {
                continue;
            };
            let mut guard = self.write_resource(resource_id).await?;
            let now = self.now_ms();
            let Some(current) = guard.reservation(&id).cloned() else {
                continue;
            };
            if current.span.start <= now || !only(&current) {
                continue;
            }
            if current.is_expired_hold(now) {
                self.expire_locked(resource_id, &mut guard, id, now).await?;
                continue;
            }
            if !matches!(current.status, ReservationStatus::OnHold | ReservationStatus::Confirmed) {
                continue;
            }
            let event = Event::ReservationCancelled {
                id,
                resource_id,
                at: now,
                cause: CancelCause::Explicit,
            };
            self.persist_and_apply(resource_id, &mut guard, &event).await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    /// Give every live member that has not started the new `reason`.
    pub(super) async fn retitle_members(&self, members: &[Ulid], reason: &str) -> Result<(), EngineError> {
        for &id in members {
            let Some(resource_id) = self.get_resource_for_entity(&id) else {
                continue;
            };
            let mut guard = self.write_resource(resource_id).await?;
            let now = self.now_ms();
            let Some(current) = guard.reservation(&id).cloned() else {
                continue;
            };
            if current.span.start <= now || !current.occupies(now) || current.reason.as_deref() == Some(reason) {
                continue;
            }
            let event = Event::ReservationUpdated {
                id,
                resource_id,
                at: now,
                reason: Some(reason.to_string()),
                notes: current.notes,
            };
            self.persist_and_apply(resource_id, &mut guard, &event).await?;
        }
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state, leaving out reservations past the retention horizon.
    ///
    /// Every resource stays read-locked, in id order, from snapshot until the
    /// new log is in place. A write acknowledged in the old log after its
    /// resource was snapshotted would otherwise vanish with the rename.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let mut resources: Vec<(Ulid, SharedResourceState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        resources.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(resources.len());
        for (_, rs) in resources {
            guards.push(rs.read_owned().await);
        }

        let now = self.now_ms();
        let retention = self.retention_ms();
        let mut events = Vec::new();
        let mut pruned: HashSet<Ulid> = HashSet::new();
        let mut touched = Vec::new();

        for guard in &guards {
            events.push(Event::ResourceRegistered {
                id: guard.id,
                name: guard.name.clone(),
                active: guard.active,
                max_duration_ms: guard.max_duration_ms,
                slot_granularity_ms: guard.slot_granularity_ms,
            });
            for window in &guard.windows {
                events.push(Event::WindowAdded {
                    window: window.clone(),
                });
            }
            let prunable = guard.prunable(now, retention);
            if !prunable.is_empty() {
                touched.push(guard.id);
                pruned.extend(prunable);
            }
            for reservation in guard.reservations.iter().filter(|r| !pruned.contains(&r.id)) {
                events.push(Event::ReservationPlaced {
                    reservation: reservation.clone(),
                });
            }
        }
        for entry in self.series.iter() {
            let mut series = entry.value().clone();
            series.members.retain(|m| !pruned.contains(m));
            events.push(Event::SeriesCreated { series });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);

        // A pruned record no longer occupies time, so nothing written since
        // the snapshot can have brought it back.
        for resource_id in touched {
            if let Some(rs) = self.get_resource(&resource_id) {
                rs.write().await.remove_reservations(&pruned);
            }
        }
        for id in &pruned {
            self.entity_to_resource.remove(id);
        }
        if !pruned.is_empty() {
            for mut series in self.series.iter_mut() {
                series.members.retain(|m| !pruned.contains(m));
            }
            info!("compaction pruned {} reservation(s) past retention", pruned.len());
        }
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn current(&self, rs: &ResourceState, id: Ulid) -> Result<Reservation, EngineError> {
        rs.reservation(&id)
            .map(|r| r.effective(self.now_ms()))
            .ok_or(EngineError::NotFound(id))
    }
}
