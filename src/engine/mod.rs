mod calendar;
mod conflict;
mod error;
mod mutations;
mod queries;
mod recurrence;
mod slots;

pub use calendar::{bookable_spans, day_span, instant, window_span, windows_for_date};
pub use error::{EngineError, ErrorKind};
pub use recurrence::{candidate_dates, resolve_weekdays, FailedDate, SeriesChange, SeriesOutcome};
pub use slots::{merge_overlapping, subtract_intervals, timeline};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-buffered bytes don't leak
    // into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// The booking engine: per-resource state behind a lock each, a WAL for
/// durability, and the recurring series index.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) series: DashMap<Ulid, RecurringSeries>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (reservation/window) id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    /// Held by registration and by compaction: a resource is either in the
    /// compaction snapshot or registered after the swap, never in between.
    pub(super) catalog: Mutex<()>,
}

/// Apply the per-resource half of an event. Caller holds the write lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceUpdated {
            name,
            active,
            max_duration_ms,
            slot_granularity_ms,
            ..
        } => {
            rs.name = name.clone();
            rs.active = *active;
            rs.max_duration_ms = *max_duration_ms;
            rs.slot_granularity_ms = *slot_granularity_ms;
        }
        Event::WindowAdded { window } => {
            entity_map.insert(window.id, window.resource_id);
            rs.insert_window(window.clone());
        }
        Event::WindowRemoved { id, .. } => {
            rs.remove_window(*id);
            entity_map.remove(id);
        }
        Event::ReservationPlaced { reservation } => {
            entity_map.insert(reservation.id, reservation.resource_id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationConfirmed { id, at, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.status = ReservationStatus::Confirmed;
                r.hold_expires_at = None;
                r.updated_at = *at;
            }
        }
        Event::ReservationCancelled { id, at, cause, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.status = ReservationStatus::Cancelled;
                r.cancel_cause = Some(*cause);
                r.hold_expires_at = None;
                r.updated_at = *at;
            }
        }
        Event::ReservationCompleted { id, at, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.status = ReservationStatus::Completed;
                r.updated_at = *at;
            }
        }
        Event::ReservationNoShow { id, at, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.status = ReservationStatus::NoShow;
                r.updated_at = *at;
            }
        }
        Event::ReservationUpdated {
            id, at, reason, notes, ..
        } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.reason = reason.clone();
                r.notes = notes.clone();
                r.updated_at = *at;
            }
        }
        Event::SeriesMemberDetached { reservation_id, .. } => {
            if let Some(r) = rs.reservation_mut(reservation_id) {
                r.recurring_series_id = None;
            }
        }
        // Registration happens at the DashMap level; series live in their own index.
        Event::ResourceRegistered { .. } | Event::SeriesCreated { .. } | Event::SeriesUpdated { .. } => {}
    }
}

/// Apply the series-index half of an event.
fn apply_to_series(series: &DashMap<Ulid, RecurringSeries>, event: &Event) {
    match event {
        Event::SeriesCreated { series: s } | Event::SeriesUpdated { series: s } => {
            series.insert(s.id, s.clone());
        }
        Event::SeriesMemberDetached {
            series_id,
            reservation_id,
            ..
        } => {
            if let Some(mut s) = series.get_mut(series_id) {
                s.members.retain(|m| m != reservation_id);
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            series: DashMap::new(),
            wal_tx,
            notify,
            entity_to_resource: DashMap::new(),
            clock,
            settings,
            catalog: Mutex::new(()),
        };

        // Rebuild plain state first and only wrap it in locks once replay is done.
        let mut resources: HashMap<Ulid, ResourceState> = HashMap::new();
        for event in &events {
            match event {
                Event::ResourceRegistered {
                    id,
                    name,
                    active,
                    max_duration_ms,
                    slot_granularity_ms,
                } => {
                    resources.insert(
                        *id,
                        ResourceState::new(*id, name.clone(), *active, *max_duration_ms, *slot_granularity_ms),
                    );
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(rs) = resources.get_mut(&resource_id)
                    {
                        apply_to_resource(rs, other, &engine.entity_to_resource);
                    }
                    apply_to_series(&engine.series, other);
                }
            }
        }
        for (id, rs) in resources {
            engine.state.insert(id, Arc::new(RwLock::new(rs)));
        }

        Ok(engine)
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(super) fn retention_ms(&self) -> Ms {
        Ms::try_from(self.settings.retention.as_millis()).unwrap_or(Ms::MAX)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify. Caller holds the resource's write lock,
    /// which is what makes check-then-insert atomic.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.entity_to_resource);
        apply_to_series(&self.series, event);
        self.notify.send(resource_id, event);
        Ok(())
    }

    /// Exclusive lock on one resource, bounded by the configured lock timeout.
    pub(super) async fn write_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        match tokio::time::timeout(self.settings.lock_timeout, rs.write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                Err(EngineError::Busy(resource_id))
            }
        }
    }

    pub(super) async fn read_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        match tokio::time::timeout(self.settings.lock_timeout, rs.read_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                Err(EngineError::Busy(resource_id))
            }
        }
    }

    /// Lookup entity → resource, then take that resource's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.write_resource(resource_id).await?;
        Ok((resource_id, guard))
    }
}

/// Extract the resource_id from an event (for non-registration events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ResourceUpdated { id, .. } => Some(*id),
        Event::WindowAdded { window } => Some(window.resource_id),
        Event::ReservationPlaced { reservation } => Some(reservation.resource_id),
        Event::WindowRemoved { resource_id, .. }
        | Event::ReservationConfirmed { resource_id, .. }
        | Event::ReservationCancelled { resource_id, .. }
        | Event::ReservationCompleted { resource_id, .. }
        | Event::ReservationNoShow { resource_id, .. }
        | Event::ReservationUpdated { resource_id, .. }
        | Event::SeriesMemberDetached { resource_id, .. } => Some(*resource_id),
        Event::SeriesCreated { series } | Event::SeriesUpdated { series } => Some(series.resource_id),
        Event::ResourceRegistered { .. } => None,
    }
}
