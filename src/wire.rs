use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

fn yes() -> bool {
    true
}

/// One request line: `{"op": "<name>", ...fields}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Slots {
        resource_id: Ulid,
        date: NaiveDate,
    },
    Hold {
        resource_id: Ulid,
        requester_id: String,
        start: Ms,
        end: Ms,
        #[serde(default)]
        reason: Option<String>,
    },
    Confirm {
        id: Ulid,
    },
    Cancel {
        id: Ulid,
    },
    Recurring(RecurringRequest),
    SweepExpired,
    Get {
        id: Ulid,
    },
    List(ListFields),
    Upcoming {
        requester_id: String,
        #[serde(default)]
        page: Option<usize>,
        #[serde(default)]
        limit: Option<usize>,
    },
    History {
        requester_id: String,
        #[serde(default)]
        page: Option<usize>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Update {
        id: Ulid,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },
    Series {
        id: Ulid,
    },
    CancelSeries {
        id: Ulid,
    },
    UpdateSeries {
        id: Ulid,
        #[serde(default)]
        end_date: Option<NaiveDate>,
        #[serde(default)]
        reason: Option<String>,
    },
    DetachMember {
        series_id: Ulid,
        reservation_id: Ulid,
    },
    Complete {
        id: Ulid,
    },
    NoShow {
        id: Ulid,
    },
    RegisterResource(ResourceFields),
    UpdateResource(ResourceFields),
    SetActive {
        id: Ulid,
        active: bool,
    },
    Resources,
    AddWindow(WindowFields),
    RemoveWindow {
        id: Ulid,
    },
    Windows {
        resource_id: Ulid,
    },
    Watch {
        resource_id: Ulid,
    },
    Unwatch {
        resource_id: Ulid,
    },
}

/// `list` takes the filter and the page selector side by side.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFields {
    #[serde(default)]
    pub resource_id: Option<Ulid>,
    #[serde(default)]
    pub requester_id: Option<String>,
    #[serde(default)]
    pub status: Option<ReservationStatus>,
    #[serde(default)]
    pub from: Option<Ms>,
    #[serde(default)]
    pub to: Option<Ms>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListFields {
    fn split(self) -> (ReservationFilter, PageRequest) {
        let page = page_request(self.page, self.limit);
        let filter = ReservationFilter {
            resource_id: self.resource_id,
            requester_id: self.requester_id,
            status: self.status,
            from: self.from,
            to: self.to,
        };
        (filter, page)
    }
}

/// Absent paging fields fall back to the first page at the default size.
fn page_request(page: Option<usize>, limit: Option<usize>) -> PageRequest {
    let defaults = PageRequest::default();
    PageRequest::new(page.unwrap_or(defaults.page), limit.unwrap_or(defaults.limit))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceFields {
    /// Generated on register when absent.
    #[serde(default)]
    pub id: Option<Ulid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub max_duration_ms: Option<Ms>,
    #[serde(default)]
    pub slot_granularity_ms: Option<Ms>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowFields {
    #[serde(default)]
    pub id: Option<Ulid>,
    pub resource_id: Ulid,
    pub day: WindowDay,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default = "yes")]
    pub is_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    /// The availability the client last read is stale and should be re-fetched.
    pub refresh_slots: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicting: Option<Vec<Ulid>>,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        let kind = e.kind();
        Self {
            kind,
            message: e.to_string(),
            retryable: kind.is_retryable(),
            refresh_slots: matches!(kind, ErrorKind::Conflict | ErrorKind::Expired),
            conflicting: match e {
                EngineError::Conflict(ids) => Some(ids.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("codec: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn ok_reply(data: Value) -> Value {
    json!({ "ok": true, "data": data })
}

pub fn error_reply(body: &ErrorBody) -> Value {
    json!({ "ok": false, "error": body })
}

fn bad_request(message: String) -> Value {
    error_reply(&ErrorBody {
        kind: ErrorKind::ValidationError,
        message,
        retryable: false,
        refresh_slots: false,
        conflicting: None,
    })
}

/// Run one engine operation. Watch and unwatch are per-connection and
/// never reach here.
pub async fn dispatch(engine: &Engine, request: Request) -> Result<Value, EngineError> {
    let value = match request {
        Request::Slots { resource_id, date } => to_value(engine.generate_slots(resource_id, date).await?)?,
        Request::Hold {
            resource_id,
            requester_id,
            start,
            end,
            reason,
        } => to_value(engine.hold(resource_id, requester_id, Span { start, end }, reason).await?)?,
        Request::Confirm { id } => to_value(engine.confirm(id).await?)?,
        Request::Cancel { id } => to_value(engine.cancel(id).await?)?,
        Request::Recurring(request) => to_value(engine.expand_recurring(request).await?)?,
        Request::SweepExpired => json!({ "count": engine.sweep_expired().await }),
        Request::Get { id } => to_value(engine.get_reservation(id).await?)?,
        Request::List(fields) => {
            let (filter, page) = fields.split();
            to_value(engine.list_reservations(&filter, page).await?)?
        }
        Request::Upcoming {
            requester_id,
            page,
            limit,
        } => to_value(engine.upcoming(&requester_id, page_request(page, limit)).await?)?,
        Request::History {
            requester_id,
            page,
            limit,
        } => to_value(engine.history(&requester_id, page_request(page, limit)).await?)?,
        Request::Update { id, reason, notes } => to_value(engine.update_reservation(id, reason, notes).await?)?,
        Request::Series { id } => to_value(engine.get_series(id).await?)?,
        Request::CancelSeries { id } => json!({ "count": engine.cancel_series(id).await? }),
        Request::UpdateSeries { id, end_date, reason } => {
            to_value(engine.update_series(id, end_date, reason).await?)?
        }
        Request::DetachMember {
            series_id,
            reservation_id,
        } => {
            engine.detach_member(series_id, reservation_id).await?;
            Value::Null
        }
        Request::Complete { id } => to_value(engine.mark_completed(id).await?)?,
        Request::NoShow { id } => to_value(engine.mark_no_show(id).await?)?,
        Request::RegisterResource(f) => to_value(
            engine
                .register_resource(
                    f.id.unwrap_or_else(Ulid::new),
                    f.name,
                    f.active,
                    f.max_duration_ms,
                    f.slot_granularity_ms,
                )
                .await?,
        )?,
        Request::UpdateResource(f) => {
            let id = f.id.ok_or_else(|| EngineError::validation("id is required"))?;
            to_value(
                engine
                    .update_resource(id, f.name, f.active, f.max_duration_ms, f.slot_granularity_ms)
                    .await?,
            )?
        }
        Request::SetActive { id, active } => to_value(engine.set_active(id, active).await?)?,
        Request::Resources => to_value(engine.list_resources().await)?,
        Request::AddWindow(f) => {
            let window = OperatingWindow {
                id: f.id.unwrap_or_else(Ulid::new),
                resource_id: f.resource_id,
                day: f.day,
                start_time: f.start_time,
                end_time: f.end_time,
                is_available: f.is_available,
            };
            engine.add_window(window.clone()).await?;
            to_value(window)?
        }
        Request::RemoveWindow { id } => json!({ "resource_id": engine.remove_window(id).await? }),
        Request::Windows { resource_id } => to_value(engine.list_windows(resource_id).await?)?,
        Request::Watch { .. } | Request::Unwatch { .. } => Value::Null,
    };
    Ok(value)
}

fn to_value(data: impl Serialize) -> Result<Value, EngineError> {
    serde_json::to_value(data).map_err(|e| EngineError::Validation(format!("unencodable reply: {e}")))
}

/// Forward one resource's events onto the connection's push queue until the
/// client unwatches or disconnects.
fn spawn_forwarder(
    resource_id: Ulid,
    mut rx: broadcast::Receiver<Event>,
    push_tx: mpsc::Sender<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let pushed = match rx.recv().await {
                Ok(event) => json!({ "event": { "resource_id": resource_id, "change": event } }),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    json!({ "event": { "resource_id": resource_id, "lagged": missed } })
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if push_tx.send(pushed).await.is_err() {
                break;
            }
        }
    })
}

struct Watches {
    engine: Arc<Engine>,
    push_tx: mpsc::Sender<Value>,
    tasks: HashMap<Ulid, JoinHandle<()>>,
}

impl Watches {
    fn watch(&mut self, resource_id: Ulid) -> Result<(), EngineError> {
        if self.engine.get_resource(&resource_id).is_none() {
            return Err(EngineError::NotFound(resource_id));
        }
        if !self.tasks.contains_key(&resource_id) {
            let rx = self.engine.notify.subscribe(resource_id);
            let task = spawn_forwarder(resource_id, rx, self.push_tx.clone());
            self.tasks.insert(resource_id, task);
        }
        Ok(())
    }

    fn unwatch(&mut self, resource_id: &Ulid) {
        if let Some(task) = self.tasks.remove(resource_id) {
            task.abort();
            self.engine.notify.release(resource_id);
        }
    }
}

impl Drop for Watches {
    fn drop(&mut self) {
        let ids: Vec<Ulid> = self.tasks.keys().copied().collect();
        for id in ids {
            self.unwatch(&id);
        }
    }
}

async fn handle_line(engine: &Engine, watches: &mut Watches, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("malformed request: {e}")),
    };

    let op = observability::op_label(&request);
    let started = Instant::now();
    let result = match request {
        Request::Watch { resource_id } => watches.watch(resource_id).map(|()| Value::Null),
        Request::Unwatch { resource_id } => {
            watches.unwatch(&resource_id);
            Ok(Value::Null)
        }
        other => dispatch(engine, other).await,
    };

    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => ok_reply(data),
        Err(e) => {
            debug!("{op} failed: {e}");
            error_reply(&ErrorBody::from(&e))
        }
    }
}

/// Serve one client until it disconnects: answer each request line in order
/// and interleave pushed events for watched resources.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> Result<(), WireError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (push_tx, mut push_rx) = mpsc::channel::<Value>(256);
    let mut watches = Watches {
        engine: engine.clone(),
        push_tx,
        tasks: HashMap::new(),
    };

    loop {
        tokio::select! {
            incoming = framed.next() => {
                let reply = match incoming {
                    None => break,
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&engine, &mut watches, &line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("request line over {MAX_LINE_LEN} bytes dropped");
                        bad_request(format!("request line exceeds {MAX_LINE_LEN} bytes"))
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                framed.send(serde_json::to_string(&reply)?).await?;
            }
            Some(pushed) = push_rx.recv() => {
                framed.send(serde_json::to_string(&pushed)?).await?;
            }
        }
    }

    Ok(())
}
