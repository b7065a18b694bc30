use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use deskbook::clock::SystemClock;
use deskbook::config::EngineSettings;
use deskbook::engine::Engine;
use deskbook::notify::NotifyHub;
use deskbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("deskbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("deskbook.wal"),
            Arc::new(NotifyHub::new()),
            Arc::new(SystemClock),
            EngineSettings::default(),
        )
        .unwrap(),
    );

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.framed.send(line.to_string()).await.unwrap();
        self.next_line().await
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await
    }

    /// Call and unwrap a successful reply's data.
    async fn ok(&mut self, request: Value) -> Value {
        let reply = self.call(request).await;
        assert_eq!(reply["ok"], true, "request failed: {reply}");
        reply["data"].clone()
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for server")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

/// 2030-01-07 is a Monday, far enough ahead that holds made now are in the future.
fn booking_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
}

fn at(hour: u32) -> i64 {
    booking_day()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

async fn desk_with_hours(client: &mut Client) -> String {
    let info = client
        .ok(json!({ "op": "register_resource", "name": "Desk 7" }))
        .await;
    let rid = info["id"].as_str().unwrap().to_string();
    client
        .ok(json!({
            "op": "add_window",
            "resource_id": rid,
            "day": { "date": "2030-01-07" },
            "start_time": "09:00:00",
            "end_time": "17:00:00",
        }))
        .await;
    rid
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn hold_confirm_cancel_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let rid = desk_with_hours(&mut client).await;

    let held = client
        .ok(json!({
            "op": "hold",
            "resource_id": rid,
            "requester_id": "alice",
            "start": at(10),
            "end": at(11),
        }))
        .await;
    assert_eq!(held["status"], "ONHOLD");
    assert!(held["hold_expires_at"].is_i64());
    let id = held["id"].as_str().unwrap().to_string();

    let slots = client
        .ok(json!({ "op": "slots", "resource_id": rid, "date": "2030-01-07" }))
        .await;
    let statuses: Vec<&str> = slots
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["AVAILABLE", "BOOKED", "AVAILABLE"]);
    assert_eq!(slots[1]["booking_ref"]["id"], id.as_str());

    let confirmed = client.ok(json!({ "op": "confirm", "id": id })).await;
    assert_eq!(confirmed["status"], "CONFIRMED");
    assert!(confirmed["hold_expires_at"].is_null());

    let fetched = client.ok(json!({ "op": "get", "id": id })).await;
    assert_eq!(fetched["status"], "CONFIRMED");

    let cancelled = client.ok(json!({ "op": "cancel", "id": id })).await;
    assert_eq!(cancelled["status"], "CANCELLED");
    assert_eq!(cancelled["cancel_cause"], "EXPLICIT");
}

#[tokio::test]
async fn conflict_reply_asks_for_fresh_slots() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let rid = desk_with_hours(&mut client).await;

    let first = client
        .ok(json!({
            "op": "hold", "resource_id": rid, "requester_id": "alice",
            "start": at(10), "end": at(12),
        }))
        .await;

    let reply = client
        .call(json!({
            "op": "hold", "resource_id": rid, "requester_id": "bob",
            "start": at(11), "end": at(13),
        }))
        .await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["kind"], "conflict");
    assert_eq!(reply["error"]["refresh_slots"], true);
    assert_eq!(reply["error"]["retryable"], false);
    assert_eq!(reply["error"]["conflicting"], json!([first["id"]]));

    // abutting is fine
    client
        .ok(json!({
            "op": "hold", "resource_id": rid, "requester_id": "bob",
            "start": at(12), "end": at(13),
        }))
        .await;
}

#[tokio::test]
async fn bad_requests_keep_connection_open() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.send_raw("this is not json").await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["kind"], "validation_error");

    let reply = client.call(json!({ "op": "confirm", "id": Ulid::new().to_string() })).await;
    assert_eq!(reply["error"]["kind"], "not_found");

    let reply = client
        .call(json!({
            "op": "hold", "resource_id": Ulid::new().to_string(), "requester_id": "alice",
            "start": at(11), "end": at(10),
        }))
        .await;
    assert_eq!(reply["error"]["kind"], "validation_error");

    let swept = client.ok(json!({ "op": "sweep_expired" })).await;
    assert_eq!(swept["count"], 0);
}

#[tokio::test]
async fn recurring_series_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let rid = desk_with_hours(&mut client).await;

    let outcome = client
        .ok(json!({
            "op": "recurring",
            "resource_id": rid,
            "requester_id": "alice",
            "first_date": "2030-01-07",
            "end_date": "2030-01-28",
            "pattern": "WEEKLY",
            "time_range": { "start": "09:00:00", "end": "10:00:00" },
        }))
        .await;
    assert_eq!(outcome["created"].as_array().unwrap().len(), 4);
    assert!(outcome["failed"].as_array().unwrap().is_empty());

    let series_id = outcome["series_id"].as_str().unwrap().to_string();
    let series = client.ok(json!({ "op": "series", "id": series_id })).await;
    assert_eq!(series["series"]["days"], json!(["Mon"]));

    let cancelled = client.ok(json!({ "op": "cancel_series", "id": series_id })).await;
    assert_eq!(cancelled["count"], 4);
}

#[tokio::test]
async fn edits_and_paged_reads_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let rid = desk_with_hours(&mut client).await;

    let mut ids = Vec::new();
    for hour in [10, 12, 14] {
        let held = client
            .ok(json!({
                "op": "hold", "resource_id": rid, "requester_id": "dana",
                "start": at(hour), "end": at(hour + 1), "reason": "focus",
            }))
            .await;
        ids.push(held["id"].as_str().unwrap().to_string());
    }

    let edited = client
        .ok(json!({ "op": "update", "id": ids[0], "notes": "window seat" }))
        .await;
    assert_eq!(edited["reason"], "focus");
    assert_eq!(edited["notes"], "window seat");

    let page = client
        .ok(json!({ "op": "list", "requester_id": "dana", "page": 2, "limit": 2 }))
        .await;
    assert_eq!(page["total"], 3);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["items"][0]["id"], ids[2].as_str());

    client.ok(json!({ "op": "cancel", "id": ids[1] })).await;
    let upcoming = client
        .ok(json!({ "op": "upcoming", "requester_id": "dana" }))
        .await;
    assert_eq!(upcoming["total"], 2);
    let history = client
        .ok(json!({ "op": "history", "requester_id": "dana" }))
        .await;
    assert_eq!(history["items"][0]["id"], ids[1].as_str());

    let reply = client
        .call(json!({ "op": "list", "requester_id": "dana", "page": 0 }))
        .await;
    assert_eq!(reply["error"]["kind"], "validation_error");
}

#[tokio::test]
async fn series_can_be_shortened_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let rid = desk_with_hours(&mut client).await;

    let outcome = client
        .ok(json!({
            "op": "recurring",
            "resource_id": rid,
            "requester_id": "erin",
            "first_date": "2030-01-07",
            "end_date": "2030-01-28",
            "pattern": "WEEKLY",
            "time_range": { "start": "15:00:00", "end": "16:00:00" },
        }))
        .await;
    let series_id = outcome["series_id"].as_str().unwrap().to_string();

    let change = client
        .ok(json!({
            "op": "update_series", "id": series_id,
            "end_date": "2030-01-14", "reason": "1:1",
        }))
        .await;
    assert_eq!(change["cancelled"], 2);
    assert_eq!(change["series"]["end_date"], "2030-01-14");
    assert_eq!(change["series"]["reason"], "1:1");
}

#[tokio::test]
async fn watcher_receives_pushed_changes() {
    let addr = start_test_server().await;
    let mut admin = Client::connect(addr).await;
    let rid = desk_with_hours(&mut admin).await;

    let mut watcher = Client::connect(addr).await;
    watcher.ok(json!({ "op": "watch", "resource_id": rid })).await;

    let held = admin
        .ok(json!({
            "op": "hold", "resource_id": rid, "requester_id": "alice",
            "start": at(14), "end": at(15),
        }))
        .await;

    let pushed = watcher.next_line().await;
    assert_eq!(pushed["event"]["resource_id"], rid.as_str());
    assert_eq!(pushed["event"]["change"]["reservation_placed"]["reservation"]["id"], held["id"]);

    // after unwatch, only direct replies arrive
    watcher.ok(json!({ "op": "unwatch", "resource_id": rid })).await;
    admin.ok(json!({ "op": "cancel", "id": held["id"] })).await;
    let reply = watcher.call(json!({ "op": "resources" })).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn watching_unknown_resource_fails() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let reply = client
        .call(json!({ "op": "watch", "resource_id": Ulid::new().to_string() }))
        .await;
    assert_eq!(reply["error"]["kind"], "not_found");
}
