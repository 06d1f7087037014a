use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use ulid::Ulid;

use parkd::engine::Engine;
use parkd::model::{Slot, User, UserId};
use parkd::notify::BroadcastHub;
use parkd::store::MemoryStore;
use parkd::wire;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Test infrastructure ──────────────────────────────────────

/// Two slots (s-1, s-2) and one active user, served on an ephemeral port.
async fn start_test_server() -> (SocketAddr, Arc<MemoryStore>, UserId) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let store = Arc::new(MemoryStore::new());
    store.provision_slot(Slot::new(1, "s-1"));
    store.provision_slot(Slot::new(2, "s-2"));
    let uid = Ulid::new();
    store.provision_user(User::new(uid, "driver", "KA01AB1234"));

    let hub = Arc::new(BroadcastHub::new());
    let engine = Arc::new(Engine::new(store.clone(), hub));
    engine.bootstrap().await.unwrap();

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

    (addr, store, uid)
}

/// Open a WebSocket and identify with the given role.
async fn connect(addr: SocketAddr, role: &str) -> WsClient {
    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws.send(Message::Text(
        json!({ "type": "hello", "role": role }).to_string(),
    ))
    .await
    .unwrap();
    ws
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next JSON text frame, or None on timeout/close.
async fn recv_json(ws: &mut WsClient, wait: Duration) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(wait, ws.next()).await.ok()??.ok()?;
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

fn book_frame(uid: UserId, slot_number: u32) -> Value {
    json!({
        "type": "book",
        "userId": uid.to_string(),
        "slotNumber": slot_number,
        "bookingStart": 1_700_000_000_000i64,
        "bookingEnd": 1_700_003_600_000i64,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn observer_gets_snapshot_on_connect() {
    let (addr, _store, _uid) = start_test_server().await;
    let mut observer = connect(addr, "observer").await;

    let snapshot = recv_json(&mut observer, Duration::from_secs(2))
        .await
        .expect("no snapshot frame");
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["slots"]["s-1"]["status"], "available");
    assert_eq!(snapshot["slots"]["s-2"]["status"], "available");
}

#[tokio::test]
async fn booking_and_sensor_confirmation_reach_observers() {
    let (addr, _store, uid) = start_test_server().await;

    let mut observer = connect(addr, "observer").await;
    recv_json(&mut observer, Duration::from_secs(2))
        .await
        .expect("no snapshot frame");

    let mut user = connect(addr, "user").await;
    send_json(&mut user, book_frame(uid, 1)).await;
    let reply = recv_json(&mut user, Duration::from_secs(2))
        .await
        .expect("no booking reply");
    assert_eq!(reply["status"], "success");
    assert_eq!(reply["data"]["slot"]["status"], "occupied");

    let change = recv_json(&mut observer, Duration::from_secs(2))
        .await
        .expect("no broadcast for the booking");
    assert_eq!(change["type"], "status_change");
    assert_eq!(change["slotNumber"], 1);
    assert_eq!(change["previousStatus"], "available");
    assert_eq!(change["currentStatus"], "occupied");

    let mut sensor = connect(addr, "sensor").await;
    send_json(&mut sensor, json!({ "sensorId": "s-1", "occupied": true })).await;

    let change = recv_json(&mut observer, Duration::from_secs(2))
        .await
        .expect("no broadcast for the parking confirmation");
    assert_eq!(change["previousStatus"], "occupied");
    assert_eq!(change["currentStatus"], "parked");
}

#[tokio::test]
async fn unbooked_occupancy_rejected_on_sensor_socket_only() {
    let (addr, store, _uid) = start_test_server().await;

    let mut observer = connect(addr, "observer").await;
    recv_json(&mut observer, Duration::from_secs(2))
        .await
        .expect("no snapshot frame");

    let mut sensor = connect(addr, "sensor").await;
    send_json(&mut sensor, json!({ "sensorId": "s-2", "occupied": true })).await;

    let reject = recv_json(&mut sensor, Duration::from_secs(2))
        .await
        .expect("no reject frame");
    assert_eq!(reject["type"], "PARKING_ERROR");

    // Nothing was written and nothing was broadcast.
    assert!(
        recv_json(&mut observer, Duration::from_millis(300))
            .await
            .is_none()
    );
    use parkd::store::RecordStore;
    let slot = store.slot_by_number(2).await.unwrap().unwrap();
    assert_eq!(slot.status.to_string(), "available");
}

#[tokio::test]
async fn malformed_sensor_frame_is_dropped_not_fatal() {
    let (addr, _store, _uid) = start_test_server().await;

    let mut sensor = connect(addr, "sensor").await;
    send_json(&mut sensor, json!({ "occupied": true })).await;
    sensor.send(Message::Text("not json".into())).await.unwrap();

    // The connection survives: the next well-formed frame still gets its
    // reject back.
    send_json(&mut sensor, json!({ "sensorId": "s-1", "occupied": true })).await;
    let reject = recv_json(&mut sensor, Duration::from_secs(2))
        .await
        .expect("sensor socket died on malformed input");
    assert_eq!(reject["type"], "PARKING_ERROR");
}

#[tokio::test]
async fn book_query_release_roundtrip() {
    let (addr, _store, uid) = start_test_server().await;
    let mut user = connect(addr, "user").await;

    send_json(&mut user, book_frame(uid, 1)).await;
    let reply = recv_json(&mut user, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply["status"], "success");

    // A second booking by the same user names the held slot.
    send_json(&mut user, book_frame(uid, 2)).await;
    let reply = recv_json(&mut user, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply["status"], "error");
    assert!(
        reply["message"]
            .as_str()
            .unwrap()
            .contains("already have a booked slot")
    );

    send_json(&mut user, json!({ "type": "available_slots" })).await;
    let reply = recv_json(&mut user, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply["status"], "success");
    let available = reply["data"]["slots"].as_array().unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0]["number"], 2);

    send_json(
        &mut user,
        json!({ "type": "release", "userId": uid.to_string(), "slotNumber": 1 }),
    )
    .await;
    let reply = recv_json(&mut user, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply["status"], "success");
    assert_eq!(reply["data"]["slot"]["status"], "available");

    send_json(&mut user, json!({ "type": "slots" })).await;
    let reply = recv_json(&mut user, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply["data"]["slots"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn release_by_non_booker_is_refused() {
    let (addr, store, uid) = start_test_server().await;
    let intruder = Ulid::new();
    store.provision_user(User::new(intruder, "intruder", "MH12XY999"));

    let mut user = connect(addr, "user").await;
    send_json(&mut user, book_frame(uid, 1)).await;
    recv_json(&mut user, Duration::from_secs(2)).await.unwrap();

    let mut other = connect(addr, "user").await;
    send_json(
        &mut other,
        json!({ "type": "release", "userId": intruder.to_string(), "slotNumber": 1 }),
    )
    .await;
    let reply = recv_json(&mut other, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply["status"], "error");
}

#[tokio::test]
async fn bad_hello_is_refused() {
    let (addr, _store, _uid) = start_test_server().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws.send(Message::Text(json!({ "role": "butler" }).to_string()))
        .await
        .unwrap();

    let reply = recv_json(&mut ws, Duration::from_secs(2))
        .await
        .expect("no error reply");
    assert_eq!(reply["status"], "error");

    // Server closes after the reply.
    assert!(recv_json(&mut ws, Duration::from_secs(2)).await.is_none());
}
