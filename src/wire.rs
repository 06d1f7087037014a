//! WebSocket surface. Three client roles share one listener: sensors push
//! occupancy frames, observers (dashboards) receive the mirror snapshot
//! and every status-changed broadcast, users drive booking and release.
//! All roles are thin adapters over the one engine entry point.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::warn;

use crate::engine::Engine;
use crate::model::{Ms, Outcome, UserId, Window};
use crate::normalize;
use crate::observability;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    Sensor,
    Observer,
    User,
}

/// First frame on every connection: `{"type":"hello","role":"..."}`.
#[derive(Debug, Deserialize)]
struct Hello {
    role: Role,
}

/// Request frames accepted on a user connection. Caller identity is
/// attached per frame; token verification happens upstream of this layer.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserFrame {
    #[serde(rename_all = "camelCase")]
    Book {
        user_id: UserId,
        slot_number: u32,
        booking_start: Ms,
        booking_end: Ms,
    },
    #[serde(rename_all = "camelCase")]
    Release { user_id: UserId, slot_number: u32 },
    Slots,
    AvailableSlots,
}

fn success(data: serde_json::Value) -> serde_json::Value {
    json!({ "status": "success", "data": data })
}

fn error_reply(message: &str) -> serde_json::Value {
    json!({ "status": "error", "message": message })
}

/// Serve one accepted TCP connection for its whole lifetime.
pub async fn process_connection(stream: TcpStream, engine: Arc<Engine>) -> Result<(), WsError> {
    let mut ws = accept_async(stream).await?;

    let hello = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e),
        }
    };
    let role = match serde_json::from_str::<Hello>(&hello) {
        Ok(h) => h.role,
        Err(e) => {
            warn!("rejecting connection, bad hello frame: {e}");
            ws.send(Message::Text(
                error_reply("expected hello frame with a known role").to_string(),
            ))
            .await?;
            ws.close(None).await?;
            return Ok(());
        }
    };

    match role {
        Role::Sensor => sensor_loop(ws, engine).await,
        Role::Observer => observer_loop(ws, engine).await,
        Role::User => user_loop(ws, engine).await,
    }
}

/// Each frame is one occupancy reading. Rejects go back on this socket
/// only; malformed frames are logged and dropped, never forwarded.
async fn sensor_loop(
    mut ws: WebSocketStream<TcpStream>,
    engine: Arc<Engine>,
) -> Result<(), WsError> {
    while let Some(msg) = ws.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let event = match normalize::from_frame(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping sensor frame: {e}");
                metrics::counter!(observability::DROPPED_EVENTS_TOTAL).increment(1);
                continue;
            }
        };
        match engine.apply(event).await {
            Ok(Outcome::Rejected(reject)) => {
                ws.send(Message::Text(reject.payload().to_string())).await?;
            }
            Ok(_) => {}
            Err(e) => tracing::error!("apply failed: {e}"),
        }
    }
    Ok(())
}

/// Initial snapshot, then every broadcast until the peer goes away.
/// Best-effort: a lagged observer just misses notifications.
async fn observer_loop(
    ws: WebSocketStream<TcpStream>,
    engine: Arc<Engine>,
) -> Result<(), WsError> {
    let (mut sink, mut stream) = ws.split();

    // Subscribe before snapshotting so no transition falls in the gap.
    let mut rx = engine.hub().subscribe();
    let snapshot = json!({ "type": "snapshot", "slots": engine.hub().snapshot() });
    sink.send(Message::Text(snapshot.to_string())).await?;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(transition) => {
                    sink.send(Message::Text(transition.payload().to_string())).await?;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("observer lagging, {missed} notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    Ok(())
}

/// Request/response booking surface. Precondition violations come back as
/// explicit rejection reasons; they never corrupt shared state.
async fn user_loop(mut ws: WebSocketStream<TcpStream>, engine: Arc<Engine>) -> Result<(), WsError> {
    while let Some(msg) = ws.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<UserFrame>(&text) {
            Err(e) => error_reply(&format!("bad request: {e}")),
            Ok(UserFrame::Book {
                user_id,
                slot_number,
                booking_start,
                booking_end,
            }) => {
                let window = Window {
                    start: booking_start,
                    end: booking_end,
                };
                match engine.book(user_id, slot_number, window).await {
                    Ok(slot) => success(json!({ "slot": slot })),
                    Err(e) => error_reply(&e.to_string()),
                }
            }
            Ok(UserFrame::Release {
                user_id,
                slot_number,
            }) => match engine.release(user_id, slot_number).await {
                Ok(slot) => success(json!({ "slot": slot })),
                Err(e) => error_reply(&e.to_string()),
            },
            Ok(UserFrame::Slots) => match engine.list_slots().await {
                Ok(slots) => success(json!({ "slots": slots })),
                Err(e) => error_reply(&e.to_string()),
            },
            Ok(UserFrame::AvailableSlots) => match engine.available_slots().await {
                Ok(slots) => success(json!({ "slots": slots })),
                Err(e) => error_reply(&e.to_string()),
            },
        };
        ws.send(Message::Text(reply.to_string())).await?;
    }
    Ok(())
}
