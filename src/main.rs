use std::sync::Arc;

use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use parkd::engine::Engine;
use parkd::model::{Slot, User, UserId};
use parkd::notify::BroadcastHub;
use parkd::store::MemoryStore;
use parkd::{mqtt, observability, wire};

/// Slot and user records provisioned out-of-band, loaded at startup.
#[derive(Debug, Deserialize)]
struct Provisioning {
    #[serde(default)]
    slots: Vec<SlotSeed>,
    #[serde(default)]
    users: Vec<UserSeed>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlotSeed {
    number: u32,
    sensor_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserSeed {
    id: UserId,
    username: String,
    vehicle_number: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("PARKD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    observability::init(metrics_port);

    let port = std::env::var("PARKD_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("PARKD_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let max_connections: usize = std::env::var("PARKD_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256);

    let store = Arc::new(MemoryStore::new());
    if let Ok(path) = std::env::var("PARKD_PROVISION_FILE") {
        let raw = std::fs::read_to_string(&path)?;
        let provisioning: Provisioning = serde_json::from_str(&raw)?;
        for seed in provisioning.slots {
            store.provision_slot(Slot::new(seed.number, seed.sensor_id));
        }
        for seed in provisioning.users {
            let mut user = User::new(seed.id, seed.username, seed.vehicle_number);
            user.active = seed.active;
            store.provision_user(user);
        }
        info!("provisioned {} slots from {path}", store.slot_count());
    }

    let hub = Arc::new(BroadcastHub::new());
    let engine = Arc::new(Engine::new(store, hub));
    engine.bootstrap().await?;

    if let Some(config) = mqtt::MqttConfig::from_env() {
        let mqtt_engine = engine.clone();
        tokio::spawn(async move {
            mqtt::run(mqtt_engine, config).await;
        });
    } else {
        info!("mqtt ingest disabled (PARKD_MQTT_HOST not set)");
    }

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("parkd listening on {addr}");
    info!("  max_connections: {max_connections}");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight
    // connections. In-flight reconciliations still complete and broadcast.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let conn_engine = engine.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, conn_engine).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("parkd stopped");
    Ok(())
}
