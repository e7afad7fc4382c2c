use crate::events::Event;
use crate::worker::{ControlResponse, WorkerController};
use std::sync::Arc;
use tokio::sync::broadcast;
use zbus::object_server::SignalEmitter;
use zbus::{interface, Connection};

pub const BUS_NAME: &str = "org.facetrack.Recognition1";
pub const OBJECT_PATH: &str = "/org/facetrack/Recognition1";

/// D-Bus control surface of the recognition worker.
///
/// Bus name: org.facetrack.Recognition1
/// Object path: /org/facetrack/Recognition1
pub struct RecognitionService {
    controller: Arc<WorkerController>,
}

impl RecognitionService {
    pub fn new(controller: Arc<WorkerController>) -> Self {
        Self { controller }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

#[interface(name = "org.facetrack.Recognition1")]
impl RecognitionService {
    /// Start recognition. Pass empty strings for continuous operation, or
    /// both times as `HH:MM` for a daily window.
    async fn start(&self, start_time: &str, end_time: &str) -> zbus::fdo::Result<String> {
        tracing::info!(start_time, end_time, "start requested");
        let result = self
            .controller
            .start(non_empty(start_time), non_empty(end_time));
        if let Err(e) = &result {
            tracing::warn!(error = %e, "start rejected");
        }
        to_json(&ControlResponse::from_start(&result))
    }

    /// Stop recognition, waiting briefly for the worker to exit.
    async fn stop(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop requested");
        let controller = self.controller.clone();
        let result = tokio::task::spawn_blocking(move || controller.stop())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("stop task failed: {e}")))?;
        to_json(&ControlResponse::from_stop(&result))
    }

    /// Current `{running, scheduled}` state.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.controller.status())
    }

    /// Identities whose repeat visits are currently suppressed.
    async fn cached_identities(&self) -> zbus::fdo::Result<String> {
        let entries: Vec<serde_json::Value> = self
            .controller
            .cached_identities()
            .into_iter()
            .map(|(id, remaining)| {
                serde_json::json!({ "identity_id": id, "expires_in_secs": remaining.as_secs() })
            })
            .collect();
        to_json(&entries)
    }

    #[zbus(signal)]
    async fn status_update(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn new_recognition(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;
}

/// Re-emit worker events as D-Bus signals until the bus closes.
pub async fn forward_events(conn: Connection, mut events: broadcast::Receiver<Event>) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "cannot create signal emitter; events will not be forwarded");
            return;
        }
    };

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let payload = event.payload().to_string();
        let sent = match &event {
            Event::Status(_) => RecognitionService::status_update(&emitter, &payload).await,
            Event::Recognition(_) => RecognitionService::new_recognition(&emitter, &payload).await,
        };
        if let Err(e) = sent {
            tracing::warn!(topic = event.topic(), error = %e, "failed to emit signal");
        }
    }
}
