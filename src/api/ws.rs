use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, Instrument};

use crate::api::AppState;
use crate::broadcast::{LogEvent, SubscriberId};
use crate::tenant::validate_sandbox_id;

/// Frames a client may send.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum ClientFrame {
    JoinSandbox {
        #[serde(rename = "sandboxId")]
        sandbox_id: String,
    },
    LeaveSandbox {
        #[serde(rename = "sandboxId")]
        sandbox_id: String,
    },
}

#[derive(Serialize)]
struct LogFrame<'a> {
    event: &'static str,
    #[serde(flatten)]
    log: &'a LogEvent,
}

impl<'a> LogFrame<'a> {
    fn new(log: &'a LogEvent) -> Self {
        Self { event: "log", log }
    }
}

pub async fn log_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let subscriber = state.broadcaster.new_subscriber();
    let span = tracing::info_span!("log_ws", subscriber);

    async move {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<LogEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Ok(text) = serde_json::to_string(&LogFrame::new(&event)) else {
                    continue;
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = receiver.next().await {
            let Ok(msg) = msg else { break };
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::JoinSandbox { sandbox_id }) => {
                        join(&state, subscriber, &sandbox_id, &tx).await;
                    }
                    Ok(ClientFrame::LeaveSandbox { sandbox_id }) => {
                        state.broadcaster.unsubscribe(&sandbox_id, subscriber);
                        debug!(sandbox_id = %sandbox_id, "Left sandbox room");
                    }
                    Err(e) => {
                        let _ = tx.send(LogEvent::system(format!("Invalid message: {}", e)));
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        state.broadcaster.unsubscribe_all(subscriber);
        writer.abort();
        debug!("Log stream closed");
    }
    .instrument(span)
    .await
}

/// Admit a connection to a sandbox's room if the sandbox exists.
async fn join(
    state: &AppState,
    subscriber: SubscriberId,
    sandbox_id: &str,
    tx: &mpsc::UnboundedSender<LogEvent>,
) -> bool {
    if let Err(e) = validate_sandbox_id(sandbox_id) {
        let _ = tx.send(LogEvent::system(e.to_string()));
        return false;
    }

    let known = state.registry.find_sandbox(sandbox_id).await.is_some()
        || state
            .engine
            .container_exists(sandbox_id)
            .await
            .unwrap_or(false);

    if !known {
        let _ = tx.send(LogEvent::system(format!("Sandbox {} not found", sandbox_id)));
        return false;
    }

    state.broadcaster.subscribe(sandbox_id, subscriber, tx.clone());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_app;
    use crate::broadcast::LogKind;

    #[test]
    fn test_client_frames() {
        let join: ClientFrame =
            serde_json::from_str(r#"{"event":"join-sandbox","sandboxId":"sb-1"}"#).unwrap();
        assert_eq!(
            join,
            ClientFrame::JoinSandbox {
                sandbox_id: "sb-1".into()
            }
        );
        assert!(serde_json::from_str::<ClientFrame>(r#"{"event":"shout"}"#).is_err());
    }

    #[test]
    fn test_log_frame_shape() {
        let event = LogEvent {
            kind: LogKind::Stderr,
            data: "boom".into(),
        };
        let json = serde_json::to_value(LogFrame::new(&event)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "log", "type": "stderr", "data": "boom"})
        );
    }

    #[tokio::test]
    async fn test_join_requires_known_sandbox() {
        let app = test_app(None);
        let state = &app.state;
        state.registry.create_tenant("t1", "basic").await.unwrap();
        let sandbox = state.registry.create_sandbox("t1", "u1").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = state.broadcaster.new_subscriber();

        assert!(!join(state, subscriber, "ghost", &tx).await);
        assert_eq!(
            rx.try_recv().unwrap(),
            LogEvent::system("Sandbox ghost not found")
        );
        assert_eq!(state.broadcaster.subscriber_count("ghost"), 0);

        let calls_before = app.engine.calls().len();
        assert!(!join(state, subscriber, "--help", &tx).await);
        assert!(rx.try_recv().unwrap().data.starts_with("sandboxId must start with"));
        assert_eq!(app.engine.calls().len(), calls_before);

        assert!(join(state, subscriber, &sandbox.id, &tx).await);
        assert_eq!(
            rx.try_recv().unwrap().data,
            format!("Connected to log stream for sandbox {}", sandbox.id)
        );
        assert_eq!(state.broadcaster.subscriber_count(&sandbox.id), 1);
    }
}
