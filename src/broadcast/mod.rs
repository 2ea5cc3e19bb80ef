use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Stdout,
    Stderr,
    System,
}

/// One line delivered to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub data: String,
}

impl LogEvent {
    pub fn system(data: impl Into<String>) -> Self {
        Self {
            kind: LogKind::System,
            data: data.into(),
        }
    }
}

pub type SubscriberId = u64;

type Room = HashMap<SubscriberId, UnboundedSender<LogEvent>>;

/// Live fan-out of log lines to subscribers grouped by sandbox id.
///
/// Delivery is best-effort with no replay: late joiners catch up through
/// the log store instead.
#[derive(Default)]
pub struct Broadcaster {
    rooms: Mutex<HashMap<String, Room>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a connection; one id may join many rooms.
    pub fn new_subscriber(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add a subscriber to a sandbox's room and greet it on the same channel.
    pub fn subscribe(
        &self,
        sandbox_id: &str,
        subscriber: SubscriberId,
        sender: UnboundedSender<LogEvent>,
    ) {
        let greeting = LogEvent::system(format!(
            "Connected to log stream for sandbox {}",
            sandbox_id
        ));
        let _ = sender.send(greeting);

        if let Ok(mut rooms) = self.rooms.lock() {
            rooms
                .entry(sandbox_id.to_string())
                .or_default()
                .insert(subscriber, sender);
        }
        debug!(sandbox_id = %sandbox_id, subscriber, "Subscriber joined");
    }

    pub fn unsubscribe(&self, sandbox_id: &str, subscriber: SubscriberId) -> bool {
        let Ok(mut rooms) = self.rooms.lock() else {
            return false;
        };
        let removed = rooms
            .get_mut(sandbox_id)
            .map(|room| room.remove(&subscriber).is_some())
            .unwrap_or(false);
        if rooms.get(sandbox_id).is_some_and(|room| room.is_empty()) {
            rooms.remove(sandbox_id);
        }
        removed
    }

    /// Drop a subscriber from every room it joined.
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) {
        if let Ok(mut rooms) = self.rooms.lock() {
            rooms.retain(|_, room| {
                room.remove(&subscriber);
                !room.is_empty()
            });
        }
    }

    /// Send each non-blank line of `chunk` to everyone in the sandbox's room.
    pub fn publish(&self, sandbox_id: &str, kind: LogKind, chunk: &str) {
        let Ok(mut rooms) = self.rooms.lock() else {
            return;
        };
        let Some(room) = rooms.get_mut(sandbox_id) else {
            return;
        };

        for line in chunk.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }
            let event = LogEvent {
                kind,
                data: line.to_string(),
            };
            room.retain(|_, sender| sender.send(event.clone()).is_ok());
        }

        if room.is_empty() {
            rooms.remove(sandbox_id);
        }
    }

    pub fn system(&self, sandbox_id: &str, message: &str) {
        self.publish(sandbox_id, LogKind::System, message);
    }

    pub fn subscriber_count(&self, sandbox_id: &str) -> usize {
        self.rooms
            .lock()
            .ok()
            .and_then(|rooms| rooms.get(sandbox_id).map(|room| room.len()))
            .unwrap_or(0)
    }
}
