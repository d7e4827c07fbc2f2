//! Shared notes buffer.
//!
//! Every subscriber sees the same single string. A subscriber replaces it
//! with an `update`; the hub answers every subscriber (the sender too) with
//! a `sync` carrying the new text and the originating client id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::errors::ProtocolError;

pub const NOTES_PATH: &str = "/notes";

/// Syncs queued per subscriber before it counts as stalled and is dropped.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Wire messages on the notes channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotesMessage {
    /// Server -> client: the full current text.
    #[serde(rename = "sync")]
    Sync {
        text: String,
        /// Client id of the update that produced this text. Absent on the
        /// initial sync sent to a new subscriber.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Client -> server: replace the text.
    #[serde(rename = "update")]
    Update { client_id: String, text: String },
}

impl NotesMessage {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedNotes(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Both variants are plain strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

struct NotesState {
    text: String,
    subscribers: HashMap<u64, mpsc::Sender<String>>,
}

/// Process-lifetime notes state plus its subscribers.
pub struct NotesHub {
    state: Mutex<NotesState>,
    next_subscriber: AtomicU64,
}

impl Default for NotesHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotesHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NotesState {
                text: String::new(),
                subscribers: HashMap::new(),
            }),
            next_subscriber: AtomicU64::new(1),
        }
    }

    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Register a subscriber. Its channel already holds the initial sync.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let mut state = self.state.lock();
        let initial = NotesMessage::Sync {
            text: state.text.clone(),
            source: None,
        };
        if tx.try_send(initial.to_json()).is_ok() {
            state.subscribers.insert(id, tx);
        }
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.remove(&id);
    }

    /// Replace the text and broadcast it. Returns how many subscribers the
    /// sync was queued for. Subscribers whose channel is gone or full are
    /// dropped; a full queue means the peer stopped reading.
    pub fn update(&self, client_id: &str, text: String) -> usize {
        let mut state = self.state.lock();
        let payload = NotesMessage::Sync {
            text: text.clone(),
            source: Some(client_id.to_string()),
        }
        .to_json();
        state.text = text;
        state.subscribers.retain(|id, tx| match tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = *id, "Dropping stalled notes subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        state.subscribers.len()
    }

    /// Handle one raw text frame from a subscriber.
    pub fn apply(&self, raw: &str) -> Result<(), ProtocolError> {
        match NotesMessage::parse(raw)? {
            NotesMessage::Update { client_id, text } => {
                let delivered = self.update(&client_id, text);
                debug!(client_id = %client_id, delivered, "Notes updated");
            }
            NotesMessage::Sync { .. } => {
                debug!("Ignoring sync sent by a client");
            }
        }
        Ok(())
    }

    /// Serve one notes connection until either side goes away.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket, connection_id: &str) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (subscriber, mut outbound) = self.subscribe();

        let writer = async {
            while let Some(payload) = outbound.recv().await {
                if ws_sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
        };

        let reader = async {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = self.apply(&text) {
                            debug!(connection_id, error = %e, "Ignoring notes message");
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(connection_id, error = %e, "Notes socket error");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
        }

        self.unsubscribe(subscriber);
        info!(
            connection_id,
            subscribers = self.subscriber_count(),
            "Notes subscriber left"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> NotesMessage {
        NotesMessage::parse(raw).unwrap()
    }

    #[test]
    fn wire_format_uses_type_tag() {
        let sync = NotesMessage::Sync {
            text: "hi".into(),
            source: Some("a".into()),
        };
        let value: serde_json::Value = serde_json::from_str(&sync.to_json()).unwrap();
        assert_eq!(value["type"], "sync");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["source"], "a");

        let initial = NotesMessage::Sync {
            text: String::new(),
            source: None,
        };
        assert_eq!(initial.to_json(), r#"{"type":"sync","text":""}"#);

        assert_eq!(
            decode(r#"{"type":"update","client_id":"c1","text":"x"}"#),
            NotesMessage::Update {
                client_id: "c1".into(),
                text: "x".into()
            }
        );
    }

    #[test]
    fn new_subscriber_gets_current_text() {
        let hub = NotesHub::new();
        hub.update("a", "hello".into());

        let (_, mut rx) = hub.subscribe();
        assert_eq!(
            decode(&rx.try_recv().unwrap()),
            NotesMessage::Sync {
                text: "hello".into(),
                source: None
            }
        );
    }

    #[test]
    fn update_reaches_every_subscriber_including_sender() {
        let hub = NotesHub::new();
        let (_, mut a) = hub.subscribe();
        let (_, mut b) = hub.subscribe();
        a.try_recv().unwrap();
        b.try_recv().unwrap();

        hub.apply(r#"{"type":"update","client_id":"a","text":"shared"}"#)
            .unwrap();

        for rx in [&mut a, &mut b] {
            assert_eq!(
                decode(&rx.try_recv().unwrap()),
                NotesMessage::Sync {
                    text: "shared".into(),
                    source: Some("a".into())
                }
            );
        }
        assert_eq!(hub.text(), "shared");
    }

    #[test]
    fn dead_subscribers_are_dropped_without_stopping_broadcast() {
        let hub = NotesHub::new();
        let (_, gone) = hub.subscribe();
        let (_, mut alive) = hub.subscribe();
        drop(gone);
        alive.try_recv().unwrap();

        assert_eq!(hub.update("x", "after".into()), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(alive.try_recv().unwrap().contains("after"));
    }

    #[test]
    fn bad_and_unknown_messages_leave_state_alone() {
        let hub = NotesHub::new();
        hub.update("a", "keep".into());
        let (_, mut rx) = hub.subscribe();
        rx.try_recv().unwrap();

        assert!(matches!(
            hub.apply("not json"),
            Err(ProtocolError::MalformedNotes(_))
        ));
        assert!(hub.apply(r#"{"type":"delete","text":""}"#).is_err());
        assert!(hub.apply(r#"{"type":"update","text":"no id"}"#).is_err());
        hub.apply(r#"{"type":"sync","text":"client-side sync"}"#)
            .unwrap();

        assert_eq!(hub.text(), "keep");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stalled_subscriber_is_dropped_once_its_queue_fills() {
        let hub = NotesHub::new();
        let (_, stalled) = hub.subscribe();
        let (_, mut reader) = hub.subscribe();

        let big = "x".repeat(100 * 1024);
        for _ in 0..SUBSCRIBER_QUEUE_DEPTH {
            hub.update("a", big.clone());
            while reader.try_recv().is_ok() {}
        }

        assert_eq!(hub.subscriber_count(), 1);
        assert!(stalled.len() <= SUBSCRIBER_QUEUE_DEPTH);

        hub.update("a", "after".into());
        assert!(reader.try_recv().unwrap().contains("after"));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = NotesHub::new();
        let (id, mut rx) = hub.subscribe();
        rx.try_recv().unwrap();
        hub.unsubscribe(id);
        hub.update("a", "later".into());
        assert_eq!(hub.subscriber_count(), 0);
        assert!(rx.try_recv().is_err());
    }
}
