//! Teraleech IPC
//!
//! Event bus carrying inbound Telegram traffic from the adapter to the core

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: i64,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "command")]
    Command { name: String, args: Vec<String> },

    #[serde(rename = "callback")]
    Callback { query_id: String, data: String },
}

impl MessageKind {
    /// Splits `/name@bot arg1 arg2` into a command, anything else into text.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if let Some(rest) = trimmed.strip_prefix('/') {
            let mut parts = rest.split_whitespace();
            if let Some(head) = parts.next() {
                let name = head.split('@').next().unwrap_or(head).to_lowercase();
                if !name.is_empty() {
                    return MessageKind::Command {
                        name,
                        args: parts.map(str::to_string).collect(),
                    };
                }
            }
        }
        MessageKind::Text {
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub trace_id: String,
    pub chat_id: i64,
    pub message_id: Option<i64>,
    pub from: Option<Sender>,
    pub kind: MessageKind,
}

impl Envelope {
    pub fn new(chat_id: i64, kind: MessageKind) -> Self {
        Self {
            trace_id: generate_trace_id(),
            chat_id,
            message_id: None,
            from: None,
            kind,
        }
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_sender(mut self, sender: Sender) -> Self {
        self.from = Some(sender);
        self
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { inbound: inbound_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_different_for_each_envelope() {
        let env1 = Envelope::new(1, MessageKind::from_text("hello"));
        let env2 = Envelope::new(1, MessageKind::from_text("hello"));
        assert!(env1.trace_id.starts_with("trace-"));
        assert_ne!(env1.trace_id, env2.trace_id);
    }

    #[test]
    fn command_text_is_split_into_name_and_args() {
        match MessageKind::from_text("/setdump@leech_bot -1001234567890") {
            MessageKind::Command { name, args } => {
                assert_eq!(name, "setdump");
                assert_eq!(args, vec!["-1001234567890".to_string()]);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn plain_text_stays_text() {
        assert!(matches!(
            MessageKind::from_text("https://terabox.com/s/abc123"),
            MessageKind::Text { .. }
        ));
        assert!(matches!(MessageKind::from_text("/"), MessageKind::Text { .. }));
    }

    #[tokio::test]
    async fn published_envelope_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let env = Envelope::new(42, MessageKind::from_text("hi")).with_message_id(7);
        bus.publish(env).expect("publish");
        let received = rx.recv().await.expect("recv");
        assert_eq!(received.chat_id, 42);
        assert_eq!(received.message_id, Some(7));
    }

    #[test]
    fn envelope_serializes_tagged_kind() {
        let env = Envelope::new(
            5,
            MessageKind::Callback {
                query_id: "q".to_string(),
                data: "settings_close".to_string(),
            },
        );
        let json = env.to_json().expect("json");
        assert!(json.contains(r#""type":"callback""#));
    }
}
