//! Canonical message record shared by the store, journal and feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Sender label used when the transport reports no node number.
pub const UNKNOWN_SENDER: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Received,
    Sent,
    SendFailed,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Received => "received",
            DeliveryState::Sent => "sent",
            DeliveryState::SendFailed => "send_failed",
        }
    }
}

/// One unit of mesh text traffic, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub direction: Direction,
    pub body: String,
    pub delivery_state: DeliveryState,
}

impl Message {
    pub fn inbound(id: String, timestamp: DateTime<Utc>, sender: String, body: String) -> Self {
        Self {
            id,
            timestamp,
            sender,
            direction: Direction::Inbound,
            body,
            delivery_state: DeliveryState::Received,
        }
    }

    /// Outbound records start optimistic (`sent`) and get corrected on failure.
    pub fn outbound(timestamp: DateTime<Utc>, sender: String, body: String) -> Self {
        Self {
            id: outbound_message_id(),
            timestamp,
            sender,
            direction: Direction::Outbound,
            body,
            delivery_state: DeliveryState::Sent,
        }
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }
}

/// `!xxxxxxxx`, the usual Meshtastic rendering of a node number.
pub fn format_node_id(node_num: u32) -> String {
    format!("!{:08x}", node_num)
}

/// Id for an event that carries the radio's own packet id.
///
/// Packet ids are only unique per originating node, so the sender is part of
/// the key. An absent sender is encoded as zero.
pub fn packet_message_id(from: Option<u32>, packet_id: u32) -> String {
    format!("pkt-{:08x}-{:08x}", from.unwrap_or(0), packet_id)
}

/// Deterministic id for events without a packet id (console text lines).
///
/// `source_secs` is the radio's receive time when the node stamped one and the
/// local arrival time otherwise. Console lines never carry a radio time, so the
/// same line delivered again in a later second (for instance replayed after a
/// reconnect) hashes to a new id and is stored a second time. Only packets with
/// a vendor id are deduplicated across redelivery.
pub fn content_message_id(sender: &str, source_secs: i64, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update([0x1f]);
    hasher.update(source_secs.to_be_bytes());
    hasher.update([0x1f]);
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(18);
    id.push_str("h-");
    for b in digest.iter().take(8) {
        id.push_str(&format!("{:02x}", b));
    }
    id
}

pub fn outbound_message_id() -> String {
    format!("out-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_are_scoped_by_sender() {
        assert_eq!(packet_message_id(Some(0xdeadbeef), 7), "pkt-deadbeef-00000007");
        assert_ne!(packet_message_id(Some(1), 7), packet_message_id(Some(2), 7));
        assert_eq!(packet_message_id(None, 1), "pkt-00000000-00000001");
    }

    #[test]
    fn content_ids_are_stable_and_input_sensitive() {
        let a = content_message_id("!00000001", 1_700_000_000, "hello");
        let b = content_message_id("!00000001", 1_700_000_000, "hello");
        let c = content_message_id("!00000001", 1_700_000_001, "hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("h-"));
        assert_eq!(a.len(), 18);
    }

    #[test]
    fn outbound_records_start_as_sent() {
        let m = Message::outbound(Utc::now(), "You".into(), "ping".into());
        assert!(m.id.starts_with("out-"));
        assert!(m.is_outbound());
        assert_eq!(m.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn node_ids_render_as_bang_hex() {
        assert_eq!(format_node_id(0x1a2b), "!00001a2b");
    }
}
