//! Raw event to canonical [`Message`] conversion.
//!
//! The normalizer decides which events are text worth keeping, derives their
//! stable id and sender label, and filters repeats through a bounded
//! recently-seen set. The set is only a fast path: the store's uniqueness check
//! is what actually guarantees one row per id.
//!
//! Inbound and outbound paths share one instance behind a mutex so that message
//! timestamps come from a single non-decreasing clock and reach the store in
//! the order they were issued.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, trace};
use lru::LruCache;

use crate::logutil::escape_log;
use crate::message::{
    content_message_id, format_node_id, packet_message_id, DeliveryState, Direction, Message,
    UNKNOWN_SENDER,
};
use crate::metrics;
use crate::protobuf::PortNum;
use crate::transport::{RawEvent, RawPayload};
use crate::validation::sanitize_body;

/// Outbound packet ids remembered for echo suppression.
const ECHO_CAPACITY: usize = 256;

pub type SharedNormalizer = Arc<Mutex<Normalizer>>;

/// Run `f` with exclusive access to the shared normalizer.
///
/// Taking a closure keeps the guard from living across an `.await`.
pub fn with_normalizer<R>(shared: &SharedNormalizer, f: impl FnOnce(&mut Normalizer) -> R) -> R {
    let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

pub struct Normalizer {
    seen: LruCache<String, ()>,
    echoes: LruCache<u32, String>,
    last_issued: Option<DateTime<Utc>>,
    own_node: Option<u32>,
    max_body_bytes: usize,
}

impl Normalizer {
    pub fn new(dedup_capacity: usize, max_body_bytes: usize) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(dedup_capacity).unwrap_or(NonZeroUsize::MIN)),
            echoes: LruCache::new(NonZeroUsize::new(ECHO_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
            last_issued: None,
            own_node: None,
            max_body_bytes,
        }
    }

    pub fn shared(self) -> SharedNormalizer {
        Arc::new(Mutex::new(self))
    }

    /// Seed the seen set and the clock from history loaded at startup.
    pub fn prime(&mut self, history: &[Message]) {
        for m in history {
            self.seen.put(m.id.clone(), ());
            self.last_issued = Some(self.last_issued.map_or(m.timestamp, |t| t.max(m.timestamp)));
        }
    }

    /// The radio's own node number; traffic from it is shown as outbound.
    pub fn set_own_node(&mut self, node: Option<u32>) {
        self.own_node = node;
    }

    /// Canonical message for `event`, or `None` when it carries no new text.
    ///
    /// Does not mark the id as seen; call [`Normalizer::remember`] once the
    /// message is safely stored.
    pub fn normalize(&mut self, event: &RawEvent) -> Option<Message> {
        let Some((from, text)) = extract_text(event) else {
            metrics::inc_ignored();
            return None;
        };
        let Some(body) = sanitize_body(&text, self.max_body_bytes) else {
            metrics::inc_ignored();
            return None;
        };

        if let Some(pid) = event.packet_id {
            if let Some(local_id) = self.echoes.peek(&pid) {
                debug!("Suppressed echo of {} (packet {:08x})", local_id, pid);
                metrics::inc_duplicates();
                return None;
            }
        }

        let sender = from.map(format_node_id).unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let id = match event.packet_id {
            Some(pid) => packet_message_id(from, pid),
            None => {
                // arrival time makes late redeliveries look new; see content_message_id
                let source = event.rx_time.unwrap_or(event.received_at);
                content_message_id(&sender, source.timestamp(), &body)
            }
        };
        if self.seen.contains(&id) {
            trace!("Duplicate event {}", id);
            metrics::inc_duplicates();
            return None;
        }

        let timestamp = self.stamp(event.received_at);
        let own = from.is_some() && from == self.own_node;
        debug!(
            "Normalized {} from {}: {}",
            id,
            sender,
            escape_log(&body)
        );
        Some(Message {
            id,
            timestamp,
            sender,
            direction: if own { Direction::Outbound } else { Direction::Inbound },
            body,
            delivery_state: if own { DeliveryState::Sent } else { DeliveryState::Received },
        })
    }

    /// Mark `id` as persisted.
    pub fn remember(&mut self, id: &str) {
        self.seen.put(id.to_string(), ());
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Record that `packet_id` carries the local outbound message `message_id`.
    pub fn register_echo(&mut self, packet_id: u32, message_id: &str) {
        self.echoes.put(packet_id, message_id.to_string());
    }

    /// Build an outbound record stamped on the shared clock.
    pub fn outbound(&mut self, sender: &str, body: &str) -> Message {
        let timestamp = self.stamp(Utc::now());
        Message::outbound(timestamp, sender.to_string(), body.to_string())
    }

    /// `max(candidate, last issued)`, so persisted order never runs backwards.
    pub fn stamp(&mut self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last_issued {
            Some(last) if last > candidate => last,
            _ => candidate,
        };
        self.last_issued = Some(ts);
        ts
    }
}

/// Sender number and text of an event, if it is a text message at all.
fn extract_text(event: &RawEvent) -> Option<(Option<u32>, String)> {
    match &event.payload {
        RawPayload::Packet { port, bytes } => match PortNum::try_from(*port) {
            Ok(PortNum::TextMessageApp) => match std::str::from_utf8(bytes) {
                Ok(text) => Some((event.from, text.to_string())),
                Err(_) => {
                    debug!("Dropping non-UTF-8 text packet ({} bytes)", bytes.len());
                    None
                }
            },
            Ok(PortNum::TextMessageCompressedApp) => {
                // the firmware only forwards already-inflated text on this port to API clients
                let printable = bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ');
                printable.then(|| (event.from, String::from_utf8_lossy(bytes).into_owned()))
            }
            _ => {
                trace!("Ignoring packet on port {}", port);
                None
            }
        },
        RawPayload::ConsoleLine(line) => parse_console_line(line),
    }
}

/// `FROM:<node> MSG:<text>`; node as decimal, `0x` hex or `!` hex.
pub fn parse_console_line(line: &str) -> Option<(Option<u32>, String)> {
    let line = line.trim();
    let from_start = line.find("FROM:")?;
    let msg_start = line.find("MSG:")?;
    if msg_start < from_start {
        return None;
    }
    let node = line[from_start + 5..msg_start].trim();
    let text = line[msg_start + 4..].trim();
    Some((parse_node_num(node), text.to_string()))
}

fn parse_node_num(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix('!').or_else(|| s.strip_prefix("0x")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn text_event(from: u32, pid: u32, text: &str) -> RawEvent {
        RawEvent::packet(
            Some(from),
            Some(pid),
            PortNum::TextMessageApp as i32,
            text.as_bytes().to_vec(),
            Utc::now(),
        )
    }

    #[test]
    fn text_packet_becomes_inbound_message() {
        let mut n = Normalizer::new(16, 240);
        let m = n.normalize(&text_event(0x1, 0x10, "hello")).unwrap();
        assert_eq!(m.id, "pkt-00000001-00000010");
        assert_eq!(m.sender, "!00000001");
        assert_eq!(m.body, "hello");
        assert_eq!(m.direction, Direction::Inbound);
        assert_eq!(m.delivery_state, DeliveryState::Received);
    }

    #[test]
    fn seen_only_after_remember() {
        let mut n = Normalizer::new(16, 240);
        let ev = text_event(1, 2, "hi");
        let first = n.normalize(&ev).unwrap();
        // not remembered yet: a failed write must leave the event eligible
        assert!(n.normalize(&ev).is_some());
        n.remember(&first.id);
        assert!(n.normalize(&ev).is_none());
    }

    #[test]
    fn non_text_ports_and_blank_text_are_ignored() {
        let mut n = Normalizer::new(16, 240);
        let pos = RawEvent::packet(Some(1), Some(3), PortNum::PositionApp as i32, vec![1, 2], Utc::now());
        assert!(n.normalize(&pos).is_none());
        assert!(n.normalize(&text_event(1, 4, " \n ")).is_none());
    }

    #[test]
    fn console_lines_hash_to_stable_ids() {
        let mut n = Normalizer::new(16, 240);
        let at = Utc::now();
        let ev = RawEvent::console("FROM:305419896 MSG:legacy hi".into(), at);
        let a = n.normalize(&ev).unwrap();
        let b = Normalizer::new(16, 240).normalize(&ev).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("h-"));
        assert_eq!(a.sender, "!12345678");
        assert_eq!(a.body, "legacy hi");
        assert!(n.normalize(&RawEvent::console("boot complete".into(), at)).is_none());
    }

    #[test]
    fn console_line_redelivered_later_gets_a_new_id() {
        let mut n = Normalizer::new(16, 240);
        let at = Utc::now();
        let line = "FROM:305419896 MSG:again";
        let first = n.normalize(&RawEvent::console(line.into(), at)).unwrap();
        n.remember(&first.id);
        assert!(n.normalize(&RawEvent::console(line.into(), at)).is_none());
        let later = n
            .normalize(&RawEvent::console(line.into(), at + Duration::seconds(5)))
            .unwrap();
        assert_ne!(later.id, first.id);
    }

    #[test]
    fn echo_of_own_transmission_is_suppressed() {
        let mut n = Normalizer::new(16, 240);
        let out = n.outbound("You", "ping");
        n.register_echo(0xbeef, &out.id);
        assert!(n.normalize(&text_event(7, 0xbeef, "ping")).is_none());
    }

    #[test]
    fn traffic_from_own_node_is_outbound() {
        let mut n = Normalizer::new(16, 240);
        n.set_own_node(Some(9));
        let m = n.normalize(&text_event(9, 1, "from my phone")).unwrap();
        assert_eq!(m.direction, Direction::Outbound);
        assert_eq!(m.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn clock_never_runs_backwards() {
        let mut n = Normalizer::new(16, 240);
        let now = Utc::now();
        let a = n.stamp(now);
        let b = n.stamp(now - Duration::seconds(30));
        assert_eq!(a, b);
        let c = n.outbound("You", "x").timestamp;
        assert!(c >= b);
    }

    #[test]
    fn prime_seeds_seen_set_and_clock() {
        let mut n = Normalizer::new(16, 240);
        let future = Utc::now() + Duration::hours(1);
        let old = Message::inbound("pkt-00000001-00000001".into(), future, "!00000001".into(), "x".into());
        n.prime(std::slice::from_ref(&old));
        assert!(n.is_seen(&old.id));
        assert!(n.normalize(&text_event(1, 1, "x")).is_none());
        assert_eq!(n.stamp(Utc::now()), future);
    }

    #[test]
    fn console_parser_accepts_hex_node_ids() {
        assert_eq!(
            parse_console_line("FROM:!0000abcd MSG: yo "),
            Some((Some(0xabcd), "yo".to_string()))
        );
        assert_eq!(parse_console_line("MSG:x FROM:1"), None);
    }
}
