//! # Transport sessions
//!
//! A transport owns the byte link to one Meshtastic node and turns it into a
//! stream of [`RawEvent`]s. The rest of the badge never sees serial ports or
//! sockets: the supervisor drives a [`Connector`] to obtain a [`Link`], pulls
//! events from it and pushes outbound text back through it.
//!
//! ## Implementations
//!
//! - [`serial::SerialConnector`]: rfcomm / USB serial device (feature `serial`)
//! - [`tcp::TcpConnector`]: the node's WiFi API on port 4403
//! - [`memory::MemoryConnector`]: scripted in-process node used by tests
//!
//! Serial and TCP share the wire handling in [`radio`]: the `0x94 0xC3` stream
//! framing, the want-config handshake and FromRadio decoding.
//!
//! ```toml
//! [transport]
//! kind = "serial"
//! port = "/dev/rfcomm0"
//! baud_rate = 115200
//! ```

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::{ConnectError, LinkLost, SendError};

pub mod framing;
pub mod memory;
pub mod radio;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

/// Payload of one inbound event, before any interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Decoded mesh packet: application port number and its bytes.
    Packet { port: i32, bytes: Vec<u8> },
    /// A line of the node's text console (legacy `FROM:<num> MSG:<text>` output).
    ConsoleLine(String),
}

/// One inbound event as delivered by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Local arrival time.
    pub received_at: DateTime<Utc>,
    /// Vendor packet id, when the event came from a mesh packet.
    pub packet_id: Option<u32>,
    /// Sending node number.
    pub from: Option<u32>,
    /// Radio receive time, when the node's clock was set.
    pub rx_time: Option<DateTime<Utc>>,
    pub channel: u32,
    pub payload: RawPayload,
}

impl RawEvent {
    pub fn packet(
        from: Option<u32>,
        packet_id: Option<u32>,
        port: i32,
        bytes: Vec<u8>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            received_at,
            packet_id,
            from,
            rx_time: None,
            channel: 0,
            payload: RawPayload::Packet { port, bytes },
        }
    }

    pub fn console(line: String, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            packet_id: None,
            from: None,
            rx_time: None,
            channel: 0,
            payload: RawPayload::ConsoleLine(line),
        }
    }
}

/// Opens links to a node. Called again by the supervisor for every attempt.
pub trait Connector: Send + 'static {
    type Link: Link;

    /// Open the link and complete the node handshake.
    fn connect(&mut self) -> impl Future<Output = Result<Self::Link, ConnectError>> + Send;

    /// Human readable target, e.g. the device path.
    fn describe(&self) -> String;
}

/// An established session with the node.
pub trait Link: Send + 'static {
    /// Next inbound event. Idle periods simply pend.
    ///
    /// Must be cancel safe: the supervisor polls it inside `select!`.
    fn next_event(&mut self) -> impl Future<Output = Result<RawEvent, LinkLost>> + Send;

    /// Broadcast `text` under the given vendor packet id.
    fn send_text(
        &mut self,
        packet_id: u32,
        text: &str,
    ) -> impl Future<Output = Result<(), SendError>> + Send;

    /// Cheap health check.
    fn probe(&mut self) -> impl Future<Output = Result<(), LinkLost>> + Send;

    /// Release the OS handle. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    /// The node's own number, once learned.
    fn node_num(&self) -> Option<u32>;
}
