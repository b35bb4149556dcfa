//! Shared Meshtastic stream protocol for byte-oriented links (serial, TCP).
//!
//! A [`ByteChannel`] moves raw bytes; [`RadioLink`] layers the stream framing,
//! the want-config handshake and FromRadio decoding on top of it and implements
//! [`Link`] for the supervisor.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use prost::Message;

use super::framing::{encode_frame, Chunk, StreamDecoder};
use super::{Link, RawEvent};
use crate::error::{ConnectError, LinkLost, SendError};
use crate::logutil::{escape_log, hex_snippet};
use crate::protobuf::{from_radio, mesh_packet, FromRadio, MeshPacket, ToRadio};

/// Radio clocks occasionally report milliseconds; anything above this is one.
const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

/// Raw byte transport under a [`RadioLink`].
pub trait ByteChannel: Send + 'static {
    /// Next chunk of bytes; an empty chunk means the peer closed the stream.
    /// Must be cancel safe.
    fn read_chunk(&mut self) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    fn write_all(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// What a decoded FromRadio meant for the session.
#[derive(Debug, PartialEq, Eq)]
enum Absorbed {
    Nothing,
    ConfigComplete(u32),
}

pub struct RadioLink<C: ByteChannel> {
    channel: C,
    decoder: StreamDecoder,
    pending: VecDeque<RawEvent>,
    node_num: Option<u32>,
    text_channel: u32,
    heartbeat_nonce: u32,
    rebooted: bool,
    closed: bool,
}

/// Run the want-config handshake over a freshly opened channel.
///
/// Succeeds once the node reports `config_complete_id` for our request. Mesh
/// packets that arrive while the node streams its config are kept and delivered
/// as the first events of the session.
pub async fn handshake<C: ByteChannel>(
    channel: C,
    text_channel: u32,
    limit: Duration,
) -> Result<RadioLink<C>, ConnectError> {
    let mut link = RadioLink {
        channel,
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
        node_num: None,
        text_channel,
        heartbeat_nonce: 0,
        rebooted: false,
        closed: false,
    };
    let config_id = loop {
        let id = rand::random::<u32>();
        if id != 0 {
            break id;
        }
    };
    debug!("Requesting node config (want_config_id={:08x})", config_id);
    if let Err(e) = link.write_to_radio(&ToRadio::want_config(config_id)).await {
        link.close().await;
        return Err(ConnectError::LinkUnavailable(format!(
            "want_config write failed: {}",
            e
        )));
    }

    match tokio::time::timeout(limit, link.await_config(config_id)).await {
        Ok(Ok(())) => {
            info!(
                "Node handshake complete (node {})",
                link.node_num
                    .map(crate::message::format_node_id)
                    .unwrap_or_else(|| "unknown".into())
            );
            Ok(link)
        }
        Ok(Err(lost)) => {
            link.close().await;
            Err(ConnectError::LinkUnavailable(lost.reason))
        }
        Err(_) => {
            link.close().await;
            Err(ConnectError::Timeout(limit))
        }
    }
}

impl<C: ByteChannel> RadioLink<C> {
    async fn await_config(&mut self, config_id: u32) -> Result<(), LinkLost> {
        loop {
            let chunk = self.channel.read_chunk().await?;
            if chunk.is_empty() {
                return Err(LinkLost::new("stream closed during handshake"));
            }
            let received_at = Utc::now();
            let mut done = false;
            for piece in self.decoder.push(&chunk) {
                if let Absorbed::ConfigComplete(id) = self.absorb(piece, received_at) {
                    if id == config_id {
                        done = true;
                    } else {
                        debug!("Ignoring config_complete for foreign request {:08x}", id);
                    }
                }
            }
            if done {
                return Ok(());
            }
        }
    }

    fn absorb(&mut self, piece: Chunk, received_at: DateTime<Utc>) -> Absorbed {
        match piece {
            Chunk::Console(line) => {
                // only legacy text output is worth handing on; the rest is firmware chatter
                if line.contains("MSG:") {
                    self.pending.push_back(RawEvent::console(line, received_at));
                } else {
                    trace!("node console: {}", escape_log(&line));
                }
                Absorbed::Nothing
            }
            Chunk::Frame(bytes) => match FromRadio::decode(bytes.as_slice()) {
                Ok(msg) => self.absorb_from_radio(msg, received_at),
                Err(e) => {
                    warn!(
                        "Undecodable FromRadio frame ({} bytes, {}): {}",
                        bytes.len(),
                        hex_snippet(&bytes, 16),
                        e
                    );
                    Absorbed::Nothing
                }
            },
        }
    }

    fn absorb_from_radio(&mut self, msg: FromRadio, received_at: DateTime<Utc>) -> Absorbed {
        use from_radio::PayloadVariant;
        match msg.payload_variant {
            Some(PayloadVariant::Packet(pkt)) => {
                if let Some(event) = packet_event(pkt, received_at) {
                    self.pending.push_back(event);
                }
                Absorbed::Nothing
            }
            Some(PayloadVariant::MyInfo(info)) => {
                debug!("my_info: node_num={:08x}", info.my_node_num);
                self.node_num = Some(info.my_node_num);
                Absorbed::Nothing
            }
            Some(PayloadVariant::ConfigCompleteId(id)) => Absorbed::ConfigComplete(id),
            Some(PayloadVariant::Rebooted(_)) => {
                warn!("Node reports a reboot");
                self.rebooted = true;
                Absorbed::Nothing
            }
            None => Absorbed::Nothing,
        }
    }

    async fn write_to_radio(&mut self, msg: &ToRadio) -> io::Result<()> {
        let frame = encode_frame(&msg.encode_to_vec())?;
        trace!("TX {} bytes: {}", frame.len(), hex_snippet(&frame, 32));
        self.channel.write_all(&frame).await
    }
}

fn packet_event(pkt: MeshPacket, received_at: DateTime<Utc>) -> Option<RawEvent> {
    match pkt.payload_variant {
        Some(mesh_packet::PayloadVariant::Decoded(data)) => Some(RawEvent {
            received_at,
            packet_id: (pkt.id != 0).then_some(pkt.id),
            from: (pkt.from != 0).then_some(pkt.from),
            rx_time: radio_time(u64::from(pkt.rx_time)),
            channel: pkt.channel,
            payload: super::RawPayload::Packet {
                port: data.portnum,
                bytes: data.payload,
            },
        }),
        Some(mesh_packet::PayloadVariant::Encrypted(bytes)) => {
            trace!(
                "Skipping encrypted packet {:08x} ({} bytes)",
                pkt.id,
                bytes.len()
            );
            None
        }
        None => None,
    }
}

/// Interpret a radio clock value; zero means the node had no time.
pub fn radio_time(raw: u64) -> Option<DateTime<Utc>> {
    match raw {
        0 => None,
        ms if ms > MILLIS_THRESHOLD => DateTime::from_timestamp_millis(ms as i64),
        secs => DateTime::from_timestamp(secs as i64, 0),
    }
}

impl<C: ByteChannel> Link for RadioLink<C> {
    async fn next_event(&mut self) -> Result<RawEvent, LinkLost> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if self.rebooted {
                return Err(LinkLost::new("node rebooted"));
            }
            if self.closed {
                return Err(LinkLost::new("link closed"));
            }
            let chunk = self.channel.read_chunk().await?;
            if chunk.is_empty() {
                return Err(LinkLost::new("remote end closed the stream"));
            }
            trace!("RX {} bytes: {}", chunk.len(), hex_snippet(&chunk, 64));
            let received_at = Utc::now();
            for piece in self.decoder.push(&chunk) {
                self.absorb(piece, received_at);
            }
        }
    }

    async fn send_text(&mut self, packet_id: u32, text: &str) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::NotConnected);
        }
        let msg = ToRadio::broadcast_text(packet_id, self.text_channel, text);
        self.write_to_radio(&msg)
            .await
            .map_err(|e| SendError::Link(e.to_string()))
    }

    async fn probe(&mut self) -> Result<(), LinkLost> {
        if self.closed {
            return Err(LinkLost::new("link closed"));
        }
        self.heartbeat_nonce = self.heartbeat_nonce.wrapping_add(1);
        let msg = ToRadio::heartbeat(self.heartbeat_nonce);
        self.write_to_radio(&msg).await.map_err(LinkLost::from)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.write_to_radio(&ToRadio::disconnect()).await {
            debug!("disconnect notice not delivered: {}", e);
        }
        self.channel.shutdown().await;
    }

    fn node_num(&self) -> Option<u32> {
        self.node_num
    }
}
