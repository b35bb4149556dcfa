//! In-process scripted node.
//!
//! [`pair`] returns a [`MemoryConnector`] for the supervisor and a
//! [`MemoryRadio`] remote control used to script connect outcomes, inject
//! events, drop the link and inspect what was sent. Used by the integration
//! tests and by `smoke-test --dry-run`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Connector, Link, RawEvent};
use crate::error::{ConnectError, LinkLost, SendError};
use crate::protobuf::PortNum;

#[derive(Default)]
struct MemoryState {
    connect_script: VecDeque<Result<(), ConnectError>>,
    connect_calls: Vec<Instant>,
    current: Option<mpsc::UnboundedSender<RawEvent>>,
    backlog: Vec<RawEvent>,
    send_failure: Option<SendError>,
    probe_ok: bool,
    sent: Vec<(u32, String)>,
    closes: usize,
    node_num: Option<u32>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build a connected connector / remote-control pair.
pub fn pair() -> (MemoryConnector, MemoryRadio) {
    let state = Arc::new(Mutex::new(MemoryState {
        probe_ok: true,
        node_num: Some(0x0bad_cafe),
        ..Default::default()
    }));
    (
        MemoryConnector {
            state: state.clone(),
        },
        MemoryRadio { state },
    )
}

pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl Connector for MemoryConnector {
    type Link = MemoryLink;

    async fn connect(&mut self) -> Result<MemoryLink, ConnectError> {
        let mut state = lock(&self.state);
        state.connect_calls.push(Instant::now());
        if let Some(Err(e)) = state.connect_script.pop_front() {
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for event in state.backlog.drain(..) {
            let _ = tx.send(event);
        }
        state.current = Some(tx);
        Ok(MemoryLink {
            rx,
            state: self.state.clone(),
            node_num: state.node_num,
            closed: false,
        })
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

pub struct MemoryLink {
    rx: mpsc::UnboundedReceiver<RawEvent>,
    state: Arc<Mutex<MemoryState>>,
    node_num: Option<u32>,
    closed: bool,
}

impl Link for MemoryLink {
    async fn next_event(&mut self) -> Result<RawEvent, LinkLost> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| LinkLost::new("memory link dropped"))
    }

    async fn send_text(&mut self, packet_id: u32, text: &str) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::NotConnected);
        }
        let mut state = lock(&self.state);
        if let Some(err) = state.send_failure.clone() {
            return Err(err);
        }
        state.sent.push((packet_id, text.to_string()));
        Ok(())
    }

    async fn probe(&mut self) -> Result<(), LinkLost> {
        if lock(&self.state).probe_ok {
            Ok(())
        } else {
            Err(LinkLost::new("probe refused"))
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rx.close();
            lock(&self.state).closes += 1;
        }
    }

    fn node_num(&self) -> Option<u32> {
        self.node_num
    }
}

/// Remote control for the scripted node.
#[derive(Clone)]
pub struct MemoryRadio {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRadio {
    /// Queue the outcome of the next connect call; unscripted calls succeed.
    pub fn script_connect(&self, result: Result<(), ConnectError>) {
        lock(&self.state).connect_script.push_back(result);
    }

    /// Queue `n` failures with the given error.
    pub fn fail_next_connects(&self, n: usize, err: ConnectError) {
        let mut state = lock(&self.state);
        for _ in 0..n {
            state.connect_script.push_back(Err(err.clone()));
        }
    }

    /// Deliver an event on the live link, or hold it for the next one.
    pub fn inject(&self, event: RawEvent) {
        let mut state = lock(&self.state);
        let undelivered = match &state.current {
            Some(tx) => tx.send(event).err().map(|e| e.0),
            None => Some(event),
        };
        if let Some(event) = undelivered {
            state.current = None;
            state.backlog.push(event);
        }
    }

    /// Inject a broadcast text packet from `from`.
    pub fn inject_text(&self, from: u32, packet_id: u32, text: &str) {
        self.inject(RawEvent::packet(
            Some(from),
            Some(packet_id),
            PortNum::TextMessageApp as i32,
            text.as_bytes().to_vec(),
            Utc::now(),
        ));
    }

    /// Sever the current link; its `next_event` reports `LinkLost`.
    pub fn drop_link(&self) {
        lock(&self.state).current = None;
    }

    pub fn set_send_failure(&self, failure: Option<SendError>) {
        lock(&self.state).send_failure = failure;
    }

    pub fn set_probe_ok(&self, ok: bool) {
        lock(&self.state).probe_ok = ok;
    }

    pub fn sent(&self) -> Vec<(u32, String)> {
        lock(&self.state).sent.clone()
    }

    /// Instants at which connect was called.
    pub fn connect_calls(&self) -> Vec<Instant> {
        lock(&self.state).connect_calls.clone()
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }
}
