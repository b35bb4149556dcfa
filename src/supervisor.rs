//! # Link supervisor
//!
//! Keeps a session with the node alive. The supervisor task owns the [`Link`]
//! exclusively and runs this state machine:
//!
//! ```text
//!                ┌──────────── failure ◀──────────┐
//!                ▼                                 │
//!   Disconnected ──▶ Connecting ──▶ Connected ◀──▶ Degraded
//!        ▲                              │              │
//!        └────────── LinkLost ◀─────────┴──────────────┘
//!
//!   any state ── shutdown ──▶ Closed
//! ```
//!
//! - Failed attempt `i` (0-based) waits `min(base * 2^i, cap)` before the next.
//! - After `max_attempts` consecutive failures the supervisor reports
//!   [`LinkExhausted`], parks in `Disconnected` and waits for an operator
//!   reconnect.
//! - While connected it probes every `probe_interval`; `probe_failure_threshold`
//!   consecutive failures mark the session degraded, which triggers one
//!   re-probe and then an immediate reconnect without backoff.
//! - Send requests are answered in every state; without a link they fail with
//!   `NotConnected` instead of waiting.
//!
//! Every transition is logged and published twice: the latest
//! [`SessionStatus`] on a `watch` channel, and the [`Transition`] itself on an
//! unbounded channel for consumers that need the full sequence.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::error::{ConnectError, LinkExhausted, SendError};
use crate::metrics;
use crate::queue::HandoffQueue;
use crate::transport::{Connector, Link, RawEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Closed,
}

impl LinkState {
    /// Short status text for the UI header.
    pub fn label(self) -> &'static str {
        match self {
            LinkState::Connected => "connected",
            LinkState::Connecting | LinkState::Degraded => "reconnecting…",
            LinkState::Disconnected | LinkState::Closed => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: LinkState,
    /// Consecutive failed connect attempts; zero once connected.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub exhausted: Option<LinkExhausted>,
    pub node_num: Option<u32>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            attempt_count: 0,
            last_error: None,
            connected_since: None,
            exhausted: None,
            node_num: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: LinkState,
    pub to: LinkState,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// Wait after the `failures`-th consecutive failure (0-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub backoff: Backoff,
    /// 0 = unlimited.
    pub max_attempts: u32,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_failure_threshold: u32,
    /// How long to wait for the ingest side to empty the queue at shutdown.
    pub drain_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &SupervisorConfig, drain_timeout: Duration) -> Self {
        Self {
            backoff: Backoff {
                base: Duration::from_millis(cfg.backoff_base_ms),
                cap: Duration::from_millis(cfg.backoff_cap_ms),
            },
            max_attempts: cfg.max_attempts,
            probe_interval: Duration::from_millis(cfg.probe_interval_ms),
            probe_timeout: Duration::from_millis(cfg.probe_timeout_ms),
            probe_failure_threshold: cfg.probe_failure_threshold.max(1),
            drain_timeout,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default(), Duration::from_secs(2))
    }
}

pub enum LinkCommand {
    Send {
        packet_id: u32,
        text: String,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Reconnect,
}

/// Cloneable front door to the supervisor task.
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<LinkCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl LinkHandle {
    /// Hand text to the link; resolves once the node has accepted the write.
    pub async fn send_text(&self, packet_id: u32, text: &str) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LinkCommand::Send {
                packet_id,
                text: text.to_string(),
                reply,
            })
            .await
            .map_err(|_| SendError::Closed)?;
        rx.await.map_err(|_| SendError::Closed)?
    }

    /// Ask for a fresh connect cycle (also clears an exhausted state).
    pub fn reconnect(&self) {
        if self.commands.try_send(LinkCommand::Reconnect).is_err() {
            warn!("Reconnect request dropped: supervisor busy or stopped");
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

enum Attempt<L> {
    Connected(L),
    Failed(ConnectError),
    Shutdown,
}

enum Wake {
    Elapsed,
    Reconnect,
    Shutdown,
}

enum ServeEnd {
    Lost(String),
    Degraded,
    Reconnect,
    Shutdown,
}

pub struct Supervisor<C: Connector> {
    connector: C,
    settings: SupervisorSettings,
    events: HandoffQueue<RawEvent>,
    commands: mpsc::Receiver<LinkCommand>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<SessionStatus>,
    transitions: mpsc::UnboundedSender<Transition>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        settings: SupervisorSettings,
        events: HandoffQueue<RawEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, LinkHandle, mpsc::UnboundedReceiver<Transition>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (trans_tx, trans_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            connector,
            settings,
            events,
            commands: cmd_rx,
            shutdown,
            status: status_tx,
            transitions: trans_tx,
        };
        let handle = LinkHandle {
            commands: cmd_tx,
            status: status_rx,
        };
        (supervisor, handle, trans_rx)
    }

    fn state(&self) -> LinkState {
        self.status.borrow().state
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn transition(&self, to: LinkState, reason: impl Into<String>) {
        let reason = reason.into();
        let from = self.state();
        let attempts = self.status.borrow().attempt_count;
        info!(
            "link {:?} -> {:?} ({}) [attempts={}]",
            from, to, reason, attempts
        );
        self.status.send_modify(|s| {
            s.state = to;
            if to != LinkState::Connected && to != LinkState::Degraded {
                s.connected_since = None;
            }
        });
        let _ = self.transitions.send(Transition { from, to, reason });
    }

    pub async fn run(mut self) {
        let target = self.connector.describe();
        info!("Link supervisor started for {}", target);
        let mut failures: u32 = 0;
        let mut resume_degraded = false;

        loop {
            if self.is_shutdown() {
                break;
            }

            if resume_degraded {
                // immediate recovery attempt, no backoff and no Connecting step
                resume_degraded = false;
            } else {
                let reason = if failures == 0 {
                    format!("connecting to {}", target)
                } else {
                    format!("retry {} to {}", failures, target)
                };
                self.transition(LinkState::Connecting, reason);
            }
            metrics::inc_connect_attempts();

            match self.connect_answering_sends().await {
                Attempt::Shutdown => break,
                Attempt::Failed(err) => {
                    failures += 1;
                    let message = err.to_string();
                    warn!(
                        "Connect attempt {} to {} failed: {}",
                        failures, target, message
                    );
                    self.status.send_modify(|s| {
                        s.attempt_count = failures;
                        s.last_error = Some(message.clone());
                    });
                    self.transition(LinkState::Disconnected, message.clone());

                    let wake = if self.settings.max_attempts > 0
                        && failures >= self.settings.max_attempts
                    {
                        let exhausted = LinkExhausted {
                            attempts: failures,
                            last_error: message,
                        };
                        error!("{}; waiting for operator reconnect", exhausted);
                        self.status.send_modify(|s| s.exhausted = Some(exhausted));
                        self.wait_answering_sends(None).await
                    } else {
                        let delay = self.settings.backoff.delay(failures - 1);
                        debug!("Next attempt in {:?}", delay);
                        self.wait_answering_sends(Some(delay)).await
                    };
                    match wake {
                        Wake::Shutdown => break,
                        Wake::Elapsed => {}
                        Wake::Reconnect => {
                            if self.status.borrow().exhausted.is_some() {
                                info!("Operator requested a fresh reconnect cycle");
                                failures = 0;
                                self.status.send_modify(|s| {
                                    s.exhausted = None;
                                    s.attempt_count = 0;
                                });
                            }
                        }
                    }
                }
                Attempt::Connected(link) => {
                    failures = 0;
                    let node = link.node_num();
                    self.status.send_modify(|s| {
                        s.attempt_count = 0;
                        s.last_error = None;
                        s.exhausted = None;
                        s.connected_since = Some(Utc::now());
                        s.node_num = node.or(s.node_num);
                    });
                    self.transition(LinkState::Connected, "handshake complete");

                    match self.serve(link).await {
                        ServeEnd::Shutdown => break,
                        ServeEnd::Lost(reason) => {
                            self.status
                                .send_modify(|s| s.last_error = Some(reason.clone()));
                            self.transition(LinkState::Disconnected, reason);
                        }
                        ServeEnd::Reconnect => {
                            self.transition(
                                LinkState::Disconnected,
                                "operator requested reconnect",
                            );
                        }
                        ServeEnd::Degraded => {
                            resume_degraded = true;
                        }
                    }
                }
            }
        }

        self.transition(LinkState::Closed, "shutdown");
        info!("Link supervisor stopped");
    }

    /// Run one connect attempt, refusing sends meanwhile.
    async fn connect_answering_sends(&mut self) -> Attempt<C::Link> {
        let connect = self.connector.connect();
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(link) => Attempt::Connected(link),
                        Err(e) => Attempt::Failed(e),
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    Some(LinkCommand::Send { reply, .. }) => {
                        let _ = reply.send(Err(SendError::NotConnected));
                    }
                    Some(LinkCommand::Reconnect) => debug!("Reconnect already in progress"),
                    None => return Attempt::Shutdown,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Attempt::Shutdown;
                    }
                }
            }
        }
    }

    /// Sleep for `delay` (or until a reconnect request when `None`), refusing sends.
    async fn wait_answering_sends(&mut self, delay: Option<Duration>) -> Wake {
        let sleep = tokio::time::sleep(delay.unwrap_or(Duration::MAX));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep, if delay.is_some() => return Wake::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    Some(LinkCommand::Send { reply, .. }) => {
                        let _ = reply.send(Err(SendError::NotConnected));
                    }
                    Some(LinkCommand::Reconnect) => return Wake::Reconnect,
                    None => return Wake::Shutdown,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Wake::Shutdown;
                    }
                }
            }
        }
    }

    /// Pump a live link until it ends.
    async fn serve(&mut self, mut link: C::Link) -> ServeEnd {
        // tokio intervals panic on a zero period
        let period = self.settings.probe_interval.max(Duration::from_millis(1));
        let mut probe = interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe_failures: u32 = 0;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.release(&mut link).await;
                        return ServeEnd::Shutdown;
                    }
                }
                event = link.next_event() => match event {
                    Ok(event) => {
                        metrics::inc_raw_received();
                        if let Some(dropped) = self.events.push(event) {
                            metrics::inc_raw_dropped();
                            warn!(
                                "Handoff queue full ({}); dropped oldest event (packet {:?})",
                                self.events.capacity(),
                                dropped.packet_id
                            );
                        }
                    }
                    Err(lost) => {
                        warn!("{}", lost);
                        link.close().await;
                        return ServeEnd::Lost(lost.reason);
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(LinkCommand::Send { packet_id, text, reply }) => {
                        let result = link.send_text(packet_id, &text).await;
                        if let Err(e) = &result {
                            warn!("Send of packet {:08x} failed: {}", packet_id, e);
                        }
                        let _ = reply.send(result);
                    }
                    Some(LinkCommand::Reconnect) => {
                        link.close().await;
                        return ServeEnd::Reconnect;
                    }
                    None => {
                        self.release(&mut link).await;
                        return ServeEnd::Shutdown;
                    }
                },
                _ = probe.tick() => {
                    if self.probe_once(&mut link).await {
                        if probe_failures > 0 {
                            debug!("Probe recovered after {} failures", probe_failures);
                        }
                        probe_failures = 0;
                        continue;
                    }
                    probe_failures += 1;
                    if probe_failures < self.settings.probe_failure_threshold {
                        continue;
                    }
                    self.transition(
                        LinkState::Degraded,
                        format!("{} consecutive probe failures", probe_failures),
                    );
                    if self.probe_once(&mut link).await {
                        probe_failures = 0;
                        self.transition(LinkState::Connected, "probe recovered");
                    } else {
                        link.close().await;
                        return ServeEnd::Degraded;
                    }
                }
            }
        }
    }

    async fn probe_once(&mut self, link: &mut C::Link) -> bool {
        match tokio::time::timeout(self.settings.probe_timeout, link.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                metrics::inc_probe_failures();
                warn!("Probe failed: {}", e);
                false
            }
            Err(_) => {
                metrics::inc_probe_failures();
                warn!("Probe timed out after {:?}", self.settings.probe_timeout);
                false
            }
        }
    }

    /// Let the ingest side empty the queue, then close the link.
    async fn release(&mut self, link: &mut C::Link) {
        if !self.events.is_empty() {
            debug!("Waiting for {} queued events to drain", self.events.len());
            if tokio::time::timeout(self.settings.drain_timeout, self.events.wait_empty())
                .await
                .is_err()
            {
                warn!("Queue still holds {} events at close", self.events.len());
            }
        }
        link.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let b = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(1000),
        };
        let delays: Vec<u128> = (0..6).map(|i| b.delay(i).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(b.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn labels_match_header_wording() {
        assert_eq!(LinkState::Connected.label(), "connected");
        assert_eq!(LinkState::Degraded.label(), "reconnecting…");
        assert_eq!(LinkState::Closed.label(), "offline");
    }
}
