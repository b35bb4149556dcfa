//! # Badge foreground
//!
//! Owns the feed and everything the operator sees. [`Badge::open`] loads the
//! store and hydrates the feed from history; [`Badge::start`] spawns the link
//! supervisor and the ingest task and returns a [`Running`] handle with the
//! channels the foreground listens on.
//!
//! ```text
//!  supervisor task ─┐                 ┌─ FeedUpdate ──┐
//!  ingest task ─────┼─ Running ───────┤               ├──▶ Badge ──▶ Render
//!  send tasks ──────┘                 └─ Transition ──┘      ▲
//!                                                            │
//!                                           OperatorInput ───┘
//! ```
//!
//! The foreground never touches the radio or the store directly; it only
//! mutates the feed and hands work to spawned tasks, so a slow write or a stuck
//! link cannot freeze the screen.

pub mod input;
pub mod terminal;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{Config, TransportKind};
use crate::error::{LinkExhausted, SendError};
use crate::feed::Feed;
use crate::message::Message;
use crate::metrics::{self, Snapshot};
use crate::normalizer::{with_normalizer, Normalizer, SharedNormalizer};
use crate::outbound::OutboundPath;
use crate::pipeline::{FeedUpdate, Ingest};
use crate::queue::HandoffQueue;
use crate::storage::MessageStore;
use crate::supervisor::{LinkHandle, LinkState, SessionStatus, Supervisor, SupervisorSettings, Transition};
use crate::transport::tcp::TcpConnector;
use crate::transport::Connector;

use self::input::{OperatorInput, ScrollDelta, HELP_TEXT};
use self::terminal::{Frame, Render};

const FEED_CHANNEL_CAPACITY: usize = 256;
/// Extra time granted to tasks beyond the drain timeout at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct Badge {
    config: Config,
    store: Arc<MessageStore>,
    normalizer: SharedNormalizer,
    feed: Feed,
    status: SessionStatus,
    notice: Option<String>,
}

impl Badge {
    /// Open the store and hydrate the feed with recent history.
    pub fn open(config: Config) -> Result<Self> {
        let store = MessageStore::open_with_config(&config.storage)
            .map_err(|e| anyhow!("Failed to open message store: {}", e))?;
        let history = store
            .read_recent(config.storage.hydrate_limit)
            .map_err(|e| anyhow!("Failed to read history: {}", e))?;
        info!(
            "Loaded {} of {} stored messages from {}",
            history.len(),
            store.len(),
            store.path().display()
        );

        let mut normalizer =
            Normalizer::new(config.pipeline.dedup_capacity, config.pipeline.max_body_bytes);
        normalizer.prime(&history);
        let mut feed = Feed::new(config.feed.viewport_height);
        feed.hydrate(history);

        Ok(Self {
            config,
            store: Arc::new(store),
            normalizer: normalizer.shared(),
            feed,
            status: SessionStatus::default(),
            notice: None,
        })
    }

    /// Spawn the supervisor and ingest tasks for `connector`.
    pub fn start<C: Connector>(&self, connector: C) -> Running {
        let cfg = &self.config;
        let drain_timeout = cfg.drain_timeout();
        let queue = HandoffQueue::new(cfg.pipeline.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (feed_tx, updates) = mpsc::channel(FEED_CHANNEL_CAPACITY);

        let settings = SupervisorSettings::from_config(&cfg.supervisor, drain_timeout);
        let (supervisor, link, transitions) =
            Supervisor::new(connector, settings, queue.clone(), shutdown_rx.clone());
        let ingest = Ingest::new(
            queue,
            self.normalizer.clone(),
            self.store.clone(),
            feed_tx.clone(),
            shutdown_rx,
            drain_timeout,
        );
        let outbound = OutboundPath::new(
            link.clone(),
            self.normalizer.clone(),
            self.store.clone(),
            feed_tx.clone(),
            cfg.transport.max_text_bytes,
            cfg.pipeline.operator_label.clone(),
        );

        let tasks = vec![tokio::spawn(supervisor.run()), tokio::spawn(ingest.run())];
        Running {
            link,
            outbound,
            updates,
            transitions,
            notices: feed_tx,
            shutdown_tx,
            tasks,
            store: self.store.clone(),
            metrics_path: cfg.storage.metrics_path(),
            drain_timeout,
        }
    }

    /// Run the connector selected by the configuration until the operator quits.
    pub async fn run_configured<R: Render>(
        self,
        input: mpsc::Receiver<OperatorInput>,
        renderer: &mut R,
    ) -> Result<()> {
        match self.config.transport.kind {
            TransportKind::Tcp => {
                let connector = TcpConnector::from_config(&self.config.transport);
                self.run(connector, input, renderer).await
            }
            #[cfg(feature = "serial")]
            TransportKind::Serial => {
                let connector =
                    crate::transport::serial::SerialConnector::from_config(&self.config.transport);
                self.run(connector, input, renderer).await
            }
            #[cfg(not(feature = "serial"))]
            TransportKind::Serial => Err(anyhow!(
                "serial transport not compiled in; rebuild with --features serial or use kind = \"tcp\""
            )),
        }
    }

    /// Foreground loop: apply updates, react to the link and the operator, redraw.
    pub async fn run<C: Connector, R: Render>(
        mut self,
        connector: C,
        mut input: mpsc::Receiver<OperatorInput>,
        renderer: &mut R,
    ) -> Result<()> {
        let mut running = self.start(connector);
        let mut status_rx = running.link.subscribe();
        let mut input_open = true;
        let mut exhausted_exit: Option<LinkExhausted> = None;
        self.redraw(renderer);

        loop {
            tokio::select! {
                Some(update) = running.updates.recv() => self.apply(update),
                Some(transition) = running.transitions.recv() => self.on_transition(&transition),
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        warn!("Link supervisor ended unexpectedly");
                        break;
                    }
                    let status = status_rx.borrow_and_update().clone();
                    if let Some(exhausted) = self.on_status(status) {
                        if self.config.supervisor.exit_on_exhausted {
                            exhausted_exit = Some(exhausted);
                            break;
                        }
                    }
                }
                op = input.recv(), if input_open => match op {
                    Some(OperatorInput::Quit) => {
                        info!("Operator quit");
                        break;
                    }
                    Some(op) => self.handle_input(op, &running, renderer),
                    None => {
                        debug!("Operator input closed; running until interrupted");
                        input_open = false;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
            self.redraw(renderer);
        }

        let report = running.shutdown().await?;
        for update in report.late_updates {
            self.apply(update);
        }
        self.redraw(renderer);

        match exhausted_exit {
            Some(exhausted) => Err(exhausted.into()),
            None => Ok(()),
        }
    }

    pub fn apply(&mut self, update: FeedUpdate) {
        match update {
            FeedUpdate::Message(message) => self.feed.on_message(message),
            FeedUpdate::Delivery { id, state } => {
                if !self.feed.update_delivery(&id, state) {
                    debug!("Delivery update for {} not in feed", id);
                }
            }
            FeedUpdate::Notice(text) => self.notice = Some(text),
        }
    }

    fn on_transition(&mut self, transition: &Transition) {
        match transition.to {
            LinkState::Connected => self.notice = Some("Link up".to_string()),
            LinkState::Disconnected if transition.from != LinkState::Connecting => {
                self.notice = Some(format!("Link lost: {}", transition.reason));
            }
            LinkState::Degraded => self.notice = Some(transition.reason.clone()),
            _ => {}
        }
    }

    /// Track the latest session status; returns the exhaustion report if any.
    fn on_status(&mut self, status: SessionStatus) -> Option<LinkExhausted> {
        if status.node_num.is_some() && status.node_num != self.status.node_num {
            with_normalizer(&self.normalizer, |n| n.set_own_node(status.node_num));
        }
        let newly_exhausted = status.exhausted.is_some() && self.status.exhausted.is_none();
        self.status = status;
        let exhausted = self.status.exhausted.clone()?;
        if newly_exhausted {
            self.notice = Some(format!("Gave up after {} attempts; /reconnect", exhausted.attempts));
        }
        Some(exhausted)
    }

    fn handle_input<R: Render>(&mut self, op: OperatorInput, running: &Running, renderer: &mut R) {
        match op {
            OperatorInput::Scroll(delta) => match delta {
                ScrollDelta::Lines(n) => self.feed.scroll(n),
                ScrollDelta::Pages(n) => self.feed.scroll_page(n),
                ScrollDelta::Top => self.feed.scroll_to_top(),
                ScrollDelta::Bottom => self.feed.scroll_to_bottom(),
            },
            OperatorInput::Submit(text) => {
                self.notice = None;
                running.submit_in_background(text);
            }
            OperatorInput::Retry => match self.feed.last_failed_outbound() {
                Some(message) => {
                    self.notice = Some("Retrying…".to_string());
                    running.retry_in_background(message.clone());
                }
                None => self.notice = Some("Nothing to retry".to_string()),
            },
            OperatorInput::Reconnect => {
                self.notice = Some("Reconnecting…".to_string());
                running.link.reconnect();
            }
            OperatorInput::Resize(height) => {
                self.feed.resize(height);
                renderer.set_viewport_height(height);
            }
            OperatorInput::Help => self.notice = Some(HELP_TEXT.to_string()),
            OperatorInput::Unknown(cmd) => {
                self.notice = Some(format!("Unknown command {} (/help)", cmd));
            }
            OperatorInput::Quit => {}
        }
    }

    fn redraw<R: Render>(&self, renderer: &mut R) {
        let frame = Frame {
            status: &self.status,
            window: self.feed.visible_window(),
            notice: self.notice.as_deref(),
            first: self.feed.scroll_offset(),
            total: self.feed.len(),
            at_bottom: self.feed.at_bottom(),
        };
        if let Err(e) = renderer.draw(&frame) {
            warn!("Render failed: {}", e);
        }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut Feed {
        &mut self.feed
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }
}

/// Operator-facing wording for a refused send.
pub fn send_notice(err: &SendError) -> String {
    match err {
        SendError::Empty => "Empty message".to_string(),
        SendError::NotConnected => "Not connected; /retry once the link is up".to_string(),
        SendError::TooLong { len, max } => format!("Message too long ({}/{} bytes)", len, max),
        other => format!("Send failed: {}", other),
    }
}

/// What shutdown left behind.
#[derive(Debug)]
pub struct ShutdownReport {
    /// Feed updates emitted while the tasks drained.
    pub late_updates: Vec<FeedUpdate>,
    pub metrics: Snapshot,
}

/// Handles to the background tasks of a started badge.
pub struct Running {
    link: LinkHandle,
    outbound: OutboundPath,
    updates: mpsc::Receiver<FeedUpdate>,
    transitions: mpsc::UnboundedReceiver<Transition>,
    notices: mpsc::Sender<FeedUpdate>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    store: Arc<MessageStore>,
    metrics_path: PathBuf,
    drain_timeout: Duration,
}

impl Running {
    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn outbound(&self) -> &OutboundPath {
        &self.outbound
    }

    pub async fn next_update(&mut self) -> Option<FeedUpdate> {
        self.updates.recv().await
    }

    pub async fn next_transition(&mut self) -> Option<Transition> {
        self.transitions.recv().await
    }

    /// Submit on a spawned task; failures come back as a notice.
    pub fn submit_in_background(&self, text: String) {
        let outbound = self.outbound.clone();
        let notices = self.notices.clone();
        tokio::spawn(async move {
            if let Err(e) = outbound.submit(&text).await {
                let _ = notices.send(FeedUpdate::Notice(send_notice(&e))).await;
            }
        });
    }

    pub fn retry_in_background(&self, message: Message) {
        let outbound = self.outbound.clone();
        let notices = self.notices.clone();
        tokio::spawn(async move {
            let notice = match outbound.retry(&message).await {
                Ok(_) => "Sent".to_string(),
                Err(e) => send_notice(&e),
            };
            let _ = notices.send(FeedUpdate::Notice(notice)).await;
        });
    }

    /// Stop the tasks, let queued events drain, flush the store and record metrics.
    pub async fn shutdown(mut self) -> Result<ShutdownReport> {
        info!("Shutting down badge...");
        let _ = self.shutdown_tx.send(true);

        let tasks = std::mem::take(&mut self.tasks);
        let join = async move {
            for task in tasks {
                if let Err(e) = task.await {
                    error!("Background task failed: {}", e);
                }
            }
        };
        tokio::pin!(join);
        let deadline = tokio::time::sleep(self.drain_timeout + SHUTDOWN_GRACE);
        tokio::pin!(deadline);

        let mut late_updates = Vec::new();
        loop {
            tokio::select! {
                _ = &mut join => break,
                Some(update) = self.updates.recv() => late_updates.push(update),
                _ = &mut deadline => {
                    warn!("Background tasks still running after {:?}", self.drain_timeout + SHUTDOWN_GRACE);
                    break;
                }
            }
        }
        while let Ok(update) = self.updates.try_recv() {
            late_updates.push(update);
        }

        self.store
            .flush()
            .map_err(|e| anyhow!("Failed to flush message store: {}", e))?;

        let snapshot = metrics::snapshot();
        info!(
            "Session metrics: received={} dropped={} duplicates={} persisted={} persist_failed={} sent={} send_failed={} connects={}",
            snapshot.raw_received,
            snapshot.raw_dropped,
            snapshot.duplicates,
            snapshot.persisted,
            snapshot.persist_failed,
            snapshot.sends_ok,
            snapshot.sends_failed,
            snapshot.connect_attempts
        );
        if let Err(e) = write_metrics(&self.metrics_path, &snapshot) {
            warn!("Could not write {}: {}", self.metrics_path.display(), e);
        }

        info!("Badge shutdown complete");
        Ok(ShutdownReport {
            late_updates,
            metrics: snapshot,
        })
    }
}

fn write_metrics(path: &std::path::Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(snapshot)?)?;
    Ok(())
}

/// Counters recorded by the last clean shutdown, if any.
pub fn read_last_metrics(path: &std::path::Path) -> Result<Option<Snapshot>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryState;
    use chrono::Utc;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.to_string_lossy().into_owned();
        config.feed.viewport_height = 3;
        config
    }

    #[test]
    fn send_notices_use_operator_wording() {
        assert_eq!(send_notice(&SendError::Empty), "Empty message");
        assert!(send_notice(&SendError::NotConnected).starts_with("Not connected"));
        assert_eq!(
            send_notice(&SendError::TooLong { len: 300, max: 200 }),
            "Message too long (300/200 bytes)"
        );
    }

    #[test]
    fn open_hydrates_from_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        {
            let store = MessageStore::open_with_config(&config.storage).unwrap();
            for i in 0..5 {
                let m = Message::inbound(
                    format!("m{}", i),
                    Utc::now() + chrono::Duration::seconds(i),
                    "!00000001".into(),
                    format!("#{}", i),
                );
                store.append(&m).unwrap();
            }
            store.flush().unwrap();
        }
        let badge = Badge::open(config).unwrap();
        assert_eq!(badge.feed().len(), 5);
        let ids: Vec<&str> = badge.feed().visible_window().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn delivery_updates_and_notices_apply_to_feed() {
        let dir = tempfile::tempdir().unwrap();
        let mut badge = Badge::open(config_in(dir.path())).unwrap();
        let out = Message::outbound(Utc::now(), "You".into(), "ping".into());
        badge.apply(FeedUpdate::Message(out.clone()));
        badge.apply(FeedUpdate::Delivery {
            id: out.id.clone(),
            state: DeliveryState::SendFailed,
        });
        badge.apply(FeedUpdate::Notice("Not connected".into()));
        assert_eq!(badge.feed().last_failed_outbound().map(|m| m.id.clone()), Some(out.id));
        assert_eq!(badge.notice(), Some("Not connected"));
    }

    #[test]
    fn missing_metrics_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_last_metrics(&dir.path().join("none.json")).unwrap().is_none());
        let path = dir.path().join("m.json");
        write_metrics(&path, &Snapshot::default()).unwrap();
        assert_eq!(read_last_metrics(&path).unwrap(), Some(Snapshot::default()));
    }
}
