//! Ingest task: raw events in, stored messages out.
//!
//! ```text
//!  supervisor ──push──▶ HandoffQueue<RawEvent> ──pop──▶ Ingest
//!                                                       │ normalize
//!                                                       │ append (store, then journal)
//!                                                       │ remember id
//!                                                       ▼
//!                                         mpsc<FeedUpdate> ──▶ foreground
//! ```

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::error::PersistError;
use crate::message::{DeliveryState, Message};
use crate::metrics;
use crate::normalizer::{with_normalizer, SharedNormalizer};
use crate::queue::HandoffQueue;
use crate::storage::{AppendOutcome, MessageStore};
use crate::transport::RawEvent;

/// Changes the foreground applies to its feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    Message(Message),
    Delivery { id: String, state: DeliveryState },
    Notice(String),
}

pub struct Ingest {
    queue: HandoffQueue<RawEvent>,
    normalizer: SharedNormalizer,
    store: Arc<MessageStore>,
    feed_tx: mpsc::Sender<FeedUpdate>,
    shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
}

impl Ingest {
    pub fn new(
        queue: HandoffQueue<RawEvent>,
        normalizer: SharedNormalizer,
        store: Arc<MessageStore>,
        feed_tx: mpsc::Sender<FeedUpdate>,
        shutdown: watch::Receiver<bool>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            normalizer,
            store,
            feed_tx,
            shutdown,
            drain_timeout,
        }
    }

    pub async fn run(mut self) {
        debug!("Ingest task started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                event = self.queue.pop() => {
                    self.process(event).await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let pending = self.queue.len();
        if pending > 0 {
            info!("Draining {} queued events before exit", pending);
        }
        let drain = async {
            while let Some(event) = self.queue.try_pop() {
                self.process(event).await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!(
                "Drain timed out after {:?} with {} events unprocessed",
                self.drain_timeout,
                self.queue.len()
            );
        }
        debug!("Ingest task stopped");
    }

    /// Normalize and persist one event; returns the message if it was new.
    pub async fn process(&self, event: RawEvent) -> Option<Message> {
        // normalize + append under one lock so store order follows timestamp order;
        // this serializes every append and blocks the worker for the sled commit
        let result: Option<(Message, Result<AppendOutcome, PersistError>)> =
            with_normalizer(&self.normalizer, |n| {
                let message = n.normalize(&event)?;
                let outcome = self.store.append(&message);
                if outcome.is_ok() {
                    n.remember(&message.id);
                }
                Some((message, outcome))
            });
        let (message, outcome) = result?;

        match outcome {
            Ok(AppendOutcome::Inserted) => {
                metrics::inc_persisted();
                if self
                    .feed_tx
                    .send(FeedUpdate::Message(message.clone()))
                    .await
                    .is_err()
                {
                    debug!("Feed closed; {} stored but not displayed", message.id);
                }
                Some(message)
            }
            Ok(AppendOutcome::Duplicate) => {
                metrics::inc_duplicates();
                debug!("Already stored: {}", message.id);
                None
            }
            Err(e) => {
                metrics::inc_persist_failed();
                error!(
                    "Failed to persist {} from {}: {}",
                    message.id, message.sender, e
                );
                let _ = self
                    .feed_tx
                    .send(FeedUpdate::Notice(format!("Storage error: {}", e)))
                    .await;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::Normalizer;
    use crate::protobuf::PortNum;
    use crate::storage::read_journal;
    use chrono::Utc;

    fn setup(dir: &std::path::Path) -> (Ingest, mpsc::Receiver<FeedUpdate>, watch::Sender<bool>) {
        let store = Arc::new(MessageStore::open(dir.join("db"), dir.join("j.log")).unwrap());
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingest = Ingest::new(
            HandoffQueue::new(8),
            Normalizer::new(64, 240).shared(),
            store,
            feed_tx,
            shutdown_rx,
            Duration::from_secs(1),
        );
        (ingest, feed_rx, shutdown_tx)
    }

    fn hello() -> RawEvent {
        RawEvent::packet(
            Some(1),
            Some(0x55),
            PortNum::TextMessageApp as i32,
            b"hello".to_vec(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn same_event_twice_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let (ingest, mut feed_rx, _tx) = setup(dir.path());
        assert!(ingest.process(hello()).await.is_some());
        assert!(ingest.process(hello()).await.is_none());
        assert_eq!(ingest.store.len(), 1);
        assert!(matches!(feed_rx.recv().await, Some(FeedUpdate::Message(m)) if m.body == "hello"));
        assert!(feed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let dir = tempfile::tempdir().unwrap();
        let (ingest, mut feed_rx, shutdown_tx) = setup(dir.path());
        let queue = ingest.queue.clone();
        let store = ingest.store.clone();
        shutdown_tx.send(true).unwrap();
        queue.push(hello());
        ingest.run().await;
        assert_eq!(store.len(), 1);
        assert!(queue.is_empty());
        assert!(feed_rx.recv().await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingest_keeps_journal_in_timestamp_order() {
        let dir = tempfile::tempdir().unwrap();
        let (ingest, mut feed_rx, _tx) = setup(dir.path());
        let ingest = Arc::new(ingest);
        let drain = tokio::spawn(async move { while feed_rx.recv().await.is_some() {} });

        let writers: Vec<_> = (0..8u32)
            .map(|node| {
                let ingest = ingest.clone();
                tokio::spawn(async move {
                    for pid in 1..=10u32 {
                        let event = RawEvent::packet(
                            Some(node + 1),
                            Some(pid),
                            PortNum::TextMessageApp as i32,
                            format!("{}-{}", node, pid).into_bytes(),
                            Utc::now(),
                        );
                        ingest.process(event).await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        drain.abort();

        let journal = read_journal(ingest.store.journal_path()).unwrap();
        assert_eq!(journal.len(), 80);
        assert!(journal.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        let stored = ingest.store.read_recent(100).unwrap();
        let stored_ids: Vec<&str> = stored.iter().map(|m| m.id.as_str()).collect();
        let journal_ids: Vec<&str> = journal.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(stored_ids, journal_ids);
    }
}
