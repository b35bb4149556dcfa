//! Operator-composed text on its way to the mesh.
//!
//! A submission is recorded before it is sent: the message is persisted and
//! shown as `sent` right away, then handed to the supervisor. If the radio
//! refuses it the same record is corrected to `send_failed` in the store, the
//! journal and the feed. Retrying reuses the record, so a message never appears
//! twice no matter how often it is resent.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::error::SendError;
use crate::logutil::escape_log;
use crate::message::{DeliveryState, Message};
use crate::metrics;
use crate::normalizer::{with_normalizer, SharedNormalizer};
use crate::pipeline::FeedUpdate;
use crate::storage::MessageStore;
use crate::supervisor::LinkHandle;
use crate::validation::validate_outbound_text;

#[derive(Clone)]
pub struct OutboundPath {
    link: LinkHandle,
    normalizer: SharedNormalizer,
    store: Arc<MessageStore>,
    feed_tx: mpsc::Sender<FeedUpdate>,
    max_text_bytes: usize,
    operator_label: String,
}

impl OutboundPath {
    pub fn new(
        link: LinkHandle,
        normalizer: SharedNormalizer,
        store: Arc<MessageStore>,
        feed_tx: mpsc::Sender<FeedUpdate>,
        max_text_bytes: usize,
        operator_label: impl Into<String>,
    ) -> Self {
        Self {
            link,
            normalizer,
            store,
            feed_tx,
            max_text_bytes,
            operator_label: operator_label.into(),
        }
    }

    /// Validate, record and transmit `text` as a broadcast.
    pub async fn submit(&self, text: &str) -> Result<Message, SendError> {
        let body = validate_outbound_text(text, self.max_text_bytes)?;
        let packet_id = next_packet_id();

        // same lock as ingest: the record is stamped and stored in one step
        let recorded = with_normalizer(&self.normalizer, |n| {
            let message = n.outbound(&self.operator_label, &body);
            n.register_echo(packet_id, &message.id);
            let stored = self.store.append(&message);
            if stored.is_ok() {
                n.remember(&message.id);
            }
            stored.map(|_| message)
        });
        let mut message = match recorded {
            Ok(m) => m,
            Err(e) => {
                error!("Could not record outbound message: {}", e);
                return Err(SendError::Persist(e.to_string()));
            }
        };

        let _ = self.feed_tx.send(FeedUpdate::Message(message.clone())).await;
        self.transmit(&mut message, packet_id).await?;
        Ok(message)
    }

    /// Send a `send_failed` message again under its original id.
    pub async fn retry(&self, message: &Message) -> Result<Message, SendError> {
        if !message.is_outbound() {
            return Err(SendError::Link(format!("{} is not an outbound message", message.id)));
        }
        let packet_id = next_packet_id();
        with_normalizer(&self.normalizer, |n| n.register_echo(packet_id, &message.id));

        let mut message = match self.store.get(&message.id) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                // not stored yet (earlier write failed); record it now
                self.store
                    .append(message)
                    .map_err(|e| SendError::Persist(e.to_string()))?;
                message.clone()
            }
            Err(e) => return Err(SendError::Persist(e.to_string())),
        };
        info!("Retrying {}", message.id);
        self.transmit(&mut message, packet_id).await?;
        Ok(message)
    }

    async fn transmit(&self, message: &mut Message, packet_id: u32) -> Result<(), SendError> {
        match self.link.send_text(packet_id, &message.body).await {
            Ok(()) => {
                metrics::inc_sends_ok();
                info!(
                    "Sent {} (packet {:08x}): {}",
                    message.id,
                    packet_id,
                    escape_log(&message.body)
                );
                self.correct(message, DeliveryState::Sent).await;
                Ok(())
            }
            Err(e) => {
                metrics::inc_sends_failed();
                warn!("Send of {} failed: {}", message.id, e);
                self.correct(message, DeliveryState::SendFailed).await;
                Err(e)
            }
        }
    }

    async fn correct(&self, message: &mut Message, state: DeliveryState) {
        if message.delivery_state == state {
            return;
        }
        message.delivery_state = state;
        if let Err(e) = self.store.update_delivery(&message.id, state) {
            error!(
                "Could not record {} for {}: {}",
                state.as_str(),
                message.id,
                e
            );
        }
        let _ = self
            .feed_tx
            .send(FeedUpdate::Delivery {
                id: message.id.clone(),
                state,
            })
            .await;
    }
}

/// Random non-zero vendor packet id.
fn next_packet_id() -> u32 {
    loop {
        let id = rand::random::<u32>();
        if id != 0 {
            return id;
        }
    }
}
