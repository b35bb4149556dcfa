//! # Message Store
//!
//! Durable log of every message the badge has seen or sent.
//!
//! ## Layout
//!
//! ```text
//! data_dir/
//! ├── messages.db/        sled database
//! │   ├── messages        id -> bincode(Message)
//! │   └── timeline        ts_be ++ id -> id
//! └── meshtastic.log      JSON lines, append only
//! ```
//!
//! The sled trees are the source of truth. Inserting is insert-or-ignore on the
//! id inside one transaction over both trees, so replaying an event after a crash
//! is a no-op. The journal line is written only after the transaction commits;
//! journal failures are logged and never fail the append.
//!
//! ## Concurrency
//!
//! The store is `Send + Sync`; concurrent callers are serialized per id by
//! striped locks, so independent ids can commit in parallel. The badge's own
//! ingest and outbound paths do not take advantage of that: they append while
//! holding the normalizer lock, which keeps store order equal to timestamp
//! order. Inside a running badge every append, including the journal write
//! and its `fs2` lock, is therefore fully serialized and runs on the calling
//! tokio worker.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshbadge::storage::{AppendOutcome, MessageStore};
//! # fn demo(msg: meshbadge::message::Message) -> Result<(), meshbadge::error::PersistError> {
//! let store = MessageStore::open("data/messages.db", "data/meshtastic.log")?;
//! if store.append(&msg)? == AppendOutcome::Inserted {
//!     println!("stored {}", msg.id);
//! }
//! let recent = store.read_recent(50)?;
//! # Ok(()) }
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;

use crate::config::StorageConfig;
use crate::error::PersistError;
use crate::message::{DeliveryState, Message};

pub mod journal;

pub use journal::{collapse, read_journal, Journal};

const TREE_MESSAGES: &str = "messages";
const TREE_TIMELINE: &str = "timeline";
const ID_LOCK_STRIPES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// The id was already stored; nothing was written.
    Duplicate,
}

pub struct MessageStore {
    _db: sled::Db,
    messages: sled::Tree,
    timeline: sled::Tree,
    journal: Journal,
    path: PathBuf,
    id_locks: Vec<Mutex<()>>,
}

impl MessageStore {
    /// Open (or create) the store at `db_path` with its journal at `journal_path`.
    pub fn open<P: AsRef<Path>, J: Into<PathBuf>>(
        db_path: P,
        journal_path: J,
    ) -> Result<Self, PersistError> {
        let db_path = db_path.as_ref();
        std::fs::create_dir_all(db_path)?;
        let db = sled::open(db_path)?;
        let messages = db.open_tree(TREE_MESSAGES)?;
        let timeline = db.open_tree(TREE_TIMELINE)?;
        debug!(
            "Opened message store {} ({} messages)",
            db_path.display(),
            messages.len()
        );
        Ok(Self {
            _db: db,
            messages,
            timeline,
            journal: Journal::open(journal_path),
            path: db_path.to_path_buf(),
            id_locks: (0..ID_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn open_with_config(cfg: &StorageConfig) -> Result<Self, PersistError> {
        Self::open(cfg.db_path(), cfg.journal_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        self.journal.path()
    }

    /// Insert `message` unless its id is already stored.
    pub fn append(&self, message: &Message) -> Result<AppendOutcome, PersistError> {
        let _guard = self.id_lock(&message.id);
        let value = bincode::serialize(message)?;
        let id_key = message.id.as_bytes();
        let time_key = timeline_key(&message.timestamp, &message.id);

        let outcome = (&self.messages, &self.timeline)
            .transaction(
                |(messages, timeline)| -> ConflictableTransactionResult<AppendOutcome> {
                    if messages.get(id_key)?.is_some() {
                        return Ok(AppendOutcome::Duplicate);
                    }
                    messages.insert(id_key, value.as_slice())?;
                    timeline.insert(time_key.as_slice(), id_key)?;
                    Ok(AppendOutcome::Inserted)
                },
            )
            .map_err(transaction_error)?;

        if outcome == AppendOutcome::Inserted {
            self.mirror(message);
        }
        Ok(outcome)
    }

    /// Correct the delivery state of a stored message; the journal gets a new line.
    pub fn update_delivery(
        &self,
        id: &str,
        state: DeliveryState,
    ) -> Result<Message, PersistError> {
        let _guard = self.id_lock(id);
        let mut message = self
            .get(id)?
            .ok_or_else(|| PersistError::NotFound(id.to_string()))?;
        if message.delivery_state == state {
            return Ok(message);
        }
        message.delivery_state = state;
        self.messages
            .insert(id.as_bytes(), bincode::serialize(&message)?)?;
        self.mirror(&message);
        Ok(message)
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>, PersistError> {
        match self.messages.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The newest `limit` messages, oldest first.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<Message>, PersistError> {
        let mut out = Vec::with_capacity(limit.min(self.len()));
        for entry in self.timeline.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_, id) = entry?;
            match self.messages.get(&id)? {
                Some(bytes) => out.push(bincode::deserialize::<Message>(&bytes)?),
                None => warn!(
                    "timeline entry without message: {}",
                    String::from_utf8_lossy(&id)
                ),
            }
        }
        out.reverse();
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn flush(&self) -> Result<(), PersistError> {
        self.messages.flush()?;
        self.timeline.flush()?;
        Ok(())
    }

    fn mirror(&self, message: &Message) {
        if let Err(e) = self.journal.append(message) {
            warn!(
                "Journal append failed for {} ({}): {}",
                message.id,
                self.journal.path().display(),
                e
            );
        }
    }

    fn id_lock(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.id_locks.len();
        self.id_locks[stripe]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Big-endian timestamp with the sign bit flipped so byte order is time order,
/// followed by the id as a tie breaker.
fn timeline_key(ts: &DateTime<Utc>, id: &str) -> Vec<u8> {
    let nanos = ts
        .timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1000));
    let ordered = (nanos as u64) ^ (1u64 << 63);
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&ordered.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn transaction_error(err: TransactionError<()>) -> PersistError {
    match err {
        TransactionError::Storage(e) => PersistError::Database(e),
        TransactionError::Abort(()) => PersistError::Aborted("append".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Direction;
    use chrono::{Duration, TimeZone};

    fn store(dir: &Path) -> MessageStore {
        MessageStore::open(dir.join("db"), dir.join("journal.log")).unwrap()
    }

    fn inbound(id: &str, secs: i64) -> Message {
        Message::inbound(
            id.into(),
            Utc.timestamp_opt(secs, 0).unwrap(),
            "!00000001".into(),
            format!("body {}", id),
        )
    }

    #[test]
    fn second_append_of_same_id_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let m = inbound("pkt-1", 100);
        assert_eq!(s.append(&m).unwrap(), AppendOutcome::Inserted);
        assert_eq!(s.append(&m).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(s.len(), 1);
        assert_eq!(read_journal(s.journal_path()).unwrap().len(), 1);
    }

    #[test]
    fn read_recent_sorts_by_time_then_id() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        for (id, secs) in [("c", 300), ("a", 100), ("b2", 200), ("b1", 200)] {
            s.append(&inbound(id, secs)).unwrap();
        }
        let ids: Vec<String> = s.read_recent(10).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b1", "b2", "c"]);

        let tail: Vec<String> = s.read_recent(2).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(tail, vec!["b2", "c"]);
    }

    #[test]
    fn pre_epoch_timestamps_sort_before_post_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append(&inbound("late", 10)).unwrap();
        let mut early = inbound("early", 0);
        early.timestamp = early.timestamp - Duration::seconds(10);
        s.append(&early).unwrap();
        let ids: Vec<String> = s.read_recent(10).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn update_delivery_rewrites_record_and_journals_correction() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let m = Message::outbound(Utc::now(), "You".into(), "ping".into());
        s.append(&m).unwrap();
        let updated = s.update_delivery(&m.id, DeliveryState::SendFailed).unwrap();
        assert_eq!(updated.direction, Direction::Outbound);
        assert_eq!(
            s.get(&m.id).unwrap().unwrap().delivery_state,
            DeliveryState::SendFailed
        );
        assert_eq!(s.len(), 1);
        assert_eq!(read_journal(s.journal_path()).unwrap().len(), 2);
    }

    #[test]
    fn update_of_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(matches!(
            s.update_delivery("nope", DeliveryState::Sent),
            Err(PersistError::NotFound(_))
        ));
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = store(dir.path());
            s.append(&inbound("keep", 1)).unwrap();
            s.flush().unwrap();
        }
        let s = store(dir.path());
        assert_eq!(s.append(&inbound("keep", 1)).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(s.read_recent(5).unwrap().len(), 1);
    }
}
