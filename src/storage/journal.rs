//! Append-only JSON-lines journal mirroring the structured store.
//!
//! One serialized [`Message`] per line. The file is only ever appended to;
//! a delivery-state correction is a new line for the same id, and readers keep
//! the last line per id. Each write holds an exclusive `fs2` lock so an external
//! tail or a second badge process never sees a torn line.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use log::warn;

use crate::message::Message;

pub struct Journal {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Journal {
    /// Open for appending. A journal that cannot be opened is retried on the
    /// next write; the store stays authoritative either way.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match open_append(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("Journal {} unavailable: {}", path.display(), e);
                None
            }
        };
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &Message) -> io::Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(open_append(&self.path)?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "journal not open"));
        };

        FileExt::lock_exclusive(&*file)?;
        let written = file.write_all(line.as_bytes()).and_then(|_| file.flush());
        let unlocked = FileExt::unlock(&*file);
        if written.is_err() {
            // reopen next time in case the handle went bad (file rotated, disk swapped)
            *guard = None;
        }
        written.and(unlocked)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Every parseable line of a journal, in file order. Malformed lines (a torn
/// write from a crash) are skipped.
pub fn read_journal(path: &Path) -> io::Result<Vec<Message>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    FileExt::lock_shared(&file)?;
    let mut out = Vec::new();
    for (n, line) in BufReader::new(&file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(m) => out.push(m),
            Err(e) => warn!("{}:{}: skipping malformed journal line: {}", path.display(), n + 1, e),
        }
    }
    let _ = FileExt::unlock(&file);
    Ok(out)
}

/// Journal contents with corrections applied: one entry per id, in order of
/// first appearance, carrying the last recorded state.
pub fn collapse(lines: Vec<Message>) -> Vec<Message> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Message> = Vec::new();
    for m in lines {
        match index.get(&m.id) {
            Some(&i) => out[i] = m,
            None => {
                index.insert(m.id.clone(), out.len());
                out.push(m);
            }
        }
    }
    out
}
