//! Run journal.
//!
//! Every change to durable scheduler state is appended to a journal as one
//! versioned entry. On startup the journal is replayed to rebuild the task
//! registry, so emitted windows are never emitted twice and interrupted
//! runs are seen by their failure policy.

use crate::audit::AuditRecord;
use crate::error::JournalError;
use crate::run::{PriorityClass, RunTrigger, TaskRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use trendline_core::{AgentName, TaskRunId, TimeWindow};

/// Current journal entry format.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned wrapper around a journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub payload: T,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// One durable state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Full snapshot of a run after a transition.
    RunUpdated { run: TaskRun },
    /// The cadence source emitted `window` for `agent`.
    WindowEmitted {
        agent: AgentName,
        window: TimeWindow,
    },
    /// A candidate passed the duplicate check and is parked, queued or running.
    CandidateAccepted {
        agent: AgentName,
        window: TimeWindow,
        priority: PriorityClass,
        trigger: RunTrigger,
        at: DateTime<Utc>,
    },
    AgentPaused {
        agent: AgentName,
        reason: String,
        at: DateTime<Utc>,
    },
    AgentResumed {
        agent: AgentName,
        at: DateTime<Utc>,
    },
    DownstreamBlocked {
        agent: AgentName,
        reason: String,
        at: DateTime<Utc>,
    },
    DownstreamCleared {
        agent: AgentName,
        at: DateTime<Utc>,
    },
    /// A run aged out of the retention window.
    RunArchived {
        agent: AgentName,
        window: TimeWindow,
        run_id: TaskRunId,
        at: DateTime<Utc>,
    },
    Audit { record: AuditRecord },
}

/// Append-only store for [`JournalEntry`] values.
///
/// Appends are synchronous and short; callers may append while holding a
/// per-agent lock.
pub trait RunJournal: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns an error if the entry cannot be encoded or written.
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError>;

    /// Returns every entry in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or a line fails to
    /// decode.
    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError>;
}

/// Journal kept in memory. Clones share the same entries, which lets tests
/// hand one journal to several orchestrators in turn.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RunJournal for MemoryJournal {
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Journal stored as JSON lines, one [`Envelope`] per line.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Opens or creates the journal at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| io_error(&path, &e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, &e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path, e: &std::io::Error) -> JournalError {
    JournalError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

impl RunJournal for FileJournal {
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut line =
            serde_json::to_vec(&Envelope::new(entry)).map_err(|e| JournalError::Encode {
                reason: e.to_string(),
            })?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)
            .and_then(|()| file.flush())
            .map_err(|e| io_error(&self.path, &e))
    }

    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let file = File::open(&self.path).map_err(|e| io_error(&self.path, &e))?;
        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_error(&self.path, &e))?;
            if line.trim().is_empty() {
                continue;
            }
            let envelope: Envelope<JournalEntry> =
                serde_json::from_str(&line).map_err(|e| JournalError::Decode {
                    line: index + 1,
                    reason: e.to_string(),
                })?;
            if envelope.version != CURRENT_VERSION {
                return Err(JournalError::Decode {
                    line: index + 1,
                    reason: format!("unsupported entry version {}", envelope.version),
                });
            }
            entries.push(envelope.into_payload());
        }
        Ok(entries)
    }
}
