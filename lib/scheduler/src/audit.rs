//! Local audit trail.
//!
//! Every run that ends anywhere but Succeeded leaves an audit record, as do
//! dropped alerts and discarded late results. Records are logged, journaled
//! and kept in a bounded in-memory buffer for status queries.

use crate::journal::{JournalEntry, RunJournal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;
use trendline_core::{AgentName, TaskRunId, TimeWindow};

/// Records kept in memory before the oldest are evicted.
const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Abandoned,
    PartialSuccess,
    Fallback,
    SkipDownstream,
    Escalated,
    AlertDropped,
    LateResultDiscarded,
}

impl AuditKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Abandoned => "abandoned",
            Self::PartialSuccess => "partial_success",
            Self::Fallback => "fallback",
            Self::SkipDownstream => "skip_downstream",
            Self::Escalated => "escalated",
            Self::AlertDropped => "alert_dropped",
            Self::LateResultDiscarded => "late_result_discarded",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub agent: AgentName,
    pub window: Option<TimeWindow>,
    pub run_id: Option<TaskRunId>,
    pub kind: AuditKind,
    pub detail: String,
}

impl AuditRecord {
    #[must_use]
    pub fn new(
        at: DateTime<Utc>,
        agent: AgentName,
        kind: AuditKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            at,
            agent,
            window: None,
            run_id: None,
            kind,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn for_run(mut self, run_id: TaskRunId, window: TimeWindow) -> Self {
        self.run_id = Some(run_id);
        self.window = Some(window);
        self
    }
}

/// Shared handle to the audit trail.
#[derive(Debug, Clone)]
pub struct AuditLog {
    records: Arc<Mutex<VecDeque<AuditRecord>>>,
    capacity: usize,
    journal: Arc<dyn RunJournal>,
}

impl AuditLog {
    #[must_use]
    pub fn new(journal: Arc<dyn RunJournal>) -> Self {
        Self::with_capacity(journal, DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(journal: Arc<dyn RunJournal>, capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            journal,
        }
    }

    /// Logs, journals and buffers `record`.
    pub fn record(&self, record: AuditRecord) {
        warn!(
            target: "trendline::audit",
            agent = %record.agent,
            kind = %record.kind,
            run_id = ?record.run_id,
            detail = %record.detail,
            "audit record"
        );
        if let Err(e) = self.journal.append(&JournalEntry::Audit {
            record: record.clone(),
        }) {
            warn!(error = %e, "failed to journal audit record");
        }
        self.push(record);
    }

    /// Buffers records replayed from the journal without journaling them
    /// again.
    pub fn restore(&self, records: impl IntoIterator<Item = AuditRecord>) {
        for record in records {
            self.push(record);
        }
    }

    fn push(&self, record: AuditRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Buffered records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn records_for(&self, agent: &AgentName) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| record.agent == *agent)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use chrono::TimeZone;

    fn record(detail: &str) -> AuditRecord {
        AuditRecord::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap(),
            AgentName::new("predictor").unwrap(),
            AuditKind::Abandoned,
            detail,
        )
    }

    #[test]
    fn records_are_journaled_and_bounded() {
        let journal = MemoryJournal::new();
        let log = AuditLog::with_capacity(Arc::new(journal.clone()), 2);

        log.record(record("one"));
        log.record(record("two"));
        log.record(record("three"));

        let details: Vec<String> = log.records().into_iter().map(|r| r.detail).collect();
        assert_eq!(details, vec!["two", "three"]);
        assert_eq!(journal.len(), 3);
    }

    #[test]
    fn restore_does_not_journal() {
        let journal = MemoryJournal::new();
        let log = AuditLog::new(Arc::new(journal.clone()));
        log.restore(vec![record("replayed")]);
        assert_eq!(log.records().len(), 1);
        assert!(journal.is_empty());
        assert_eq!(
            log.records_for(&AgentName::new("analyzer").unwrap()).len(),
            0
        );
    }
}
