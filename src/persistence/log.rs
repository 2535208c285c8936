//! Append-only transaction log of interpreter effects.
//!
//! Every observable mutation of an instance (configuration changes, data
//! writes, queue traffic, invocation lifecycle, status changes) is recorded
//! as a [`LogRecord`] before it is applied. Replaying the records over a
//! fresh context reconstructs the exact instance state, which is what makes
//! crash recovery and snapshot catch-up possible.
//!
//! Records are stored as [`LogEntry`] envelopes carrying a numeric kind
//! discriminator alongside the serialized body. Readers skip entries whose
//! discriminator they do not recognize, so a log written by a newer build
//! still replays on an older one minus the unknown effects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::datamodel::DataModelValue;
use crate::event::EventObject;
use crate::types::{Completion, InstanceStatus};

/// One effect applied to a running instance.
///
/// State and history references use document ids rather than arena indices so
/// a log stays meaningful across recompilations of the same chart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A state joined the active configuration.
    EnterState { state: String },
    /// A state left the active configuration.
    ExitState { state: String },
    /// A data-store location was written.
    DataSet {
        location: String,
        value: DataModelValue,
    },
    /// A history pseudo-state captured a configuration snapshot.
    HistorySet { history: String, stored: Vec<String> },
    /// An invocation was started on behalf of `owner`.
    InvokeStarted { invoke_id: String, owner: String },
    /// An invocation finished or was cancelled.
    InvokeStopped { invoke_id: String },
    /// An event was pushed onto the internal queue.
    InternalEnqueued { event: EventObject },
    /// The head of the internal queue was consumed.
    InternalDequeued,
    /// An event was pushed onto the external queue.
    ExternalEnqueued { event: EventObject },
    /// The head of the external queue was consumed.
    ExternalDequeued,
    /// The instance lifecycle advanced.
    StatusChanged { status: InstanceStatus },
    /// The final completion value was recorded.
    ResultSet { completion: Completion },
}

impl LogRecord {
    /// Stable numeric discriminator for the envelope.
    #[must_use]
    pub fn kind(&self) -> u16 {
        match self {
            Self::EnterState { .. } => 1,
            Self::ExitState { .. } => 2,
            Self::DataSet { .. } => 3,
            Self::HistorySet { .. } => 4,
            Self::InvokeStarted { .. } => 5,
            Self::InvokeStopped { .. } => 6,
            Self::InternalEnqueued { .. } => 7,
            Self::InternalDequeued => 8,
            Self::ExternalEnqueued { .. } => 9,
            Self::ExternalDequeued => 10,
            Self::StatusChanged { .. } => 11,
            Self::ResultSet { .. } => 12,
        }
    }
}

const KNOWN_KINDS: std::ops::RangeInclusive<u16> = 1..=12;

/// Envelope persisted for each log record: a monotonically increasing
/// sequence number, the record's kind discriminator, and its serialized body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub kind: u16,
    pub body: Value,
}

impl LogEntry {
    /// Wrap a record in an envelope.
    ///
    /// Serialization of a record cannot fail: every field type serializes
    /// infallibly to JSON, and values enter the context pre-normalized (see
    /// [`DataModelValue::normalized`]) so no non-finite number ever reaches
    /// the envelope.
    #[must_use]
    pub fn new(seq: u64, record: &LogRecord) -> Self {
        let body = serde_json::to_value(record).unwrap_or(Value::Null);
        Self {
            seq,
            kind: record.kind(),
            body,
        }
    }

    /// Decode the envelope back into a record.
    ///
    /// Entries with an unrecognized discriminator or an unreadable body are
    /// skipped with a warning rather than failing the whole replay.
    #[must_use]
    pub fn decode(&self) -> Option<LogRecord> {
        if !KNOWN_KINDS.contains(&self.kind) {
            warn!(seq = self.seq, kind = self.kind, "skipping unknown log record kind");
            return None;
        }
        match serde_json::from_value(self.body.clone()) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(seq = self.seq, kind = self.kind, %error, "skipping undecodable log record");
                None
            }
        }
    }
}

/// In-memory tail of the append-only log for one instance.
///
/// `flushed_seq` tracks the highest sequence number known to be captured by a
/// durable snapshot; [`truncate_flushed`](Self::truncate_flushed) drops those
/// entries once the snapshot is safely stored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransactionLog {
    entries: Vec<LogEntry>,
    next_seq: u64,
    flushed_seq: u64,
}

impl TransactionLog {
    /// Log that continues after a restored snapshot: empty, with sequence
    /// numbering picking up where the snapshot left off.
    #[must_use]
    pub fn resume_from(seq: u64) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: seq,
            flushed_seq: seq,
        }
    }

    /// Append a record, assigning the next sequence number.
    pub fn append(&mut self, record: &LogRecord) -> u64 {
        self.next_seq += 1;
        self.entries.push(LogEntry::new(self.next_seq, record));
        self.next_seq
    }

    /// Entries not yet covered by a durable snapshot.
    pub fn unflushed(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| e.seq > self.flushed_seq)
    }

    /// All retained entries in sequence order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Highest assigned sequence number.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.next_seq
    }

    /// Mark everything up to and including `seq` as captured by a snapshot.
    pub fn mark_flushed(&mut self, seq: u64) {
        self.flushed_seq = self.flushed_seq.max(seq);
    }

    /// Drop entries already covered by a snapshot. Called only after the
    /// snapshot write has been acknowledged.
    pub fn truncate_flushed(&mut self) {
        let flushed = self.flushed_seq;
        self.entries.retain(|e| e.seq > flushed);
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic_across_truncation() {
        let mut log = TransactionLog::default();
        let first = log.append(&LogRecord::InternalDequeued);
        let second = log.append(&LogRecord::ExternalDequeued);
        assert_eq!((first, second), (1, 2));

        log.mark_flushed(second);
        log.truncate_flushed();
        assert!(log.is_empty());

        let third = log.append(&LogRecord::InternalDequeued);
        assert_eq!(third, 3);
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let entry = LogEntry {
            seq: 7,
            kind: 999,
            body: Value::Null,
        };
        assert!(entry.decode().is_none());
    }

    #[test]
    fn records_round_trip_through_the_envelope() {
        let record = LogRecord::DataSet {
            location: "order.total".to_string(),
            value: DataModelValue::Number(9.5),
        };
        let entry = LogEntry::new(1, &record);
        assert_eq!(entry.kind, 3);
        assert_eq!(entry.decode(), Some(record));
    }
}
