// Oplog Data Model
//
// Entries observed while tailing the replication log, and the
// counter partition they are aggregated under.

pub mod memory;
pub mod source;

pub use memory::{MemoryOplog, MemoryOplogSource, MemorySession, SessionCall};
pub use source::{OpStreams, OplogSource, ReadMode, Session, TailOptions};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation recorded by an oplog entry.
///
/// Serialized as the oplog op code. Codes outside the known set are kept
/// verbatim so they are still counted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    /// Database command (create, drop, applyOps, ...).
    Command,
    /// No-op heartbeat written by the primary.
    Noop,
    /// Any other control entry, e.g. the legacy `db` declaration.
    Other(String),
}

impl Operation {
    /// Oplog op code, used as the `op` label value.
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Insert => "i",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Command => "c",
            Operation::Noop => "n",
            Operation::Other(code) => code,
        }
    }
}

impl From<String> for Operation {
    fn from(code: String) -> Self {
        match code.as_str() {
            "i" => Operation::Insert,
            "u" => Operation::Update,
            "d" => Operation::Delete,
            "c" => Operation::Command,
            "n" => Operation::Noop,
            _ => Operation::Other(code),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Other(code) => code,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed oplog entry. Consumed once, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "ns")]
    pub namespace: String,

    #[serde(rename = "op")]
    pub operation: Operation,

    #[serde(rename = "size")]
    pub data_size: u64,

    /// Set on entries written by chunk migrations rather than by clients.
    #[serde(rename = "fromMigrate", default)]
    pub from_migrate: bool,
}

impl ChangeEvent {
    pub fn new(namespace: impl Into<String>, operation: Operation, data_size: u64) -> Self {
        Self {
            namespace: namespace.into(),
            operation,
            data_size,
            from_migrate: false,
        }
    }

    /// Mark the entry as produced by an internal migration.
    pub fn from_migration(mut self) -> Self {
        self.from_migrate = true;
        self
    }

    pub fn key(&self) -> CounterKey {
        CounterKey {
            namespace: self.namespace.clone(),
            operation: self.operation.clone(),
        }
    }
}

/// Failure reported by the tailing library while reading the oplog.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TailError {
    pub message: String,
}

impl TailError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Partition of the entry count and size counters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CounterKey {
    pub namespace: String,
    pub operation: Operation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_oplog_entry_json() {
        let json = r#"{ "ns": "db.users", "op": "i", "size": 120 }"#;

        let event: ChangeEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.namespace, "db.users");
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.data_size, 120);
        assert!(!event.from_migrate);
    }

    #[test]
    fn migrate_flag_is_read() {
        let json = r#"{ "ns": "db.orders", "op": "d", "size": 8, "fromMigrate": true }"#;

        let event: ChangeEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event, ChangeEvent::new("db.orders", Operation::Delete, 8).from_migration());
    }

    #[test]
    fn unknown_op_code_is_kept_verbatim() {
        let json = r#"{ "ns": "test", "op": "db", "size": 30 }"#;

        let event: ChangeEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.operation, Operation::Other("db".into()));
        assert_eq!(event.operation.as_str(), "db");
        assert_eq!(serde_json::to_string(&event.operation).unwrap(), "\"db\"");
    }

    #[test]
    fn op_codes_match_labels() {
        for op in [
            Operation::Insert,
            Operation::Update,
            Operation::Delete,
            Operation::Command,
            Operation::Noop,
        ] {
            assert_eq!(Operation::from(op.as_str().to_string()), op);
            let encoded = serde_json::to_string(&op).unwrap();
            assert_eq!(encoded, format!("\"{}\"", op.as_str()));
        }
    }

    #[test]
    fn key_partitions_by_namespace_and_op() {
        let a = ChangeEvent::new("db.users", Operation::Insert, 1);
        let b = ChangeEvent::new("db.users", Operation::Insert, 99);
        let c = ChangeEvent::new("db.users", Operation::Update, 1);

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn tail_error_displays_message() {
        let err = TailError::new("connection reset by peer");
        assert_eq!(err.to_string(), "connection reset by peer");
    }
}
