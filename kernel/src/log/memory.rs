// In-Memory Oplog Collaborators
//
// Channel-backed session and tailer used by the dry-run CLI and
// by tests. The session journals every call it receives so callers
// can verify which connection was touched and how.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::source::{OpStreams, OplogSource, ReadMode, Session, TailOptions};
use super::{ChangeEvent, TailError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call received by a [`MemorySession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Duplicate,
    SetSocketTimeout(Duration),
    SetReadMode(ReadMode),
    Close,
}

type Journal = Arc<Mutex<Vec<(String, SessionCall)>>>;

/// Session that records calls instead of talking to a server.
///
/// Duplicates are labelled `<label>/copy` and share the journal of
/// the session they were copied from.
#[derive(Debug)]
pub struct MemorySession {
    label: String,
    oplog_name: Option<String>,
    journal: Journal,
}

impl MemorySession {
    /// A node that has not joined a replica set.
    pub fn standalone(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            oplog_name: None,
            journal: Journal::default(),
        }
    }

    /// A replica set member reporting `oplog_name` as its log collection.
    pub fn replica_set(label: impl Into<String>, oplog_name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            oplog_name: Some(oplog_name.into()),
            journal: Journal::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Every call recorded so far, tagged with the receiving session's label.
    pub fn journal(&self) -> Vec<(String, SessionCall)> {
        lock(&self.journal).clone()
    }

    /// Calls received by the session labelled `label`.
    pub fn calls_for(&self, label: &str) -> Vec<SessionCall> {
        lock(&self.journal)
            .iter()
            .filter(|(owner, _)| owner == label)
            .map(|(_, call)| call.clone())
            .collect()
    }

    fn record(&self, call: SessionCall) {
        lock(&self.journal).push((self.label.clone(), call));
    }
}

impl Session for MemorySession {
    fn duplicate(&self) -> Self {
        self.record(SessionCall::Duplicate);
        Self {
            label: format!("{}/copy", self.label),
            oplog_name: self.oplog_name.clone(),
            journal: Arc::clone(&self.journal),
        }
    }

    fn set_socket_timeout(&mut self, timeout: Duration) {
        self.record(SessionCall::SetSocketTimeout(timeout));
    }

    fn set_read_mode(&mut self, mode: ReadMode) {
        self.record(SessionCall::SetReadMode(mode));
    }

    fn oplog_collection_name(&self) -> Option<String> {
        self.oplog_name.clone()
    }

    fn close(&mut self) {
        self.record(SessionCall::Close);
    }
}

/// Producer side of an in-memory oplog.
///
/// Dropping it ends both streams handed out by the paired source.
#[derive(Debug, Clone)]
pub struct MemoryOplog {
    ops: mpsc::UnboundedSender<ChangeEvent>,
    errors: mpsc::UnboundedSender<TailError>,
}

impl MemoryOplog {
    /// Create a producer and the tailer that reads from it.
    pub fn channel() -> (MemoryOplog, MemoryOplogSource) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let producer = MemoryOplog {
            ops: ops_tx,
            errors: errors_tx,
        };
        let source = MemoryOplogSource {
            receivers: Mutex::new(Some((ops_rx, errors_rx))),
            started_with: Mutex::new(None),
        };
        (producer, source)
    }

    /// Append an entry. Returns `false` once the tailer has been dropped.
    pub fn push_op(&self, event: ChangeEvent) -> bool {
        self.ops.send(event).is_ok()
    }

    /// Report a read failure. Returns `false` once the tailer has been dropped.
    pub fn push_error(&self, error: TailError) -> bool {
        self.errors.send(error).is_ok()
    }
}

type Receivers = (
    mpsc::UnboundedReceiver<ChangeEvent>,
    mpsc::UnboundedReceiver<TailError>,
);

/// Tailer over a [`MemoryOplog`]. Can be started once.
#[derive(Debug)]
pub struct MemoryOplogSource {
    receivers: Mutex<Option<Receivers>>,
    started_with: Mutex<Option<TailOptions>>,
}

impl MemoryOplogSource {
    /// Options passed to the first `start`, if any.
    pub fn started_with(&self) -> Option<TailOptions> {
        lock(&self.started_with).clone()
    }
}

impl OplogSource for MemoryOplogSource {
    type Session = MemorySession;

    fn start(&self, session: &MemorySession, options: &TailOptions) -> OpStreams {
        let Some((ops_rx, errors_rx)) = lock(&self.receivers).take() else {
            debug!(session = session.label(), "memory oplog already consumed");
            return OpStreams::empty();
        };
        *lock(&self.started_with) = Some(options.clone());

        let include_migrations = options.include_migrations;
        let ops = stream::unfold(ops_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .filter(move |event| futures::future::ready(include_migrations || !event.from_migrate));
        let errors = stream::unfold(errors_rx, |mut rx| async move {
            rx.recv().await.map(|error| (error, rx))
        });

        OpStreams {
            ops: ops.boxed(),
            errors: errors.boxed(),
        }
    }
}
