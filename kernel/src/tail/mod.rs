// Oplog Tail Loop
//
// Drains the entry and error streams of an oplog reader into the
// tail counters until the streams end or the loop is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::adapters::oplog::OplogReader;
use crate::log::{ChangeEvent, OpStreams, Session, TailError};
use crate::metrics::OplogTailMetrics;

/// Why a tail loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailExit {
    /// The loop's cancellation token fired.
    Cancelled,
    /// Both the entry and the error stream ended.
    SourceClosed,
}

/// Time of the last item received from either stream.
#[derive(Debug, Default)]
pub struct Heartbeat {
    last_millis: AtomicU64,
}

impl Heartbeat {
    pub fn beat(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    /// `None` until the first item arrives.
    pub fn last(&self) -> Option<SystemTime> {
        match self.last_millis.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(UNIX_EPOCH + Duration::from_millis(millis)),
        }
    }
}

/// Consumes oplog streams and updates the tail counters.
pub struct TailLoop {
    metrics: Arc<OplogTailMetrics>,
    heartbeat: Arc<Heartbeat>,
}

impl TailLoop {
    pub fn new(metrics: Arc<OplogTailMetrics>, heartbeat: Arc<Heartbeat>) -> Self {
        Self { metrics, heartbeat }
    }

    /// Tail `reader` until both of its streams end or `cancel` fires.
    ///
    /// The reader, and with it the session, is released on return.
    pub async fn run<S: Session>(
        &self,
        mut reader: OplogReader<S>,
        cancel: CancellationToken,
    ) -> TailExit {
        let exit = self.drain(reader.streams_mut(), &cancel).await;
        match exit {
            TailExit::Cancelled => info!(collection = reader.collection(), "oplog tail cancelled"),
            TailExit::SourceClosed => {
                warn!(collection = reader.collection(), "oplog streams ended")
            }
        }
        exit
    }

    /// Multiplex both streams; whichever has an item ready is handled next.
    async fn drain(&self, streams: &mut OpStreams, cancel: &CancellationToken) -> TailExit {
        let OpStreams { ops, errors } = streams;
        let mut ops_open = true;
        let mut errors_open = true;

        while ops_open || errors_open {
            tokio::select! {
                _ = cancel.cancelled() => return TailExit::Cancelled,
                err = errors.next(), if errors_open => match err {
                    Some(err) => self.record_error(&err),
                    None => {
                        debug!("oplog error stream ended");
                        errors_open = false;
                    }
                },
                op = ops.next(), if ops_open => match op {
                    Some(event) => self.record_event(&event),
                    None => {
                        debug!("oplog entry stream ended");
                        ops_open = false;
                    }
                },
            }
        }

        TailExit::SourceClosed
    }

    pub fn record_event(&self, event: &ChangeEvent) {
        trace!(ns = %event.namespace, op = %event.operation, size = event.data_size, "oplog entry");
        self.metrics.observe_entry(event);
        self.heartbeat.beat();
    }

    pub fn record_error(&self, err: &TailError) {
        self.metrics.observe_error();
        self.heartbeat.beat();
        error!(error = %err, "error getting entry from oplog");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TailConfig;
    use crate::log::{MemoryOplog, MemoryOplogSource, MemorySession, Operation, SessionCall};
    use crate::metrics::OplogTailSnapshot;

    fn tail_loop() -> (TailLoop, Arc<OplogTailMetrics>, Arc<Heartbeat>) {
        let metrics = Arc::new(OplogTailMetrics::new("mongodb").unwrap());
        let heartbeat = Arc::new(Heartbeat::default());
        let tail = TailLoop::new(Arc::clone(&metrics), Arc::clone(&heartbeat));
        (tail, metrics, heartbeat)
    }

    /// Run a loop over everything pushed to `oplog` so far.
    async fn replay(
        oplog: MemoryOplog,
        source: MemoryOplogSource,
    ) -> (TailExit, OplogTailSnapshot, MemorySession) {
        drop(oplog);
        let (tail, metrics, _) = tail_loop();
        let session = MemorySession::standalone("test");
        let reader = OplogReader::open(session.duplicate(), &source, &TailConfig::default_config());

        let exit = tail.run(reader, CancellationToken::new()).await;
        (exit, metrics.snapshot(), session)
    }

    #[tokio::test]
    async fn counts_entries_per_namespace_and_op() {
        let (oplog, source) = MemoryOplog::channel();
        for _ in 0..3 {
            oplog.push_op(ChangeEvent::new("db.users", Operation::Insert, 120));
        }
        oplog.push_op(ChangeEvent::new("db.orders", Operation::Update, 50));

        let (exit, snap, _) = replay(oplog, source).await;

        assert_eq!(exit, TailExit::SourceClosed);
        let users = snap.entry("db.users", Operation::Insert).unwrap();
        assert_eq!((users.count, users.size), (3, 360));
        let orders = snap.entry("db.orders", Operation::Update).unwrap();
        assert_eq!((orders.count, orders.size), (1, 50));
        assert_eq!(snap.tail_errors, 0);
    }

    #[tokio::test]
    async fn errors_only_bump_error_counter() {
        let (oplog, source) = MemoryOplog::channel();
        oplog.push_error(TailError::new("cursor killed"));
        oplog.push_error(TailError::new("connection reset"));

        let (_, snap, _) = replay(oplog, source).await;

        assert_eq!(snap.tail_errors, 2);
        assert!(snap.entries.is_empty());
    }

    #[tokio::test]
    async fn every_item_is_counted_once() {
        let (oplog, source) = MemoryOplog::channel();
        let mut sizes = 0;
        for i in 0..200u64 {
            if i % 7 == 0 {
                oplog.push_error(TailError::new(format!("transient {i}")));
            } else {
                let op = if i % 2 == 0 { Operation::Insert } else { Operation::Delete };
                oplog.push_op(ChangeEvent::new(format!("db.c{}", i % 5), op, i));
                sizes += i;
            }
        }

        let (_, snap, _) = replay(oplog, source).await;

        assert_eq!(snap.total_entries() + snap.tail_errors, 200);
        assert_eq!(snap.tail_errors, 29);
        assert_eq!(snap.entries.iter().map(|s| s.size).sum::<u64>(), sizes);
    }

    #[tokio::test]
    async fn migration_entries_are_counted() {
        let (oplog, source) = MemoryOplog::channel();
        oplog.push_op(ChangeEvent::new("db.chunks", Operation::Insert, 10).from_migration());
        oplog.push_op(ChangeEvent::new("db.chunks", Operation::Delete, 10).from_migration());

        let (_, snap, _) = replay(oplog, source).await;

        assert_eq!(snap.total_entries(), 2);
    }

    #[tokio::test]
    async fn unknown_op_codes_are_counted() {
        let (oplog, source) = MemoryOplog::channel();
        oplog.push_op(ChangeEvent::new("test", Operation::Other("db".into()), 30));
        oplog.push_op(ChangeEvent::new("test.users", Operation::Insert, 10));

        let (_, snap, _) = replay(oplog, source).await;

        let legacy = snap.entry("test", Operation::Other("db".into())).unwrap();
        assert_eq!((legacy.count, legacy.size), (1, 30));
        assert_eq!(snap.total_entries(), 2);
    }

    #[tokio::test]
    async fn session_is_closed_when_loop_returns() {
        let (oplog, source) = MemoryOplog::channel();

        let (_, _, session) = replay(oplog, source).await;

        assert_eq!(
            session.calls_for("test/copy").last(),
            Some(&SessionCall::Close)
        );
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_loop() {
        let (_oplog, source) = MemoryOplog::channel();
        let (tail, _, heartbeat) = tail_loop();
        let session = MemorySession::standalone("idle");
        let reader = OplogReader::open(session.duplicate(), &source, &TailConfig::default_config());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let exit = tail.run(reader, cancel).await;

        assert_eq!(exit, TailExit::Cancelled);
        assert_eq!(heartbeat.last(), None);
    }

    #[test]
    fn heartbeat_records_activity() {
        let (tail, _, heartbeat) = tail_loop();
        assert!(heartbeat.last().is_none());

        tail.record_event(&ChangeEvent::new("db.a", Operation::Noop, 0));

        assert!(heartbeat.last().is_some());
    }
}
