// Oplog Tail Lifecycle
//
// Owns the tail counters and starts at most one tail loop. The
// object is built once by the process and shared by reference;
// dropping it cancels the loop.

use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use prometheus::Registry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::adapters::oplog::OplogReader;
use crate::config::{ConfigError, TailConfig};
use crate::log::{OplogSource, Session};
use crate::metrics::{MetricsError, OplogTailExporter, OplogTailMetrics};
use crate::tail::{Heartbeat, TailExit, TailLoop};

/// Errors produced while building the tailer or waiting on its loop.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("tail task ended without reporting an exit")]
    Aborted,
}

/// The one running tail loop.
pub struct TailHandle {
    id: Uuid,
    cancel: CancellationToken,
    heartbeat: Arc<Heartbeat>,
    /// Set by the task when the loop returns.
    exit: watch::Receiver<Option<TailExit>>,
}

impl TailHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `false` once the loop has returned or its task has died.
    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none() && self.exit.has_changed().is_ok()
    }

    /// When the loop last received an entry or an error.
    pub fn last_activity(&self) -> Option<SystemTime> {
        self.heartbeat.last()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the loop to return.
    ///
    /// Any number of callers may wait; dropping a wait has no effect on
    /// the loop.
    pub async fn finished(&self) -> Result<TailExit, LifecycleError> {
        let mut exit = self.exit.clone();
        let exit = match exit.wait_for(Option::is_some).await {
            Ok(state) => *state,
            Err(_) => None,
        };
        exit.ok_or(LifecycleError::Aborted)
    }

    /// Cancel the loop and wait for it to return.
    pub async fn stop(&self) -> Result<TailExit, LifecycleError> {
        self.cancel();
        self.finished().await
    }
}

/// Oplog tail statistics for one process.
///
/// The first call to [`get_or_start`](Self::get_or_start) starts the
/// loop. Later calls return the same handle and ignore their session,
/// so the tailer cannot be pointed elsewhere once started.
pub struct OplogTailStats<O: OplogSource> {
    source: Arc<O>,
    config: TailConfig,
    metrics: Arc<OplogTailMetrics>,
    shutdown: CancellationToken,
    handle: OnceLock<Arc<TailHandle>>,
}

impl<O: OplogSource> OplogTailStats<O> {
    pub fn new(source: O, config: TailConfig) -> Result<Self, LifecycleError> {
        config.validate()?;
        let metrics = OplogTailMetrics::new(&config.metric_namespace)?;

        Ok(Self {
            source: Arc::new(source),
            config,
            metrics: Arc::new(metrics),
            shutdown: CancellationToken::new(),
            handle: OnceLock::new(),
        })
    }

    /// Return the tail loop, starting it on a copy of `session` if needed.
    ///
    /// Must be called from within a tokio runtime. Returns without
    /// waiting for the loop to read anything.
    pub fn get_or_start(&self, session: &O::Session) -> Arc<TailHandle> {
        if let Some(handle) = self.handle.get() {
            debug!(tailer = %handle.id(), "oplog tailer already started, ignoring session");
            return Arc::clone(handle);
        }
        Arc::clone(self.handle.get_or_init(|| self.start(session)))
    }

    fn start(&self, session: &O::Session) -> Arc<TailHandle> {
        let id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let heartbeat = Arc::new(Heartbeat::default());

        // Tail on a private copy so the caller's session keeps its settings.
        let copy = session.duplicate();
        let source = Arc::clone(&self.source);
        let config = self.config.clone();
        let tail = TailLoop::new(Arc::clone(&self.metrics), Arc::clone(&heartbeat));
        let loop_cancel = cancel.clone();
        let (exit_tx, exit) = watch::channel(None);

        tokio::spawn(
            async move {
                let reader = OplogReader::open(copy, source.as_ref(), &config);
                let exit = tail.run(reader, loop_cancel).await;
                exit_tx.send_replace(Some(exit));
            }
            .instrument(info_span!("oplog_tail", tailer = %id)),
        );
        info!(tailer = %id, "oplog tailer started");

        Arc::new(TailHandle {
            id,
            cancel,
            heartbeat,
            exit,
        })
    }

    /// The running loop, if one was started.
    pub fn handle(&self) -> Option<Arc<TailHandle>> {
        self.handle.get().cloned()
    }

    pub fn exporter(&self) -> OplogTailExporter {
        OplogTailExporter::new(Arc::clone(&self.metrics))
    }

    /// Register the tail counters with `registry`.
    pub fn register(&self, registry: &Registry) -> Result<(), MetricsError> {
        registry.register(Box::new(self.exporter()))?;
        Ok(())
    }

    pub fn source(&self) -> &O {
        &self.source
    }
}

impl<O: OplogSource> Drop for OplogTailStats<O> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
