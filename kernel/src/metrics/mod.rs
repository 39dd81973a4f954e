// Oplog Tail Metrics
//
// Counters fed by the tail loop and the read-only collector that
// exposes them to a metrics registry.
//
// Each series is an atomic counter; only the label lookup of the
// per-namespace vectors takes a (read-mostly) lock, so scrapes do not
// serialize against the tail loop.

use std::collections::BTreeSet;
use std::sync::Arc;

use prometheus::core::{Collector, Desc};
use prometheus::proto::{Metric, MetricFamily};
use prometheus::{IntCounter, IntCounterVec, Opts};
use serde::Serialize;

use crate::config::METRIC_SUBSYSTEM;
use crate::log::{ChangeEvent, Operation};

/// Label holding the entry namespace.
pub const NAMESPACE_LABEL: &str = "ns";
/// Label holding the entry op code.
pub const OPERATION_LABEL: &str = "op";

/// Errors produced while building the counters.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Counters for everything observed in the oplog.
pub struct OplogTailMetrics {
    entry_count: IntCounterVec,
    entry_size: IntCounterVec,
    tail_errors: IntCounter,
}

impl OplogTailMetrics {
    /// Build the counters under `<namespace>_oplogtail_*`.
    pub fn new(namespace: &str) -> Result<Self, MetricsError> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(namespace)
                .subsystem(METRIC_SUBSYSTEM)
        };

        let entry_count = IntCounterVec::new(
            opts(
                "entry_count",
                "The total number of entries observed in the oplog by ns/op",
            ),
            &[NAMESPACE_LABEL, OPERATION_LABEL],
        )?;
        let entry_size = IntCounterVec::new(
            opts(
                "entry_size",
                "The total size of entries observed in the oplog by ns/op",
            ),
            &[NAMESPACE_LABEL, OPERATION_LABEL],
        )?;
        let tail_errors = IntCounter::with_opts(opts(
            "tail_error",
            "The total number of errors while tailing the oplog",
        ))?;

        Ok(Self {
            entry_count,
            entry_size,
            tail_errors,
        })
    }

    /// Count one entry and its size.
    pub(crate) fn observe_entry(&self, event: &ChangeEvent) {
        let labels = [event.namespace.as_str(), event.operation.as_str()];
        self.entry_count.with_label_values(&labels).inc();
        self.entry_size.with_label_values(&labels).inc_by(event.data_size);
    }

    pub(crate) fn observe_error(&self) {
        self.tail_errors.inc();
    }

    /// Materialize the current value of every series.
    ///
    /// Values are read from the integer counters directly, so sizes stay
    /// exact beyond the range of the exported float samples.
    pub fn snapshot(&self) -> OplogTailSnapshot {
        let mut keys = BTreeSet::new();
        for family in self.entry_count.collect() {
            for metric in family.get_metric() {
                keys.insert((
                    label_value(metric, NAMESPACE_LABEL).to_string(),
                    label_value(metric, OPERATION_LABEL).to_string(),
                ));
            }
        }

        let entries = keys
            .into_iter()
            .map(|(namespace, operation)| {
                let labels = [namespace.as_str(), operation.as_str()];
                let count = self.entry_count.with_label_values(&labels).get();
                let size = self.entry_size.with_label_values(&labels).get();
                EntrySeries {
                    namespace,
                    operation,
                    count,
                    size,
                }
            })
            .collect();

        OplogTailSnapshot {
            entries,
            tail_errors: self.tail_errors.get(),
        }
    }
}

impl Collector for OplogTailMetrics {
    fn desc(&self) -> Vec<&Desc> {
        self.entry_count
            .desc()
            .into_iter()
            .chain(self.entry_size.desc())
            .chain(self.tail_errors.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.entry_count
            .collect()
            .into_iter()
            .chain(self.entry_size.collect())
            .chain(self.tail_errors.collect())
            .collect()
    }
}

fn label_value<'a>(metric: &'a Metric, name: &str) -> &'a str {
    metric
        .get_label()
        .iter()
        .find(|pair| pair.get_name() == name)
        .map(|pair| pair.get_value())
        .unwrap_or_default()
}

/// Read-only view of the tail counters.
///
/// This is the only surface handed to metric collection; it
/// cannot change any value.
#[derive(Clone)]
pub struct OplogTailExporter {
    metrics: Arc<OplogTailMetrics>,
}

impl OplogTailExporter {
    pub fn new(metrics: Arc<OplogTailMetrics>) -> Self {
        Self { metrics }
    }

    pub fn snapshot(&self) -> OplogTailSnapshot {
        self.metrics.snapshot()
    }
}

impl Collector for OplogTailExporter {
    fn desc(&self) -> Vec<&Desc> {
        self.metrics.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.metrics.collect()
    }
}

/// Totals for one `(ns, op)` series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySeries {
    pub namespace: String,
    pub operation: String,
    pub count: u64,
    pub size: u64,
}

/// Point-in-time values of every tail counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OplogTailSnapshot {
    /// Sorted by namespace, then op code.
    pub entries: Vec<EntrySeries>,
    pub tail_errors: u64,
}

impl OplogTailSnapshot {
    pub fn entry(&self, namespace: &str, operation: Operation) -> Option<&EntrySeries> {
        self.entries
            .iter()
            .find(|s| s.namespace == namespace && s.operation == operation.as_str())
    }

    /// Sum of all entry counts.
    pub fn total_entries(&self) -> u64 {
        self.entries.iter().map(|s| s.count).sum()
    }
}
