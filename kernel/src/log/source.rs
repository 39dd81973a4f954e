// Oplog Collaborator Interfaces
//
// Contracts for the database session and the tailing library
// that turns a configured session into streams of entries.
//
// This module defines *interfaces only*.

use std::time::Duration;

use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use super::{ChangeEvent, TailError};

/// Read consistency requested from the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Reads may go to any member, in any order.
    Eventual,
    /// Reads may start on a secondary and stick to the primary after the first write.
    Monotonic,
    /// All reads go to the primary.
    Strong,
}

/// An authenticated, connected database session.
///
/// Implementations MUST:
/// - Return an independent session from `duplicate`
/// - Tolerate standalone nodes that are not part of a replica set
pub trait Session: Send + 'static {
    /// Create a private copy sharing the same credentials and topology.
    fn duplicate(&self) -> Self
    where
        Self: Sized;

    fn set_socket_timeout(&mut self, timeout: Duration);

    fn set_read_mode(&mut self, mode: ReadMode);

    /// Name of the replication log collection, as reported by the topology.
    ///
    /// Returns `None` when the node cannot answer (e.g. it has not joined
    /// a replica set).
    fn oplog_collection_name(&self) -> Option<String>;

    /// Release the underlying connection.
    fn close(&mut self);
}

/// Options handed to the tailing library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailOptions {
    /// Include entries generated by chunk migrations.
    pub include_migrations: bool,
    pub oplog_collection_name: String,
}

/// Live entry and error streams produced by a started tailer.
///
/// Dropping the streams stops the tailer.
pub struct OpStreams {
    pub ops: BoxStream<'static, ChangeEvent>,
    pub errors: BoxStream<'static, TailError>,
}

impl OpStreams {
    /// Streams that end immediately.
    pub fn empty() -> Self {
        Self {
            ops: Box::pin(stream::empty()),
            errors: Box::pin(stream::empty()),
        }
    }
}

/// Tailing library: reconnects, tracks the oplog position and parses
/// raw entries into [`ChangeEvent`]s.
pub trait OplogSource: Send + Sync + 'static {
    type Session: Session;

    /// Start tailing on a configured session.
    fn start(&self, session: &Self::Session, options: &TailOptions) -> OpStreams;
}
