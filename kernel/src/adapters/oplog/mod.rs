// Oplog Reader Adapter
//
// Owns a private session, configures it for long-lived streaming
// reads and starts the tailing library against it.

use tracing::info;

use crate::config::{TailConfig, FALLBACK_OPLOG_COLLECTION};
use crate::log::{OpStreams, OplogSource, Session, TailOptions};

/// A configured session together with the streams tailing it.
///
/// On drop the streams are released before the session is closed.
pub struct OplogReader<S: Session> {
    session: S,
    streams: OpStreams,
    collection: String,
}

impl<S: Session> OplogReader<S> {
    /// Configure `session` and start tailing it.
    ///
    /// The session should be a private copy: the reader changes its
    /// timeout and read mode, and closes it when dropped.
    pub fn open<O>(mut session: S, source: &O, config: &TailConfig) -> Self
    where
        O: OplogSource<Session = S>,
    {
        session.set_socket_timeout(config.socket_timeout());
        session.set_read_mode(config.read_mode);

        let collection = resolve_collection_name(&session, config);
        let options = TailOptions {
            include_migrations: config.include_migrations,
            oplog_collection_name: collection.clone(),
        };

        info!(
            collection = %collection,
            include_migrations = options.include_migrations,
            "starting oplog tail"
        );
        let streams = source.start(&session, &options);

        Self {
            session,
            streams,
            collection,
        }
    }

    /// Resolved name of the collection being tailed.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn streams_mut(&mut self) -> &mut OpStreams {
        &mut self.streams
    }
}

impl<S: Session> Drop for OplogReader<S> {
    fn drop(&mut self) {
        drop(std::mem::replace(&mut self.streams, OpStreams::empty()));
        self.session.close();
    }
}

/// Configured override, then the topology's answer, then `oplog.rs`.
///
/// Standalone nodes cannot report a replication log, so this never fails.
fn resolve_collection_name<S: Session>(session: &S, config: &TailConfig) -> String {
    config
        .oplog_collection_name
        .clone()
        .or_else(|| session.oplog_collection_name())
        .unwrap_or_else(|| FALLBACK_OPLOG_COLLECTION.to_string())
}
