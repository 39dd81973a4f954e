use std::fs;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oplogtail_kernel::log::{ChangeEvent, MemoryOplog, MemorySession, TailError};
use oplogtail_kernel::metrics::OplogTailSnapshot;
use oplogtail_kernel::tail::TailExit;
use oplogtail_kernel::{OplogTailStats, TailConfig};

/// Oplog tail statistics CLI
#[derive(Parser, Debug)]
#[command(name = "oplogtail")]
#[command(about = "Replay a recorded oplog through the tail counters (dry-run)", long_about = None)]
struct Cli {
    /// Path to tailer config JSON
    #[arg(long)]
    config: Option<String>,

    /// Path to recorded oplog JSON
    #[arg(long)]
    entries: String,

    /// Replica set of the simulated node (standalone if omitted)
    #[arg(long)]
    replica_set: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Prometheus)]
    format: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Prometheus,
    Json,
}

/// One recorded oplog read: an entry or a read failure.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordedEntry {
    Error { error: String },
    Op(ChangeEvent),
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    tailer: String,
    exit: TailExit,
    stats: OplogTailSnapshot,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    // ----------------------------
    // Load config
    // ----------------------------
    let config = if let Some(path) = &cli.config {
        TailConfig::from_json(&fs::read_to_string(path)?)?
    } else {
        TailConfig::default_config()
    };

    // ----------------------------
    // Load recorded oplog
    // ----------------------------
    let data = fs::read_to_string(&cli.entries)?;
    let entries: Vec<RecordedEntry> = serde_json::from_str(&data)?;

    let (oplog, source) = MemoryOplog::channel();
    for entry in entries {
        let accepted = match entry {
            RecordedEntry::Op(event) => oplog.push_op(event),
            RecordedEntry::Error { error } => oplog.push_error(TailError::new(error)),
        };
        if !accepted {
            warn!("oplog tailer is gone, dropping remaining entries");
            break;
        }
    }
    drop(oplog);

    let session = match &cli.replica_set {
        Some(name) => MemorySession::replica_set(name.as_str(), "oplog.rs"),
        None => MemorySession::standalone("standalone"),
    };

    // ----------------------------
    // Tail until the recording is drained
    // ----------------------------
    let stats = OplogTailStats::new(source, config)?;
    let registry = Registry::new();
    stats.register(&registry)?;

    let handle = stats.get_or_start(&session);
    let exit = handle.finished().await?;
    info!(tailer = %handle.id(), ?exit, "oplog replay finished");

    // ----------------------------
    // Output
    // ----------------------------
    match cli.format {
        OutputFormat::Prometheus => {
            let mut buffer = Vec::new();
            TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
            print!("{}", String::from_utf8(buffer)?);
        }
        OutputFormat::Json => {
            let output = CliOutput {
                tailer: handle.id().to_string(),
                exit,
                stats: stats.exporter().snapshot(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oplogtail_kernel::log::Operation;

    #[test]
    fn recorded_entries_parse_as_ops_or_errors() {
        let json = r#"
        [
          { "ns": "db.users", "op": "i", "size": 120 },
          { "error": "connection reset" },
          { "ns": "config.chunks", "op": "u", "size": 64, "fromMigrate": true }
        ]
        "#;

        let entries: Vec<RecordedEntry> = serde_json::from_str(json).unwrap();

        assert_eq!(entries.len(), 3);
        assert!(matches!(
            &entries[0],
            RecordedEntry::Op(event) if event.operation == Operation::Insert
        ));
        assert!(matches!(&entries[1], RecordedEntry::Error { error } if error == "connection reset"));
        assert!(matches!(&entries[2], RecordedEntry::Op(event) if event.from_migrate));
    }

    #[test]
    fn unknown_op_codes_do_not_reject_the_recording() {
        let json = r#"
        [
          { "ns": "test", "op": "db", "size": 30 },
          { "ns": "db.users", "op": "i", "size": 120 }
        ]
        "#;

        let entries: Vec<RecordedEntry> = serde_json::from_str(json).unwrap();

        assert!(matches!(
            &entries[0],
            RecordedEntry::Op(event) if event.operation == Operation::Other("db".into())
        ));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn cli_requires_entries() {
        assert!(Cli::try_parse_from(["oplogtail"]).is_err());

        let cli = Cli::try_parse_from(["oplogtail", "--entries", "oplog.json", "--format", "json"])
            .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.replica_set, None);
    }
}
