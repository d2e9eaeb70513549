//! dbsamplerd - database sampling daemon.
//!
//! Loads query packs from a directory, connects the configured PostgreSQL
//! sessions, registers samplers from a JSON file and logs a summary of every
//! sampler's latest snapshot.

mod packs;
mod sessions;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use dbsampler_core::{
    CollectorRegistry, CollectorResult, CollectorRunner, PackSource, SamplerDefinition,
    SamplerManager, Sanitizer, SnapshotLookup,
};

use packs::JsonDirSource;
use sessions::{PgSessionProvider, SessionSpec};

// ============================================================
// CLI
// ============================================================

/// Database sampling daemon.
#[derive(Parser)]
#[command(
    name = "dbsamplerd",
    about = "Runs scheduled collector samplers against database sessions",
    version = dbsampler_core::VERSION
)]
struct Args {
    /// Directory with query pack JSON files.
    #[arg(long, env = "DBSAMPLER_PACKS", default_value = "./packs")]
    packs: PathBuf,

    /// JSON file with the samplers to register (a list of sampler definitions
    /// with a "session" field).
    #[arg(long, env = "DBSAMPLER_SAMPLERS")]
    samplers: PathBuf,

    /// Database session as name=dbtype:connection-string. Repeatable.
    #[arg(
        long = "session",
        env = "DBSAMPLER_SESSION",
        value_delimiter = ';',
        value_parser = SessionSpec::parse,
        required = true
    )]
    sessions: Vec<SessionSpec>,

    /// Seconds between snapshot summaries in the log.
    #[arg(long, env = "DBSAMPLER_REPORT_INTERVAL", default_value = "30")]
    report_interval: u64,

    /// Seconds between query pack reloads (0 disables reloading).
    #[arg(long, env = "DBSAMPLER_RELOAD_INTERVAL", default_value = "0")]
    reload_interval: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// One entry of the samplers file.
#[derive(Debug, Deserialize)]
struct SamplerEntry {
    session: String,
    #[serde(flatten)]
    definition: SamplerDefinition,
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            process::exit(1);
        }
    };

    if let Err(msg) = runtime.block_on(async_main(args)) {
        error!("{}", msg);
        process::exit(1);
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["dbsamplerd", "dbsampler_core"] {
        match format!("{target}={level}").parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("invalid log directive for {target}: {e}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn async_main(args: Args) -> Result<(), String> {
    info!(version = dbsampler_core::VERSION, "dbsamplerd starting");

    // Query packs
    let source = Arc::new(JsonDirSource::new(&args.packs));
    let packs = source
        .load()
        .map_err(|e| format!("failed to load query packs: {e}"))?;
    let registry = Arc::new(
        CollectorRegistry::new(packs).map_err(|e| format!("invalid query pack: {e}"))?,
    );
    info!(
        dir = %source.dir().display(),
        packs = registry.packs().len(),
        "query packs loaded"
    );

    // Sessions
    let provider = Arc::new(PgSessionProvider::new(args.sessions.clone())?);
    info!(sessions = ?provider.names(), "sessions configured");

    let runner = CollectorRunner::new(registry.clone(), Sanitizer::default());
    let manager = SamplerManager::new(runner, provider.clone());

    // Samplers
    for entry in read_samplers(&args.samplers)? {
        let sampler_id = entry.definition.sampler_id.clone();
        match manager.upsert_sampler(&entry.session, &sampler_id, entry.definition) {
            Ok(report) => info!(
                session = %entry.session,
                sampler = %sampler_id,
                status = ?report.status,
                "sampler registered"
            ),
            Err(e) => warn!(
                session = %entry.session,
                sampler = %sampler_id,
                error = %e,
                "sampler rejected"
            ),
        }
    }

    // Shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let tx = shutdown_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        let _ = tx.send(true);
    }) {
        warn!(error = %e, "failed to set Ctrl-C handler");
    }

    let mut report_tick = interval(Duration::from_secs(args.report_interval.max(1)));
    report_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reload_tick = interval(Duration::from_secs(args.reload_interval.max(1)));
    reload_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Both intervals fire immediately; the first reload would re-read what was just loaded.
    reload_tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = report_tick.tick() => report(&manager),
            _ = reload_tick.tick(), if args.reload_interval > 0 => {
                let registry = registry.clone();
                let source = source.clone();
                let res = tokio::task::spawn_blocking(move || registry.reload(source.as_ref())).await;
                match res {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "query pack reload failed, keeping previous packs"),
                    Err(e) => error!(error = %e, "query pack reload panicked"),
                }
            }
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    for session in provider.names() {
        let stopped = manager.teardown_session(&session);
        provider.remove(&session);
        info!(session = %session, samplers = stopped, "session torn down");
    }
    manager.shutdown();
    info!("Shutdown complete");
    Ok(())
}

fn read_samplers(path: &Path) -> Result<Vec<SamplerEntry>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read samplers file {}: {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse samplers file {}: {}", path.display(), e))
}

// ============================================================
// Reporting
// ============================================================

fn report(manager: &SamplerManager) {
    for session in manager.session_ids() {
        for sampler in manager.list_sampler_ids(&session) {
            match manager.get_snapshot(&session, &sampler) {
                SnapshotLookup::Ready(entry) => {
                    let failures = manager
                        .get_sampler_status(&session, &sampler)
                        .map(|s| s.consecutive_failures)
                        .unwrap_or(0);
                    info!(
                        session = %session,
                        sampler = %sampler,
                        captured_at = %entry.captured_at.format("%H:%M:%S"),
                        consecutive_failures = failures,
                        "{}",
                        describe_result(&entry.result)
                    );
                }
                SnapshotLookup::Pending => {
                    debug!(session = %session, sampler = %sampler, "no snapshot yet")
                }
                SnapshotLookup::Stopped { reason } => warn!(
                    session = %session,
                    sampler = %sampler,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "sampler stopped"
                ),
                SnapshotLookup::NotFound => {}
            }
        }
    }
}

/// Describes the contents of a collector result for logging.
fn describe_result(result: &CollectorResult) -> String {
    let mut parts: Vec<String> = result
        .layers
        .iter()
        .map(|layer| match &layer.error {
            Some(_) => format!("{}: failed", layer.name),
            None => format!("{}: {} rows", layer.name, layer.rows.len()),
        })
        .collect();
    if !result.queries.is_empty() {
        parts.push(format!("{} queries", result.queries.len()));
    }

    format!(
        "{} [{}] in {}ms",
        result.collector_ref,
        parts.join(", "),
        result.duration_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_entry_flattens_definition() {
        let entries: Vec<SamplerEntry> = serde_json::from_str(
            r#"[{
                "session": "main",
                "sampler_id": "top",
                "schedule": {"type": "interval", "interval_sec": 5},
                "target": {"collector_ref": "pg-core:top"}
            }]"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session, "main");
        assert_eq!(entries[0].definition.sampler_id, "top");
        assert_eq!(
            entries[0].definition.target.collector_ref.as_deref(),
            Some("pg-core:top")
        );
    }

    #[test]
    fn test_example_samplers_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../samplers.example.json");
        let entries = read_samplers(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.session == "main"));
        assert_eq!(entries[1].definition.target.collector_id.as_deref(), Some("statements"));
    }

    #[test]
    fn test_args_parse_sessions() {
        let args = Args::try_parse_from([
            "dbsamplerd",
            "--samplers",
            "samplers.json",
            "--session",
            "main=postgres:host=db",
            "--session",
            "replica=postgres:host=replica",
        ])
        .unwrap();
        assert_eq!(args.sessions.len(), 2);
        assert_eq!(args.sessions[1].name, "replica");
        assert_eq!(args.report_interval, 30);
    }
}
