//! Network Security Monitor - Main Entry Point

mod logic;
pub mod constants;

use std::path::PathBuf;
use std::sync::Arc;

use logic::capture::{JsonlReplaySource, PacketSource};
use logic::config::MonitorConfig;
use logic::pipeline::Pipeline;
use logic::response::backends::system_backends;
use logic::storage::EventStore;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting Network Security Monitor...");

    if let Err(e) = run() {
        log::error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Usage: net-security-core [config.json] <capture.jsonl>
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (cfg, capture_path) = match args.as_slice() {
        [capture] => (MonitorConfig::default(), PathBuf::from(capture)),
        [config, capture] => (
            MonitorConfig::load(&PathBuf::from(config))?,
            PathBuf::from(capture),
        ),
        _ => {
            eprintln!("usage: net-security-core [config.json] <capture.jsonl>");
            std::process::exit(2);
        }
    };

    cfg.validate()?;
    if cfg.dry_run {
        log::info!("Dry-run mode: enforcement backends will not be touched");
    }

    let source: Box<dyn PacketSource> = Box::new(JsonlReplaySource::open(&capture_path)?);
    let backends = system_backends(cfg.quarantine_vlan_id, &cfg.bandwidth_limit);
    let store = Arc::new(match &cfg.db_path {
        Some(path) => EventStore::open(path)?,
        None => EventStore::open_default()?,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let started_at = chrono::Utc::now();
        let mut pipeline = Pipeline::start(cfg, source, backends, vec![], store)?;
        let status = pipeline.status_handle();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupt received");
            }
            _ = pipeline.finished() => {
                log::info!("Capture drained");
            }
        }

        pipeline.shutdown().await;

        let summary = status.status();
        log::info!(
            "Session summary: {} packets, {} vectors, {} incidents, {} actions requested",
            summary.packets_seen,
            summary.vectors_emitted,
            summary.incidents_total,
            summary.actions_requested
        );

        let audit = status.export(started_at);
        log::info!(
            "Audit log: {} incident transitions, {} action records this session",
            audit["incident_count"],
            audit["action_count"]
        );
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
