#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, info_span, Instrument};

use trawl_artifact_store::ArtifactStore;
use trawl_coordinator::http::{router, AppState};
use trawl_coordinator::state::{CollectorConfig, CollectorState};
use trawl_core::config::CollectionPlan;
use trawl_observe::time::unix_time_ms;

#[derive(Debug, Parser)]
#[command(name = "trawl-coordinator")]
struct Args {
    /// Address to bind the coordinator HTTP server.
    #[arg(long, env = "TRAWL_COORD_BIND_ADDR", default_value = "0.0.0.0:5000")]
    addr: SocketAddr,

    /// Root directory artifacts are stored under.
    #[arg(long, env = "TRAWL_ARTIFACT_ROOT")]
    artifact_root: PathBuf,

    /// JSON work-item list (id plus ordered page URLs), read once at startup.
    #[arg(long, env = "TRAWL_WORK_ITEMS")]
    work_items: PathBuf,

    /// JSON identity list (relay plus obfuscation flag), read once at startup.
    #[arg(long, env = "TRAWL_IDENTITIES")]
    identities: PathBuf,

    /// Samples to collect per (work item, identity) cell.
    #[arg(long, env = "TRAWL_SAMPLES", default_value_t = 100)]
    samples: u32,

    /// Visits a client performs per identity before re-registering.
    #[arg(long, env = "TRAWL_VISITS", default_value_t = 10)]
    visits: u32,

    /// Work-lease staleness deadline.
    #[arg(long, env = "TRAWL_LEASE_TTL_MS", default_value_t = 300_000)]
    lease_ttl_ms: u64,

    /// Interval between lease-expiry sweeps.
    #[arg(long, env = "TRAWL_SWEEP_INTERVAL_MS", default_value_t = 30_000)]
    sweep_interval_ms: u64,

    /// Inline gate: smallest acceptable capture upload.
    #[arg(long, env = "TRAWL_MIN_CAPTURE_BYTES", default_value_t = 30 * 1024)]
    min_capture_bytes: u64,

    /// Inline gate: largest acceptable capture upload.
    #[arg(long, env = "TRAWL_MAX_CAPTURE_BYTES", default_value_t = 1500 * 1024)]
    max_capture_bytes: u64,

    /// Inline gate: smallest acceptable verification image upload.
    #[arg(long, env = "TRAWL_MIN_SNAPSHOT_BYTES", default_value_t = 30 * 1024)]
    min_snapshot_bytes: u64,

    /// Optional: periodically emit a metrics snapshot to logs.
    #[arg(long, env = "TRAWL_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 0)]
    metrics_snapshot_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    trawl_observe::logging::init_tracing();

    let args = Args::parse();
    let span = info_span!(
        "trawl-coordinator",
        addr = %args.addr,
        artifact_root = %args.artifact_root.display(),
        samples = args.samples
    );

    async move {
        let plan = CollectionPlan::load(&args.work_items, &args.identities, args.samples)
            .context("load collection plan")?;
        info!(
            work_items = plan.work_items.len(),
            identities = plan.identities.len(),
            total_required = plan.total_required(),
            "collection plan loaded"
        );

        let store = ArtifactStore::new(args.artifact_root.clone());
        let config = CollectorConfig {
            lease_ttl_ms: args.lease_ttl_ms,
            visit_budget: args.visits,
            min_capture_bytes: args.min_capture_bytes,
            max_capture_bytes: args.max_capture_bytes,
            min_snapshot_bytes: args.min_snapshot_bytes,
        };
        let mut state = CollectorState::new(&plan, config, unix_time_ms());

        // Completed counts are rebuilt from disk on every start; the
        // artifact directory is the ground truth, not any cached number.
        let counts = store.scan().context("scan artifact root")?;
        let seeded = state.seed_completed(&counts);
        let (completed, required) = {
            let snapshot = state.status_snapshot(unix_time_ms());
            (snapshot.completed, snapshot.required)
        };
        info!(seeded, completed, required, "artifact scan applied");

        let app = AppState::new(state, store);

        let sweeper = app.clone();
        let sweep_interval = Duration::from_millis(args.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                let swept = {
                    let mut state = sweeper.state.write().await;
                    state.sweep_expired(unix_time_ms())
                };
                if swept > 0 {
                    sweeper.metrics.sweeps_total.inc_by(swept as u64);
                }
                sweeper.update_gauges().await;
            }
        });

        if args.metrics_snapshot_interval_ms > 0 {
            let emitter = app.clone();
            let interval = Duration::from_millis(args.metrics_snapshot_interval_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    emitter.emit_metrics_snapshot().await;
                }
            });
        }

        info!("starting coordinator");
        let listener = tokio::net::TcpListener::bind(args.addr)
            .await
            .context("bind coordinator address")?;
        axum::serve(listener, router(app))
            .await
            .context("serve coordinator")?;
        Ok(())
    }
    .instrument(span)
    .await
}
