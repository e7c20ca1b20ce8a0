#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, info_span, warn, Instrument};

use trawl_artifact_store::validate::{validate, ValidateMode, ValidationConfig};
use trawl_artifact_store::{ArtifactStore, ArtifactStoreError};
use trawl_core::types::CellUnit;
use trawl_core::wire::{InvalidateRequest, InvalidateResponse, PauseResponse, StatusResponse};

#[derive(Debug, Parser)]
#[command(name = "trawl-monitor")]
struct Args {
    /// Coordinator address, e.g. http://127.0.0.1:5000
    #[arg(long, env = "TRAWL_COORD_URL", default_value = "http://127.0.0.1:5000")]
    coord_url: String,

    /// Artifact root shared with the coordinator.
    #[arg(long, env = "TRAWL_ARTIFACT_ROOT")]
    artifact_root: PathBuf,

    /// Interval between /status polls.
    #[arg(long, env = "TRAWL_POLL_INTERVAL_SECS", default_value_t = 60)]
    poll_interval_secs: u64,

    /// Grace period after pause for in-flight visits to finish.
    #[arg(long, env = "TRAWL_DRAIN_GRACE_SECS", default_value_t = 90)]
    drain_grace_secs: u64,

    /// Validator: smallest plausible capture.
    #[arg(long, env = "TRAWL_VALIDATOR_MIN_CAPTURE_BYTES", default_value_t = 50 * 1024)]
    min_capture_bytes: u64,

    /// Validator: largest plausible capture.
    #[arg(long, env = "TRAWL_VALIDATOR_MAX_CAPTURE_BYTES", default_value_t = 1500 * 1024)]
    max_capture_bytes: u64,

    /// Validator: relative band half-width around the per-cell median.
    #[arg(long, env = "TRAWL_VALIDATOR_BAND_RATIO", default_value_t = 0.5)]
    band_ratio: f64,
}

/// The control loop's states. One full pass is
/// Polling -> Draining -> Validating -> Restarting, repeated until a
/// validation pass flags nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Polling,
    Draining,
    Validating,
    Restarting { verdict_was_empty: bool },
    Done,
}

/// Polling exit rule: only a reachable, fully-collected matrix drains.
/// An unreachable coordinator is a no-op poll.
fn poll_outcome(status: Option<&StatusResponse>) -> Phase {
    match status {
        Some(status) if status.is_complete() => Phase::Draining,
        _ => Phase::Polling,
    }
}

/// Restarting exit rule: an empty verdict ends the campaign, anything else
/// means the matrix regained work and distribution continues.
fn restart_outcome(verdict_was_empty: bool) -> Phase {
    if verdict_was_empty {
        Phase::Done
    } else {
        Phase::Polling
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    trawl_observe::logging::init_tracing();

    let args = Args::parse();
    let span = info_span!(
        "trawl-monitor",
        coord_url = %args.coord_url,
        artifact_root = %args.artifact_root.display()
    );

    async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        let store = ArtifactStore::new(args.artifact_root.clone());
        let validation = ValidationConfig {
            min_capture_bytes: args.min_capture_bytes,
            max_capture_bytes: args.max_capture_bytes,
            band_ratio: args.band_ratio,
        };
        let poll_interval = Duration::from_secs(args.poll_interval_secs.max(1));
        let drain_grace = Duration::from_secs(args.drain_grace_secs);

        info!("starting monitor");
        let mut phase = Phase::Polling;
        loop {
            match phase {
                Phase::Polling => {
                    let status = match fetch_status(&client, &args.coord_url).await {
                        Ok(status) => {
                            info!(
                                completed = status.completed,
                                required = status.required,
                                outstanding_leases = status.outstanding_leases,
                                clients = status.clients,
                                "poll"
                            );
                            Some(status)
                        }
                        Err(err) => {
                            warn!(error = %err, "coordinator unreachable, will retry");
                            None
                        }
                    };
                    phase = poll_outcome(status.as_ref());
                    if phase == Phase::Polling {
                        tokio::time::sleep(poll_interval).await;
                    }
                }
                Phase::Draining => match toggle_intake(&client, &args.coord_url, "pause").await {
                    Ok(_) => {
                        info!(
                            grace_secs = drain_grace.as_secs(),
                            "intake paused, draining in-flight visits"
                        );
                        tokio::time::sleep(drain_grace).await;
                        phase = Phase::Validating;
                    }
                    Err(err) => {
                        warn!(error = %err, "pause failed, back to polling");
                        phase = Phase::Polling;
                        tokio::time::sleep(poll_interval).await;
                    }
                },
                Phase::Validating => {
                    let flagged = match validate(&store, &validation, ValidateMode::Apply) {
                        Ok(flagged) => flagged,
                        Err(err @ ArtifactStoreError::Io(_)) => {
                            // Artifact directory unreadable: retry next
                            // interval, never take the coordinator down.
                            error!(error = %err, "validator io error, will retry");
                            tokio::time::sleep(poll_interval).await;
                            continue;
                        }
                        Err(err) => {
                            // Malformed layout is a misconfiguration;
                            // surface it instead of retrying forever.
                            return Err(err).context("validator failed on artifact layout");
                        }
                    };
                    info!(flagged = flagged.len(), "validation pass finished");

                    let verdict_was_empty = flagged.is_empty();
                    if !verdict_was_empty {
                        let units: Vec<CellUnit> =
                            flagged.into_iter().map(|f| f.unit).collect();
                        // Decrements are idempotent per unit on the
                        // coordinator side, so retrying the same verdict
                        // cannot double-apply.
                        let applied = post_invalidations(
                            &client,
                            &args.coord_url,
                            &units,
                            poll_interval,
                        )
                        .await;
                        info!(
                            flagged = units.len(),
                            decremented = applied,
                            "verdict applied"
                        );
                    }
                    phase = Phase::Restarting { verdict_was_empty };
                }
                Phase::Restarting { verdict_was_empty } => {
                    // Resume unconditionally; the coordinator must never be
                    // left paused, even on the way out.
                    loop {
                        match toggle_intake(&client, &args.coord_url, "resume").await {
                            Ok(_) => break,
                            Err(err) => {
                                warn!(error = %err, "resume failed, retrying");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    }
                    phase = restart_outcome(verdict_was_empty);
                    if phase == Phase::Polling {
                        info!("invalidated work requeued, distribution resumed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
                Phase::Done => {
                    info!("collection plan satisfied, all stored artifacts passed validation");
                    return Ok(());
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn fetch_status(client: &reqwest::Client, base: &str) -> Result<StatusResponse> {
    let status = client
        .get(format!("{base}/status"))
        .send()
        .await?
        .error_for_status()?
        .json::<StatusResponse>()
        .await?;
    Ok(status)
}

async fn toggle_intake(
    client: &reqwest::Client,
    base: &str,
    action: &str,
) -> Result<PauseResponse> {
    let resp = client
        .post(format!("{base}/{action}"))
        .send()
        .await?
        .error_for_status()?
        .json::<PauseResponse>()
        .await?;
    Ok(resp)
}

/// Posts the verdict until the coordinator acknowledges it.
async fn post_invalidations(
    client: &reqwest::Client,
    base: &str,
    units: &[CellUnit],
    retry_after: Duration,
) -> u64 {
    loop {
        let attempt = async {
            let resp = client
                .post(format!("{base}/invalidate"))
                .json(&InvalidateRequest {
                    units: units.to_vec(),
                })
                .send()
                .await?
                .error_for_status()?
                .json::<InvalidateResponse>()
                .await?;
            Ok::<_, reqwest::Error>(resp.decremented)
        };
        match attempt.await {
            Ok(decremented) => return decremented,
            Err(err) => {
                warn!(error = %err, "invalidate post failed, retrying");
                tokio::time::sleep(retry_after).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(completed: u64, required: u64) -> StatusResponse {
        StatusResponse {
            completed,
            required,
            paused: false,
            outstanding_leases: 0,
            leased_identities: 0,
            clients: 0,
            elapsed_secs: 0,
        }
    }

    #[test]
    fn polling_holds_until_the_matrix_is_complete() {
        assert_eq!(poll_outcome(None), Phase::Polling);
        assert_eq!(poll_outcome(Some(&status(3, 8))), Phase::Polling);
        assert_eq!(poll_outcome(Some(&status(8, 8))), Phase::Draining);
    }

    #[test]
    fn empty_verdict_terminates_the_loop() {
        assert_eq!(restart_outcome(true), Phase::Done);
        assert_eq!(
            restart_outcome(false),
            Phase::Polling
        );
    }
}
