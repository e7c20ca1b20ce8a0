use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use trawl_artifact_store::{ArtifactStore, TripleBytes};
use trawl_core::types::{CellUnit, ClientId, IdentityKey, WorkItemId};
use trawl_core::wire::{
    ErrorBody, InvalidateRequest, InvalidateResponse, PauseResponse, RegisterResponse,
    ReportRequest, ReportResponse, StatusResponse, WorkResponse,
};
use trawl_observe::metrics::{Counter, Gauge};
use trawl_observe::time::unix_time_ms;

use crate::state::{CollectorState, RegisterError, WorkError};

#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub register_total: Counter,
    pub work_requests_total: Counter,
    pub leases_granted_total: Counter,
    pub reports_total: Counter,
    pub completions_total: Counter,
    pub rejected_reports_total: Counter,
    pub conflicts_total: Counter,
    pub invalidated_total: Counter,
    pub sweeps_total: Counter,
    pub active_leases: Gauge,
    pub leased_identities: Gauge,
}

/// Shared handler state: the single-writer collector state behind one lock,
/// the artifact store it persists through, and process-local metrics.
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<RwLock<CollectorState>>,
    pub store: Arc<ArtifactStore>,
    pub metrics: Arc<CoordinatorMetrics>,
}

impl AppState {
    pub fn new(state: CollectorState, store: ArtifactStore) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            store: Arc::new(store),
            metrics: Arc::new(CoordinatorMetrics::default()),
        }
    }

    pub async fn update_gauges(&self) {
        let state = self.state.read().await;
        let snapshot = state.status_snapshot(unix_time_ms());
        self.metrics.active_leases.set(snapshot.outstanding_leases);
        self.metrics
            .leased_identities
            .set(snapshot.leased_identities);
    }

    pub async fn emit_metrics_snapshot(&self) {
        self.update_gauges().await;
        tracing::info!(
            target: "trawl_metrics",
            register_total = self.metrics.register_total.get(),
            work_requests_total = self.metrics.work_requests_total.get(),
            leases_granted_total = self.metrics.leases_granted_total.get(),
            reports_total = self.metrics.reports_total.get(),
            completions_total = self.metrics.completions_total.get(),
            rejected_reports_total = self.metrics.rejected_reports_total.get(),
            conflicts_total = self.metrics.conflicts_total.get(),
            invalidated_total = self.metrics.invalidated_total.get(),
            sweeps_total = self.metrics.sweeps_total.get(),
            active_leases = self.metrics.active_leases.get(),
            leased_identities = self.metrics.leased_identities.get(),
            "metrics"
        );
    }
}

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/register", get(register))
        .route("/work", get(request_work).post(report_work))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/invalidate", post(invalidate))
        .with_state(app)
}

async fn root() -> &'static str {
    "trawl collection coordinator\n\
     endpoints: /status [GET], /register [GET], /work [GET,POST], \
     /pause [POST], /resume [POST], /invalidate [POST]\n"
}

async fn status(State(app): State<AppState>) -> Json<StatusResponse> {
    let state = app.state.read().await;
    let snapshot = state.status_snapshot(unix_time_ms());
    Json(StatusResponse {
        completed: snapshot.completed,
        required: snapshot.required,
        paused: snapshot.paused,
        outstanding_leases: snapshot.outstanding_leases,
        leased_identities: snapshot.leased_identities,
        clients: snapshot.clients,
        elapsed_secs: snapshot.elapsed_secs,
    })
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    client: String,
}

async fn register(
    State(app): State<AppState>,
    Query(params): Query<RegisterParams>,
) -> Response {
    app.metrics.register_total.inc();
    let client = ClientId(params.client);
    let mut state = app.state.write().await;
    match state.register(&client) {
        Ok(identity) => {
            let visit_budget = state.config().visit_budget;
            (
                StatusCode::OK,
                Json(RegisterResponse {
                    identity,
                    visit_budget,
                }),
            )
                .into_response()
        }
        Err(err @ RegisterError::Busy) => {
            (StatusCode::CONFLICT, Json(ErrorBody::new(err.to_string()))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkParams {
    client: String,
    identity: String,
}

async fn request_work(
    State(app): State<AppState>,
    Query(params): Query<WorkParams>,
) -> Response {
    app.metrics.work_requests_total.inc();
    let client = ClientId(params.client);
    let identity = IdentityKey(params.identity);
    let mut state = app.state.write().await;
    match state.request_work(&client, &identity, unix_time_ms()) {
        Ok((work_item, lease)) => {
            app.metrics.leases_granted_total.inc();
            (
                StatusCode::OK,
                Json(WorkResponse {
                    work_item,
                    sequence: lease.sequence,
                    lease_expires_unix_ms: lease.expires_unix_ms,
                }),
            )
                .into_response()
        }
        Err(err @ WorkError::Paused) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody::new(err.to_string())),
        )
            .into_response(),
        Err(err @ WorkError::NoWorkRemaining(_)) => {
            (StatusCode::NOT_FOUND, Json(ErrorBody::new(err.to_string()))).into_response()
        }
        Err(err @ WorkError::InvalidIdentity(_)) => {
            (StatusCode::CONFLICT, Json(ErrorBody::new(err.to_string()))).into_response()
        }
    }
}

async fn report_work(
    State(app): State<AppState>,
    Json(req): Json<ReportRequest>,
) -> Response {
    app.metrics.reports_total.inc();

    let capture = match BASE64.decode(&req.capture_b64) {
        Ok(bytes) => bytes,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new(format!("capture_b64: {err}"))),
            )
                .into_response()
        }
    };
    let snapshot = match BASE64.decode(&req.snapshot_b64) {
        Ok(bytes) => bytes,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new(format!("snapshot_b64: {err}"))),
            )
                .into_response()
        }
    };
    let metadata = match serde_json::to_vec_pretty(&req.metadata) {
        Ok(bytes) => bytes,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new(format!("metadata: {err}"))),
            )
                .into_response()
        }
    };

    let client = ClientId(req.client);
    let identity = IdentityKey(req.identity);
    let item = WorkItemId(req.work_item);

    let mut state = app.state.write().await;
    if let Err(err) = state.check_report(&client, &identity, &item, req.sequence) {
        app.metrics.conflicts_total.inc();
        return (StatusCode::CONFLICT, Json(ErrorBody::new(err.to_string()))).into_response();
    }

    if let Err(reason) = state.gate_payload(capture.len() as u64, snapshot.len() as u64) {
        app.metrics.rejected_reports_total.inc();
        state.reject_report(&client, &identity, &item, req.sequence, &reason);
        // The client did its reporting; the sample just is not worth
        // keeping. Ack so it moves on, the cell is already requeued.
        return (
            StatusCode::OK,
            Json(ReportResponse {
                accepted: false,
                reason: Some(reason.to_string()),
            }),
        )
            .into_response();
    }

    let unit = CellUnit {
        work_item: item.clone(),
        identity: identity.clone(),
        sequence: req.sequence,
    };
    if let Err(err) = app.store.write_triple(
        &unit,
        TripleBytes {
            capture: &capture,
            snapshot: &snapshot,
            metadata: &metadata,
        },
    ) {
        // Lease stays in place; the client may retry the same report.
        warn!(
            identity = %identity.0,
            work_item = %item.0,
            sequence = req.sequence,
            error = %err,
            "artifact write failed"
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new(format!("artifact write failed: {err}"))),
        )
            .into_response();
    }

    match state.settle_report(&client, &identity, &item, req.sequence) {
        Ok(_) => {
            app.metrics.completions_total.inc();
            (
                StatusCode::OK,
                Json(ReportResponse {
                    accepted: true,
                    reason: None,
                }),
            )
                .into_response()
        }
        Err(err) => {
            app.metrics.conflicts_total.inc();
            (StatusCode::CONFLICT, Json(ErrorBody::new(err.to_string()))).into_response()
        }
    }
}

async fn pause(State(app): State<AppState>) -> Json<PauseResponse> {
    let mut state = app.state.write().await;
    state.pause();
    Json(PauseResponse { paused: true })
}

async fn resume(State(app): State<AppState>) -> Json<PauseResponse> {
    let mut state = app.state.write().await;
    state.resume();
    Json(PauseResponse { paused: false })
}

async fn invalidate(
    State(app): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Json<InvalidateResponse> {
    let mut state = app.state.write().await;
    let decremented = state.invalidate(&req.units);
    app.metrics.invalidated_total.inc_by(decremented);
    Json(InvalidateResponse { decremented })
}
