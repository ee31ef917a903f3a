//! HTTP control surface.
//!
//! Provides REST API endpoints for:
//! - Health checks and the current fleet status
//! - Triggering a scan or a manual heal
//! - Adjusting the auto-refresh interval
//! - Sending test alerts and reading the alert ledger
//! - Probing a single server

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use notify::Alert;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::minutes as minutes_to_duration;
use crate::error::HealerError;
use crate::orchestrator::HealingOrchestrator;
use crate::probe::HealthProbe;
use crate::scanner::FleetScanner;
use crate::scheduler::RefreshScheduler;
use crate::types::{AttemptStage, HealingKind, ServerRecord, ServerStatus, Verdict};

/// State shared across handlers.
pub struct AppState {
    pub orchestrator: Arc<HealingOrchestrator>,
    pub scanner: Arc<dyn FleetScanner>,
    pub scheduler: Arc<RefreshScheduler>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/server-status", get(server_status_handler))
        .route("/refresh-now", post(refresh_handler))
        .route("/heal-now", post(heal_now_handler))
        .route("/update-refresh-interval", post(update_interval_handler))
        .route("/test-alert", post(test_alert_handler))
        .route("/alert-history", get(alert_history_handler))
        .route("/check-single-server", get(check_single_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to bind or stops unexpectedly.
pub async fn run_server(state: Arc<AppState>, addr: &str) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("PA monitoring dashboard listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// One server as shown on the dashboard.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerView<'a> {
    name: &'a str,
    ip: &'a str,
    status: ServerStatus,
    log: &'a str,
    first_pulse_audio: &'static str,
    first_container: &'static str,
    second_pulse_audio: &'static str,
    second_container: &'static str,
    manual_pulse_audio: &'static str,
    manual_container: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_heal_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healing: Option<&'static str>,
}

impl<'a> From<&'a ServerRecord> for ServerView<'a> {
    fn from(record: &'a ServerRecord) -> Self {
        let audio = |stage| record.stage(stage).audio.display_name();
        let container = |stage| record.stage(stage).container.display_name();
        Self {
            name: &record.name,
            ip: &record.address,
            status: record.status,
            log: &record.log,
            first_pulse_audio: audio(AttemptStage::First),
            first_container: container(AttemptStage::First),
            second_pulse_audio: audio(AttemptStage::Second),
            second_container: container(AttemptStage::Second),
            manual_pulse_audio: audio(AttemptStage::Manual),
            manual_container: container(AttemptStage::Manual),
            last_heal_time: record.last_heal_time,
            healing: HealingKind::of(record).map(|k| k.description()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealRequest {
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntervalRequest {
    minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestAlertRequest {
    alert_type: Option<String>,
    server_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckQuery {
    ip: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    ip: String,
    status: ServerStatus,
    verdict: Verdict,
    log: String,
    output: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

/// Alert used by the test-alert endpoint for `kind`.
#[must_use]
pub fn test_alert(kind: &str, server: Option<&ServerRecord>) -> Alert {
    let (subject, body) = match kind {
        "failure" => (
            "Test Alert: Server Failure",
            "This is a test alert for server failure scenario.",
        ),
        "recovery" => (
            "Test Alert: Server Recovery",
            "This is a test alert for server recovery scenario.",
        ),
        "firewall" => (
            "Test Alert: Firewall Exception",
            "This is a test alert for firewall/IO exception scenario.",
        ),
        "healing" => (
            "Test Alert: Healing Completed",
            "This is a test alert for healing completion scenario.",
        ),
        _ => (
            "Test Alert: General Notification",
            "This is a general test alert.",
        ),
    };

    let alert = Alert::new(subject, body);
    match server {
        Some(server) => alert.with_server(server.context()),
        None => alert,
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.store().load().await {
        Ok(servers) => {
            let views: Vec<ServerView<'_>> = servers.iter().map(ServerView::from).collect();
            Json(views).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to read server status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    info!("Manual refresh requested");
    match state
        .orchestrator
        .refresh_and_heal(state.scanner.as_ref())
        .await
    {
        Ok(outcome) => Json(json!({
            "success": true,
            "message": "Status refreshed, self-healing started",
            "servers": outcome.servers,
            "transitions": outcome.transitions,
            "alertsSent": outcome.alerts_sent,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Refresh failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn heal_now_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HealRequest>,
) -> Response {
    let Some(ip) = request.ip.filter(|ip| !ip.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "IP address required");
    };

    match state.orchestrator.heal_manual(&ip).await {
        Ok(report) => Json(json!({
            "success": true,
            "message": report.message,
            "ip": report.address,
            "status": report.status,
            "healthy": report.healthy,
            "phase": report.phase,
            "verification": report.verification,
            "persistFailures": report.persist_failures,
        }))
        .into_response(),
        Err(e @ HealerError::UnknownServer(_)) => {
            warn!(ip = %ip, "Manual heal for unknown server");
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => {
            error!(ip = %ip, error = %e, "Manual heal failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn update_interval_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IntervalRequest>,
) -> Response {
    match request.minutes {
        Some(minutes) if minutes >= 1 => {
            state
                .scheduler
                .set_interval(minutes_to_duration(minutes));
            Json(json!({
                "success": true,
                "message": format!("Refresh interval updated to {minutes} minutes"),
                "minutes": minutes,
            }))
            .into_response()
        }
        _ => error_response(StatusCode::BAD_REQUEST, "Invalid interval"),
    }
}

async fn test_alert_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TestAlertRequest>,
) -> Response {
    let server = match &request.server_ip {
        Some(ip) => match state.orchestrator.store().get(ip).await {
            Ok(server) => server,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        None => None,
    };

    let kind = request.alert_type.as_deref().unwrap_or("general");
    let report = state
        .orchestrator
        .notifier()
        .notify(test_alert(kind, server.as_ref()))
        .await;

    if report.success {
        Json(json!({ "success": true, "message": "Test alert sent successfully" })).into_response()
    } else {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            report.error.unwrap_or_default(),
        )
    }
}

async fn alert_history_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.dedup().history().await)
}

async fn check_single_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Response {
    let Some(ip) = query.ip.filter(|ip| !ip.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "IP address required");
    };

    let report = state.orchestrator.probe().check_single(&ip).await;
    Json(CheckResponse {
        status: report.status(),
        verdict: report.verdict,
        log: report.summary,
        output: report.output,
        ip,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use notify::Notifier;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::dedup::AlertDeduplicator;
    use crate::heal_log::HealLog;
    use crate::monitor::ChangeMonitor;
    use crate::orchestrator::{Collaborators, HealingSettings};
    use crate::probe::ProbeReport;
    use crate::remediation::{Outcome, RemediationClient, RepairParams};
    use crate::scheduler::{RefreshJob, MAX_INTERVAL};
    use crate::store::StatusStore;
    use crate::types::StepState;

    struct OkProbe;

    #[async_trait]
    impl HealthProbe for OkProbe {
        async fn check_single(&self, address: &str) -> ProbeReport {
            ProbeReport::from_output(&format!("{address} ✅ OK"))
        }
    }

    struct RefusingRemediation;

    #[async_trait]
    impl RemediationClient for RefusingRemediation {
        async fn repair_audio(&self, _address: &str) -> Outcome {
            Outcome::failed("API call failed: connection refused")
        }

        async fn repair_container(&self, _address: &str, _params: &RepairParams) -> Outcome {
            Outcome::failed("API call failed: connection refused")
        }
    }

    struct NoScan;

    #[async_trait]
    impl FleetScanner for NoScan {
        async fn scan(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct Idle;

    #[async_trait]
    impl RefreshJob for Idle {
        async fn run(&self) {}
    }

    async fn app(dir: &TempDir, fleet: &[ServerRecord]) -> (Router, Arc<AppState>) {
        let store = Arc::new(StatusStore::new(dir.path().join("status.json")));
        store.save(fleet).await.unwrap();

        let notifier = Arc::new(Notifier::disabled());
        let dedup = Arc::new(AlertDeduplicator::load(dir.path().join("alerts.json")).await);
        let orchestrator = Arc::new(HealingOrchestrator::new(
            Collaborators {
                store,
                probe: Arc::new(OkProbe),
                remediation: Arc::new(RefusingRemediation),
                notifier: notifier.clone(),
                dedup: dedup.clone(),
                monitor: ChangeMonitor::new(notifier, dedup, Duration::from_secs(60)),
                heal_log: HealLog::new(dir.path().join("heal_logs")),
            },
            HealingSettings {
                settle: Duration::ZERO,
                manual_verify_wait: Duration::ZERO,
                ..HealingSettings::default()
            },
        ));

        let state = Arc::new(AppState {
            orchestrator,
            scanner: Arc::new(NoScan),
            scheduler: Arc::new(RefreshScheduler::new(
                Arc::new(Idle),
                Duration::from_secs(30 * 60),
            )),
        });
        (build_router(state.clone()), state)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let (router, _) = app(&dir, &[]).await;
        let (status, body) = send(router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_server_status_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let mut record = ServerRecord::new("pa-01", "10.0.0.1", ServerStatus::Fail);
        record.stage_mut(AttemptStage::First).audio = StepState::InProgress;
        let (router, _) = app(&dir, &[record]).await;

        let (status, body) = send(router, get("/server-status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["ip"], "10.0.0.1");
        assert_eq!(body[0]["status"], "fail");
        assert_eq!(body[0]["firstPulseAudio"], "In-Progress");
        assert_eq!(body[0]["firstContainer"], "Not Attempted");
        assert_eq!(body[0]["manualContainer"], "Not Attempted");
    }

    #[tokio::test]
    async fn test_heal_now_validation() {
        let dir = TempDir::new().unwrap();
        let (router, _) = app(&dir, &[]).await;

        let (status, body) = send(router.clone(), post_json("/heal-now", &json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "IP address required");

        let (status, _) = send(router, post_json("/heal-now", &json!({ "ip": "10.9.9.9" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heal_now_resolves_status() {
        let dir = TempDir::new().unwrap();
        let fleet = [ServerRecord::new("pa-01", "10.0.0.1", ServerStatus::Error)];
        let (router, state) = app(&dir, &fleet).await;

        let (status, body) =
            send(router, post_json("/heal-now", &json!({ "ip": "10.0.0.1" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["phase"], "AudioFailed");

        let record = state
            .orchestrator
            .store()
            .get("10.0.0.1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ServerStatus::Ok);
    }

    #[tokio::test]
    async fn test_update_refresh_interval() {
        let dir = TempDir::new().unwrap();
        let (router, state) = app(&dir, &[]).await;

        let (status, _) = send(
            router.clone(),
            post_json("/update-refresh-interval", &json!({ "minutes": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            router,
            post_json("/update-refresh-interval", &json!({ "minutes": 15 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["minutes"], 15);
        assert_eq!(state.scheduler.interval(), Duration::from_secs(15 * 60));
    }

    #[tokio::test]
    async fn test_update_refresh_interval_saturates_huge_values() {
        let dir = TempDir::new().unwrap();
        let (router, state) = app(&dir, &[]).await;

        let (status, _) = send(
            router,
            post_json("/update-refresh-interval", &json!({ "minutes": u64::MAX })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.scheduler.interval(), MAX_INTERVAL);
    }

    #[tokio::test]
    async fn test_test_alert_reports_delivery_failure() {
        let dir = TempDir::new().unwrap();
        let (router, _) = app(&dir, &[]).await;

        let (status, body) = send(
            router,
            post_json("/test-alert", &json!({ "alertType": "firewall" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_alert_history_and_single_check() {
        let dir = TempDir::new().unwrap();
        let (router, _) = app(&dir, &[]).await;

        let (status, body) = send(router.clone(), get("/alert-history")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, body) = send(router.clone(), get("/check-single-server?ip=10.0.0.7")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["verdict"], "Healthy");

        let (status, _) = send(router, get("/check-single-server")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_alert_kinds() {
        assert_eq!(test_alert("recovery", None).subject, "Test Alert: Server Recovery");
        assert_eq!(
            test_alert("unknown", None).subject,
            "Test Alert: General Notification"
        );
        let server = ServerRecord::new("pa-01", "10.0.0.1", ServerStatus::Ok);
        assert!(test_alert("failure", Some(&server)).server.is_some());
    }
}
