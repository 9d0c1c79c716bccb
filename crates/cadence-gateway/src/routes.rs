//! API route handlers for the admin gateway.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use cadence_core::config::SendingControls;
use cadence_core::error::CadenceError;
use cadence_core::types::{EnrollmentStatus, SuppressionEntry};
use cadence_scheduler::TickOptions;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::server::AppState;

/// Error response: `{"ok": false, "error": ...}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<CadenceError> for ApiError {
    fn from(err: CadenceError) -> Self {
        let status = match &err {
            CadenceError::NotFound(_) => StatusCode::NOT_FOUND,
            CadenceError::Validation(_) | CadenceError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("❌ Admin API error: {err}");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"ok": false, "error": self.message}))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn control_warnings(controls: &SendingControls) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if controls.live_sending_enabled && controls.canary_tenant().is_none() {
        warnings.push("live sending is enabled without a canary tenant; every send is blocked");
    }
    if controls.live_sending_enabled && !controls.sending_enabled {
        warnings.push("live sending is enabled but the global sending gate is off");
    }
    warnings
}

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "cadence-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Sending controls ────────────────────────────────────────

pub async fn get_controls(State(state): State<Arc<AppState>>) -> ApiResult {
    let controls = state.db.load_sending_controls(&state.default_controls)?;
    Ok(Json(json!({
        "ok": true,
        "controls": controls,
        "warnings": control_warnings(&controls),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    })))
}

/// Partial update; omitted fields keep their current value. An empty string
/// clears a canary id.
#[derive(Debug, Default, Deserialize)]
pub struct ControlsUpdate {
    pub sending_enabled: Option<bool>,
    pub live_sending_enabled: Option<bool>,
    pub canary_tenant_id: Option<String>,
    pub canary_sender_identity_id: Option<String>,
}

pub async fn update_controls(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ControlsUpdate>,
) -> ApiResult {
    let mut controls = state.db.load_sending_controls(&state.default_controls)?;
    if let Some(v) = update.sending_enabled {
        controls.sending_enabled = v;
    }
    if let Some(v) = update.live_sending_enabled {
        controls.live_sending_enabled = v;
    }
    if let Some(v) = update.canary_tenant_id {
        controls.canary_tenant_id = Some(v.trim().to_string()).filter(|s| !s.is_empty());
    }
    if let Some(v) = update.canary_sender_identity_id {
        controls.canary_sender_identity_id = Some(v.trim().to_string()).filter(|s| !s.is_empty());
    }
    state.db.save_sending_controls(&controls, Utc::now())?;

    tracing::info!(
        "🎛️ Sending controls updated: sending={} live={} canary_tenant={:?} canary_identity={:?}",
        controls.sending_enabled,
        controls.live_sending_enabled,
        controls.canary_tenant(),
        controls.canary_identity()
    );
    Ok(Json(json!({
        "ok": true,
        "controls": controls,
        "warnings": control_warnings(&controls),
    })))
}

// ── Manual triggers ─────────────────────────────────────────

/// One send tick on demand. Body (optional): `{"ignore_send_window": true}`.
pub async fn run_send_queue(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let opts: TickOptions = if body.iter().all(u8::is_ascii_whitespace) {
        TickOptions::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid body: {e}")))?
    };
    if opts.ignore_send_window {
        tracing::warn!("⏰ Manual send tick with send window bypass");
    }

    let controls = state.db.load_sending_controls(&state.default_controls)?;
    let report = state.send_worker.tick(&controls, opts, Utc::now()).await?;
    Ok(Json(json!({"ok": true, "report": report})))
}

pub async fn run_replies(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.reply_worker.tick(Utc::now()).await?;
    Ok(Json(json!({"ok": true, "report": report})))
}

// ── Enrollments ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: EnrollmentStatus,
}

/// Pause (`PAUSED`), resume (`ACTIVE`) or cancel (`CANCELLED`).
pub async fn set_enrollment_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdate>,
) -> ApiResult {
    let Some(enrollment) = state.db.get_enrollment(&id)? else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("Enrollment {id} not found")));
    };
    if body.status == EnrollmentStatus::Completed {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "COMPLETED is set by the scheduler, not by hand",
        ));
    }
    if matches!(enrollment.status, EnrollmentStatus::Completed | EnrollmentStatus::Cancelled)
        && enrollment.status != body.status
    {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("Enrollment is {} and cannot change status", enrollment.status),
        ));
    }

    state.db.set_enrollment_status(&id, body.status, Utc::now())?;
    tracing::info!("📋 Enrollment {id}: {} → {}", enrollment.status, body.status);
    Ok(Json(json!({"ok": true, "id": id, "status": body.status})))
}

pub async fn enrollment_queue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let Some(enrollment) = state.db.get_enrollment(&id)? else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("Enrollment {id} not found")));
    };
    let queue = state.db.queue_status(&id)?;
    Ok(Json(json!({
        "ok": true,
        "enrollment_status": enrollment.status,
        "queue": queue,
    })))
}

pub async fn enrollment_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    if state.db.get_enrollment(&id)?.is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("Enrollment {id} not found")));
    }
    let events = state.db.list_audit_for_enrollment(&id)?;
    Ok(Json(json!({"ok": true, "events": events})))
}

// ── Suppression ─────────────────────────────────────────────

pub async fn add_suppression(
    State(state): State<Arc<AppState>>,
    Json(entry): Json<SuppressionEntry>,
) -> ApiResult {
    state.db.add_suppression(&entry, Utc::now())?;
    tracing::info!("🚫 Suppression added for {}: {} {}", entry.tenant_id, entry.kind, entry.value);
    Ok(Json(json!({
        "ok": true,
        "tenant_id": entry.tenant_id,
        "type": entry.kind,
        "value": entry.normalized_value(),
    })))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cadence_channels::MemoryTransport;
    use cadence_core::config::{ReplyConfig, WorkerConfig};
    use cadence_core::types::{MailboxCredentials, NewRecipient, SenderIdentity, SuppressionType};
    use cadence_db::CadenceDb;
    use cadence_scheduler::{ReplyWorker, SendQueueWorker};

    pub(crate) struct TestApp {
        pub state: Arc<AppState>,
        pub transport: Arc<MemoryTransport>,
        pub enrollment_id: String,
    }

    /// Tenant `t1` with one sender identity, a one-step sequence, an
    /// enrollment for bob@x.com, and live sending with `t1` as canary.
    pub(crate) fn test_app(token: &str) -> TestApp {
        let now = Utc::now();
        let db = CadenceDb::open_in_memory().unwrap();
        db.create_tenant("t1", "Acme").unwrap();
        let identity = SenderIdentity {
            id: "sid-1".into(),
            tenant_id: "t1".into(),
            email: "sales@acme.test".into(),
            display_name: None,
            send_window_time_zone: "UTC".into(),
            send_window_hours_start: 0,
            send_window_hours_end: 24,
            daily_send_limit: 50,
            is_active: true,
            mailbox: MailboxCredentials::default(),
        };
        db.upsert_sender_identity(&identity, now).unwrap();
        let seq = db.create_sequence("t1", "Intro", Some("sid-1"), now).unwrap();
        db.add_sequence_step(&seq.id, 1, "Quick question", "<p>Hi</p>", None)
            .unwrap();
        let enrollment = db
            .create_enrollment("t1", &seq.id, "Batch 1", &[NewRecipient::email("bob@x.com")], now)
            .unwrap();
        let live = SendingControls {
            sending_enabled: true,
            live_sending_enabled: true,
            canary_tenant_id: Some("t1".into()),
            canary_sender_identity_id: None,
        };
        db.save_sending_controls(&live, now).unwrap();

        let db = Arc::new(db);
        let transport = Arc::new(MemoryTransport::new());
        let send_worker = SendQueueWorker::new(db.clone(), transport.clone(), WorkerConfig::default())
            .with_worker_id("admin-test");
        let reply_worker = ReplyWorker::new(db.clone(), transport.clone(), ReplyConfig::default());
        let state = AppState::new(
            db,
            Arc::new(send_worker),
            Arc::new(reply_worker),
            SendingControls::default(),
            token,
        );
        TestApp {
            state: Arc::new(state),
            transport,
            enrollment_id: enrollment.id,
        }
    }

    pub(crate) fn test_state(token: &str) -> (AppState, Arc<MemoryTransport>) {
        let app = test_app(token);
        ((*app.state).clone(), app.transport)
    }

    async fn set_status(app: &TestApp, status: EnrollmentStatus) -> ApiResult {
        set_enrollment_status(
            State(app.state.clone()),
            Path(app.enrollment_id.clone()),
            Json(StatusUpdate { status }),
        )
        .await
    }

    #[tokio::test]
    async fn test_health_check() {
        let json = health_check().await.0;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_update_controls_persists_and_warns() {
        let app = test_app("t");
        let update = ControlsUpdate {
            canary_tenant_id: Some("   ".into()),
            ..Default::default()
        };
        let json = update_controls(State(app.state.clone()), Json(update)).await.unwrap().0;
        assert!(json["controls"]["canary_tenant_id"].is_null());
        assert_eq!(json["warnings"].as_array().unwrap().len(), 1);

        let read = get_controls(State(app.state.clone())).await.unwrap().0;
        assert_eq!(read["controls"]["live_sending_enabled"], true);
        assert!(read["controls"]["canary_tenant_id"].is_null());

        // The next manual tick fails closed.
        let report = run_send_queue(State(app.state.clone()), Bytes::new()).await.unwrap().0;
        assert_eq!(report["report"]["requeued"], 1);
        assert_eq!(app.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_run_send_queue_rejects_bad_body() {
        let app = test_app("t");
        let err = run_send_queue(State(app.state.clone()), Bytes::from_static(b"{nope"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let app = test_app("t");
        set_status(&app, EnrollmentStatus::Paused).await.unwrap();
        let paused = run_send_queue(State(app.state.clone()), Bytes::new()).await.unwrap().0;
        assert_eq!(paused["report"]["claimed"], 0);

        set_status(&app, EnrollmentStatus::Active).await.unwrap();
        let resumed = run_send_queue(State(app.state.clone()), Bytes::new()).await.unwrap().0;
        assert_eq!(resumed["report"]["sent"], 1);
        assert_eq!(app.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_enrollment_cannot_resume() {
        let app = test_app("t");
        set_status(&app, EnrollmentStatus::Cancelled).await.unwrap();
        let err = set_status(&app, EnrollmentStatus::Active).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        let err = set_status(&app, EnrollmentStatus::Completed).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_enrollment_is_404() {
        let app = test_app("t");
        let err = enrollment_queue(State(app.state.clone()), Path("missing".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_suppression_then_audit_and_queue_views() {
        let app = test_app("t");
        let entry = SuppressionEntry {
            tenant_id: "t1".into(),
            kind: SuppressionType::Email,
            value: "Bob@X.com".into(),
            reason: "unsubscribe".into(),
        };
        let added = add_suppression(State(app.state.clone()), Json(entry)).await.unwrap().0;
        assert_eq!(added["value"], "bob@x.com");

        run_send_queue(State(app.state.clone()), Bytes::new()).await.unwrap();
        assert_eq!(app.transport.sent_count(), 0);

        let queue = enrollment_queue(State(app.state.clone()), Path(app.enrollment_id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(queue["queue"]["counts"]["skipped"], 1);
        assert_eq!(queue["queue"]["items"][0]["status"], "SKIPPED");

        let audit = enrollment_audit(State(app.state.clone()), Path(app.enrollment_id.clone()))
            .await
            .unwrap()
            .0;
        let events = audit["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event_type"], "send_skipped");
        assert_eq!(events[0]["meta"]["reason"], "suppression");
    }

    #[tokio::test]
    async fn test_manual_reply_run() {
        let app = test_app("t");
        let json = run_replies(State(app.state.clone())).await.unwrap().0;
        assert_eq!(json["report"]["errors"], 0);
        assert_eq!(json["report"]["fetched"], 0);
    }
}
