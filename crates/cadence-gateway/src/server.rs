//! HTTP server implementation using Axum.

use axum::{
    Router,
    extract::State,
    routing::{get, post},
};
use cadence_core::config::{GatewayConfig, SendingControls};
use cadence_db::CadenceDb;
use cadence_scheduler::{ReplyWorker, SendQueueWorker};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<CadenceDb>,
    pub send_worker: Arc<SendQueueWorker>,
    pub reply_worker: Arc<ReplyWorker>,
    /// File defaults; persisted controls override them.
    pub default_controls: SendingControls,
    /// `None` rejects every admin call.
    pub admin_token: Option<String>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        db: Arc<CadenceDb>,
        send_worker: Arc<SendQueueWorker>,
        reply_worker: Arc<ReplyWorker>,
        default_controls: SendingControls,
        admin_token: &str,
    ) -> Self {
        let admin_token = Some(admin_token.trim().to_string()).filter(|t| !t.is_empty());
        Self {
            db,
            send_worker,
            reply_worker,
            default_controls,
            admin_token,
            start_time: std::time::Instant::now(),
        }
    }
}

fn unauthorized(message: &str) -> axum::response::Response {
    axum::response::Response::builder()
        .status(axum::http::StatusCode::UNAUTHORIZED)
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(
            serde_json::json!({"ok": false, "error": message}).to_string(),
        ))
        .unwrap_or_default()
}

/// Compare without an early exit on the first differing byte.
fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Admin token middleware: validates the `X-Admin-Token` header.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some(expected) = &state.admin_token else {
        tracing::warn!("🔒 Admin call to {} rejected: no admin token configured", req.uri().path());
        return unauthorized("Admin API disabled: no admin token configured");
    };

    let provided = req
        .headers()
        .get("X-Admin-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token_matches(provided, expected) {
        return next.run(req).await;
    }

    unauthorized("Unauthorized: invalid or missing admin token")
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    // Admin routes, token required
    let admin = Router::new()
        .route(
            "/api/v1/admin/controls",
            get(super::routes::get_controls).post(super::routes::update_controls),
        )
        .route("/api/v1/admin/send-queue/run", post(super::routes::run_send_queue))
        .route("/api/v1/admin/replies/run", post(super::routes::run_replies))
        .route(
            "/api/v1/admin/enrollments/{id}/status",
            post(super::routes::set_enrollment_status),
        )
        .route(
            "/api/v1/admin/enrollments/{id}/queue",
            get(super::routes::enrollment_queue),
        )
        .route(
            "/api/v1/admin/enrollments/{id}/audit",
            get(super::routes::enrollment_audit),
        )
        .route("/api/v1/admin/suppressions", post(super::routes::add_suppression))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_admin,
        ));

    // Public routes, no auth
    let public = Router::new().route("/health", get(super::routes::health_check));

    admin
        .merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: CADENCE_CORS_ORIGINS=https://crm.example.com,https://admin.example.com
            if let Ok(origins_str) = std::env::var("CADENCE_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: &GatewayConfig, state: AppState) -> anyhow::Result<()> {
    if state.admin_token.is_none() {
        tracing::warn!("⚠️ No admin token configured; admin API will reject every request");
    }
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Admin API listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::routes::tests::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let (state, _) = test_state("s3cret");
        let app = super::build_router(state);

        let missing = app
            .clone()
            .oneshot(Request::get("/api/v1/admin/controls").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .clone()
            .oneshot(
                Request::get("/api/v1/admin/controls")
                    .header("X-Admin-Token", "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let same_length = app
            .clone()
            .oneshot(
                Request::get("/api/v1/admin/controls")
                    .header("X-Admin-Token", "s3creT")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(same_length.status(), StatusCode::UNAUTHORIZED);

        let ok = app
            .clone()
            .oneshot(
                Request::get("/api/v1/admin/controls")
                    .header("X-Admin-Token", "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let health = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[test]
    fn test_token_matches() {
        assert!(super::token_matches("s3cret", "s3cret"));
        assert!(!super::token_matches("s3creT", "s3cret"));
        assert!(!super::token_matches("s3cret2", "s3cret"));
        assert!(!super::token_matches("", "s3cret"));
    }

    #[tokio::test]
    async fn test_empty_token_disables_admin_api() {
        let (state, _) = test_state("  ");
        let app = super::build_router(state);
        let res = app
            .oneshot(
                Request::get("/api/v1/admin/controls")
                    .header("X-Admin-Token", "")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_manual_run_over_http() {
        let (state, transport) = test_state("s3cret");
        let app = super::build_router(state);
        let res = app
            .oneshot(
                Request::post("/api/v1/admin/send-queue/run")
                    .header("X-Admin-Token", "s3cret")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"ignore_send_window": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["report"]["sent"], 1);
        assert_eq!(transport.sent_count(), 1);
    }
}
