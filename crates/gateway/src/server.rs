use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{Request, State},
        middleware::{self, Next},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, post},
    },
    pylon_supervisor::InstanceSupervisor,
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use crate::{auth, auth::ResolvedAuth, routes};

// ── Shared app state ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<InstanceSupervisor>,
    pub auth: ResolvedAuth,
}

// ── Server startup ───────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_app(supervisor: Arc<InstanceSupervisor>, resolved_auth: ResolvedAuth) -> Router {
    let state = AppState {
        supervisor,
        auth: resolved_auth,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/instances", post(routes::create_instance))
        .route("/api/instances", get(routes::list_instances))
        .route("/api/instances/{id}", get(routes::get_instance))
        .route("/api/instances/{id}", delete(routes::destroy_instance))
        .route("/api/instances/{id}/qr", get(routes::get_qr))
        .route("/api/instances/{id}/send", post(routes::send_message))
        .route("/api/instances/{id}/logout", post(routes::logout_instance))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .layer(cors)
        .with_state(state)
}

/// Start the gateway HTTP server. Runs until the listener fails.
pub async fn serve(
    bind: &str,
    port: u16,
    supervisor: Arc<InstanceSupervisor>,
    resolved_auth: ResolvedAuth,
) -> std::io::Result<()> {
    let auth_enabled = resolved_auth.enabled();
    let app = build_app(supervisor, resolved_auth);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(std::io::Error::other)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, auth_enabled, "gateway listening");
    axum::serve(listener, app).await
}

// ── Middleware / handlers ────────────────────────────────────────────────

async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !auth::authorize(&state.auth, header) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response();
    }
    next.run(req).await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let live = state.supervisor.list_status().await.len();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_sessions": live,
    }))
}
