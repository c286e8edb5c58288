use {
    axum::{
        Json,
        extract::{Path, State},
        response::IntoResponse,
    },
    pylon_common::GatewayError,
    serde::Deserialize,
};

use crate::{error::ApiError, server::AppState};

#[derive(Deserialize)]
pub(crate) struct CreateInstanceBody {
    pub instance_id: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub(crate) struct SendBody {
    pub target: String,
    pub body: String,
}

pub(crate) async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = state
        .supervisor
        .ensure(&body.instance_id, body.config)
        .await?;
    Ok(Json(meta))
}

pub(crate) async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let live = state.supervisor.get_meta(&id).await;
    let record = state.supervisor.store().get(&id).await;
    if live.is_none() && record.is_none() {
        return Err(GatewayError::NotFound(id).into());
    }
    let record = record.map(|r| {
        serde_json::json!({
            "instance_id": r.instance_id,
            "status": r.status,
            "config": r.config,
            "linked_identity": r.linked_identity,
            "message_count": r.message_count,
            "created_at": r.created_at,
        })
    });
    Ok(Json(serde_json::json!({ "live": live, "record": record })))
}

pub(crate) async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.list_status().await)
}

pub(crate) async fn get_qr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(qr) = state.supervisor.get_qr(&id).await {
        return Ok(Json(serde_json::json!({ "instance_id": id, "qr": qr })));
    }
    match state.supervisor.get_client(&id).await {
        Some(conn) if conn.is_authenticated() => Ok(Json(serde_json::json!({
            "instance_id": id,
            "status": "authenticated",
        }))),
        // Session is still pairing but no artifact has arrived yet.
        Some(_) => Err(GatewayError::NotReady(id).into()),
        None => Err(GatewayError::NotFound(id).into()),
    }
}

pub(crate) async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.supervisor.send(&id, &body.target, &body.body).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub(crate) async fn logout_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.supervisor.logout(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub(crate) async fn destroy_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.supervisor.destroy(&id).await;
    Json(serde_json::json!({ "success": true }))
}
