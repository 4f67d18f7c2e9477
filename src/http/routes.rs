//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::lockstep::{FixedFactions, MatchHandle, MatchInput, MatchPhase, ParticipantId};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    // CLIENT_ORIGIN is "*" or a comma-separated list
    let cors = if state.config.client_origin.trim() == "*" {
        cors.allow_origin(Any)
    } else {
        let allowed_origins: Vec<HeaderValue> = state
            .config
            .client_origin
            .split(',')
            .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
            .collect();
        cors.allow_origin(allowed_origins)
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/matches", post(create_match_handler))
        .route("/matches/:match_id", get(match_status_handler))
        .route("/matches/:match_id/kick/:participant_id", post(kick_handler))
        .route("/matches/:match_id/defeat/:participant_id", post(defeat_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
    active_participants: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.match_registry.active_matches(),
        active_participants: state.match_registry.total_participants(),
    })
}

// ============================================================================
// Match endpoints
// ============================================================================

#[derive(Deserialize)]
struct CreateMatchRequest {
    expected_participants: usize,
}

#[derive(Serialize)]
struct CreateMatchResponse {
    match_id: Uuid,
    ws_url: String,
}

async fn create_match_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateMatchRequest>,
) -> Result<Json<CreateMatchResponse>, AppError> {
    // Zero factions is clamped to one by the coordinator
    let handle = state.match_registry.create_match(
        state.config.lockstep,
        FixedFactions::new(req.expected_participants),
        state.config.tick_rate,
    );

    Ok(Json(CreateMatchResponse {
        match_id: handle.id,
        ws_url: format!(
            "/ws?match_id={}&participant_id={{participant_id}}&game_version={}",
            handle.id, state.config.game_version
        ),
    }))
}

#[derive(Serialize)]
struct MatchStatusResponse {
    match_id: Uuid,
    phase: MatchPhase,
    server_turn: u64,
    active_participants: usize,
    expected_participants: usize,
}

async fn match_status_handler(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchStatusResponse>, AppError> {
    let handle = find_match(&state, &match_id)?;

    let phase = if !handle.has_started() {
        MatchPhase::Loading
    } else if handle.is_frozen() {
        MatchPhase::Frozen
    } else {
        MatchPhase::Running
    };

    Ok(Json(MatchStatusResponse {
        match_id,
        phase,
        server_turn: handle.server_turn(),
        active_participants: handle.active_participants(),
        expected_participants: handle.expected_participants(),
    }))
}

async fn kick_handler(
    State(state): State<AppState>,
    Path((match_id, participant_id)): Path<(Uuid, ParticipantId)>,
) -> Result<StatusCode, AppError> {
    let handle = find_match(&state, &match_id)?;
    handle
        .send(MatchInput::Kick(participant_id))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}

async fn defeat_handler(
    State(state): State<AppState>,
    Path((match_id, participant_id)): Path<(Uuid, ParticipantId)>,
) -> Result<StatusCode, AppError> {
    let handle = find_match(&state, &match_id)?;
    handle
        .send(MatchInput::FactionDefeated(participant_id))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}

fn find_match(state: &AppState, match_id: &Uuid) -> Result<MatchHandle, AppError> {
    state
        .match_registry
        .get(match_id)
        .ok_or_else(|| AppError::NotFound(format!("match {match_id}")))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::Config;

    fn test_state() -> AppState {
        let config = Config::from_lookup(|_| None).unwrap();
        AppState::new(config)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let router = build_router(test_state());
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_matches"], 0);
    }

    #[tokio::test]
    async fn created_match_is_loading() {
        let state = test_state();
        let router = build_router(state.clone());

        let response = router
            .clone()
            .oneshot(
                Request::post("/matches")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"expected_participants":3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = json_body(response).await;
        let match_id = created["match_id"].as_str().unwrap().to_string();

        let response = router
            .oneshot(
                Request::get(format!("/matches/{match_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = json_body(response).await;
        assert_eq!(status["phase"], "loading");
        assert_eq!(status["server_turn"], 0);
        assert_eq!(status["expected_participants"], 3);
        assert_eq!(state.match_registry.active_matches(), 1);
    }

    #[tokio::test]
    async fn unknown_match_is_not_found() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::get(format!("/matches/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn zero_participants_is_clamped_to_one() {
        let state = test_state();
        let router = build_router(state.clone());
        let response = router
            .oneshot(
                Request::post("/matches")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"expected_participants":0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let created = json_body(response).await;
        let match_id: Uuid = created["match_id"].as_str().unwrap().parse().unwrap();
        let handle = state.match_registry.get(&match_id).unwrap();
        assert_eq!(handle.expected_participants(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::post("/matches")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"expected_participants":-1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
