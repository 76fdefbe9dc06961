use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::post,
};
use deeptree_core::{CancellationToken, DEFAULT_DEPTH, DEFAULT_MAX_QUESTIONS, ResearchQuery};
use serde::Deserialize;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

const REQUEST_ID: &str = "x-request-id";

#[derive(Debug, Deserialize)]
struct ResearchRequest {
    topic: String,
    #[serde(default = "default_depth")]
    depth: usize,
    #[serde(default = "default_max_questions")]
    max_questions: usize,
}

fn default_depth() -> usize {
    DEFAULT_DEPTH
}

fn default_max_questions() -> usize {
    DEFAULT_MAX_QUESTIONS
}

pub fn research_router() -> Router<AppState> {
    Router::new().route("/research", post(research))
}

async fn research(
    State(state): State<AppState>,
    payload: Result<Json<ResearchRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) =
        payload.map_err(|rejection| AppError::unprocessable(rejection.body_text()))?;
    let _permit = state.acquire_request_permit()?;

    let request_id = Uuid::new_v4().to_string();
    let query = ResearchQuery::new(request.topic, request.depth, request.max_questions);

    // Dropping the handler (client went away) cancels the run's spawned tasks.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let span = info_span!("research_request", request_id = %request_id);
    let report = state
        .orchestrator()
        .run_with_cancel(&query, cancel)
        .instrument(span)
        .await?;
    info!(request_id = %request_id, questions = report.stats.questions, "research request served");

    let mut response = Json(report).into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    Ok(response)
}
