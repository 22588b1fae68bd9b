//! Axum JSON API over the story corpus and the pipeline.
//!
//! Read endpoints never conflate "nothing there" with failure: empty
//! queries return empty arrays with 200, a missing transcript is a 404.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use drb_core::parse_date_key;
use drb_pipeline::Pipeline;
use drb_storage::DateRangeQuery;
use serde::Deserialize;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "drb-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/stories", get(stories_handler))
        .route("/stories/queue", get(queue_handler))
        .route("/podcasts/{date}", get(podcast_handler))
        .route("/runs", post(run_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("DRB_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize, Default)]
struct StoriesQuery {
    start: Option<String>,
    end: Option<String>,
    published: Option<bool>,
    limit: Option<usize>,
}

async fn stories_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StoriesQuery>,
) -> Response {
    let today = Utc::now().date_naive();
    let end = match query.end.as_deref() {
        None => today,
        Some(raw) => match parse_date_key(raw) {
            Some(day) => day,
            None => return bad_request(format!("invalid end date: {raw}")),
        },
    };
    let start = match query.start.as_deref() {
        None => end,
        Some(raw) => match parse_date_key(raw) {
            Some(day) => day,
            None => return bad_request(format!("invalid start date: {raw}")),
        },
    };

    let range = DateRangeQuery {
        published_only: query.published == Some(true),
        unpublished_only: query.published == Some(false),
        limit: query.limit,
    };
    match state
        .pipeline
        .stories()
        .query_by_date_range(start, end, range)
        .await
    {
        Ok(stories) => Json(stories).into_response(),
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Deserialize, Default)]
struct QueueQuery {
    edited: Option<bool>,
}

async fn queue_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueQuery>,
) -> Response {
    let stories = if query.edited.unwrap_or(false) {
        state.pipeline.stories().edited_unpublished().await
    } else {
        state.pipeline.stories().unedited_unpublished().await
    };
    match stories {
        Ok(stories) => Json(stories).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn podcast_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> Response {
    let Some(day) = parse_date_key(&date) else {
        return bad_request(format!("invalid date: {date}"));
    };
    match state.pipeline.podcasts().get(day).await {
        Ok(Some(transcript)) => Json(transcript).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no transcript for {date}") })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunQuery {
    override_podcast: Option<bool>,
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> Response {
    match state
        .pipeline
        .run_once(query.override_podcast.unwrap_or(false))
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
