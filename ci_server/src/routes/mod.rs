//! CI HTTP routes: build hooks and the read-only API.

pub mod api;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::dashboard::overview::{self, ProjectOverview};
use crate::error::StoreError;
use crate::services::dispatch::{DispatchReport, Dispatcher};
use crate::store::{BuildStore, LogStore};

/// Shared state for CI route handlers.
#[derive(Clone)]
pub struct CiRouterState {
    pub store: Arc<dyn BuildStore>,
    pub logs: Arc<dyn LogStore>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the CI server's Axum router.
pub fn ci_router(state: CiRouterState) -> Router {
    Router::new()
        // Build hooks
        .route(
            "/projects/{slug}/buildhooks/{hook_type}",
            post(build_hook_handler).get(build_hook_handler),
        )
        // Project API
        .route("/api/projects", get(list_projects))
        .route("/api/projects/{slug}/overview", get(project_overview))
        // Build API
        .route("/api/builds/{build_id}", get(get_build))
        .with_state(state)
}

fn store_status(e: StoreError) -> StatusCode {
    match e {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        e => {
            tracing::error!("Store error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ── Build hooks ──

async fn build_hook_handler(
    State(state): State<CiRouterState>,
    Path((slug, hook_type)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DispatchReport>, StatusCode> {
    webhook::handle_build_hook(&state.dispatcher, &slug, &hook_type, &headers, query, body)
        .await
        .map(Json)
}

// ── Project API ──

async fn list_projects(
    State(state): State<CiRouterState>,
) -> Result<Json<Vec<api::ProjectJson>>, StatusCode> {
    api::list_projects(state.store.as_ref())
        .await
        .map(Json)
        .map_err(store_status)
}

async fn project_overview(
    State(state): State<CiRouterState>,
    Path(slug): Path<String>,
) -> Result<Json<ProjectOverview>, StatusCode> {
    let project = state
        .store
        .find_project_by_slug(&slug)
        .await
        .map_err(store_status)?
        .ok_or(StatusCode::NOT_FOUND)?;

    overview::project_overview(state.store.as_ref(), &project)
        .await
        .map(Json)
        .map_err(store_status)
}

// ── Build API ──

async fn get_build(
    State(state): State<CiRouterState>,
    Path(build_id): Path<i64>,
) -> Result<Json<api::BuildJson>, StatusCode> {
    api::get_build(state.store.as_ref(), state.logs.as_ref(), build_id)
        .await
        .map(Json)
        .map_err(store_status)
}
