use std::collections::BTreeMap;
use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::types::ServiceInstance;
use crate::catalog_manager::CatalogHandle;
use crate::gossip::{Member, Members};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub catalog: CatalogHandle,
    pub hash_rx: watch::Receiver<String>,
    pub members: Members,
    pub cluster_name: String,
    pub metrics: Arc<Metrics>,
}

#[derive(Serialize)]
pub struct ServicesResponse {
    pub cluster_name: String,
    pub hostname: String,
    pub last_changed: Option<DateTime<Utc>>,
    /// Records grouped by logical service name
    pub services: BTreeMap<String, Vec<ServiceInstance>>,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    pub name: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{}/services", API_PREFIX), get(get_services))
        .route(&format!("{}/services/hash", API_PREFIX), get(get_hash))
        .route(&format!("{}/hosts/:host", API_PREFIX), get(get_host))
        .route(&format!("{}/state", API_PREFIX), get(get_state))
        .route(&format!("{}/members", API_PREFIX), get(get_members))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    tracing::error!("Failed to query catalog: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<ServicesResponse>, StatusCode> {
    let snapshot = state.catalog.snapshot().await.map_err(internal_error)?;

    let mut services: BTreeMap<String, Vec<ServiceInstance>> = BTreeMap::new();
    for svc in snapshot.services() {
        let name = state.catalog.service_name(svc);
        if params.name.as_ref().is_some_and(|wanted| *wanted != name) {
            continue;
        }
        services.entry(name).or_default().push(svc.clone());
    }

    Ok(Json(ServicesResponse {
        cluster_name: state.cluster_name.clone(),
        hostname: snapshot.hostname,
        last_changed: snapshot.last_changed,
        services,
    }))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_host(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<Json<Vec<ServiceInstance>>, StatusCode> {
    let services = state.catalog.services_for_host(host).await.map_err(internal_error)?;
    if services.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(services))
}

async fn get_state(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.catalog.format(state.members.list()).await.map_err(internal_error)
}

async fn get_members(State(state): State<AppState>) -> Json<Vec<Member>> {
    Json(state.members.list())
}

async fn get_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let body = state.metrics.render().map_err(|e| {
        tracing::error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}
