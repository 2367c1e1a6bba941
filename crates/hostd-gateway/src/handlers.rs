//! HTTP endpoint handlers for the `/1.0` API.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, Method, Uri},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use hostd_common::api::{decode_body, operation_url, with_project, SnapshotPost, SnapshotsPost};
use hostd_common::DEFAULT_PROJECT;
use hostd_instance::RequestContext;
use hostd_operations::OperationView;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::cluster::Location;
use crate::response::{operation_response, sync_response, sync_response_etag, AppError};
use crate::websocket::operation_websocket;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ProjectQuery {
    pub project: Option<String>,
    #[serde(default)]
    pub recursion: u8,
}

impl ProjectQuery {
    fn project(&self) -> &str {
        self.project
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PROJECT)
    }

    fn context(&self, peer: Option<ConnectInfo<SocketAddr>>) -> RequestContext {
        let ctx = RequestContext::new(self.project());
        match peer {
            Some(ConnectInfo(addr)) => ctx.with_requestor(addr.to_string()),
            None => ctx,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    /// Seconds; absent or negative waits until the operation ends.
    pub timeout: Option<i64>,
}

/// The parts of a request needed to replay it on another member.
struct Replay<'a> {
    method: &'a Method,
    uri: &'a Uri,
    headers: &'a HeaderMap,
    body: &'a Bytes,
}

/// Proxy to the owning member when `instance` is remote.
async fn forward_if_remote(
    state: &AppState,
    project: &str,
    instance: &str,
    request: Replay<'_>,
) -> Result<Option<Response>, AppError> {
    match state.locator.locate(project, instance, request.headers).await? {
        Location::Local => Ok(None),
        Location::Remote(address) => {
            info!("Forwarding request for {} to {}", instance, address);
            let response = state
                .forwarder
                .forward(
                    &address,
                    request.method.clone(),
                    request.uri,
                    request.headers,
                    request.body.clone(),
                )
                .await?;
            Ok(Some(response))
        }
    }
}

fn if_match(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok())
}

/// `GET|POST /1.0/instances/:name/snapshots`
#[instrument(skip(state, query, peer, headers, body))]
pub async fn snapshots_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ProjectQuery>,
    peer: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if method != Method::GET && method != Method::POST {
        return Err(AppError::NotFound(format!("Method '{method}' not found")));
    }

    let replay = Replay {
        method: &method,
        uri: &uri,
        headers: &headers,
        body: &body,
    };
    if let Some(response) = forward_if_remote(&state, query.project(), &name, replay).await? {
        return Ok(response);
    }

    let ctx = query.context(peer);
    if method == Method::GET {
        let listing = state
            .controller
            .list(&ctx, &name, query.recursion > 0)
            .await?;
        return Ok(sync_response(listing));
    }

    let req: SnapshotsPost = decode_body(&body)?;
    let op = state.controller.create(&ctx, &name, req).await?;
    Ok(operation_response(&op))
}

/// `* /1.0/instances/:name/snapshots/:snapshot`, dispatched by method.
#[instrument(skip(state, query, peer, headers, body))]
pub async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path((name, snapshot)): Path<(String, String)>,
    Query(query): Query<ProjectQuery>,
    peer: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let known = [
        Method::GET,
        Method::PUT,
        Method::PATCH,
        Method::POST,
        Method::DELETE,
    ];
    if !known.contains(&method) {
        return Err(AppError::NotFound(format!("Method '{method}' not found")));
    }

    let replay = Replay {
        method: &method,
        uri: &uri,
        headers: &headers,
        body: &body,
    };
    if let Some(response) = forward_if_remote(&state, query.project(), &name, replay).await? {
        return Ok(response);
    }

    let ctx = query.context(peer);
    let controller = &state.controller;
    let op = match method {
        Method::GET => {
            let (rendered, etag) = controller.get(&ctx, &name, &snapshot).await?;
            return Ok(sync_response_etag(rendered, &etag));
        }
        Method::PUT | Method::PATCH => {
            controller
                .update(&ctx, &name, &snapshot, if_match(&headers), &body)
                .await?
        }
        Method::POST => {
            let req: SnapshotPost = decode_body(&body)?;
            controller.post(&ctx, &name, &snapshot, req).await?
        }
        _ => controller.delete(&ctx, &name, &snapshot).await?,
    };

    Ok(operation_response(&op))
}

/// `GET /1.0/operations`, grouped by lowercase status.
#[instrument(skip(state))]
pub async fn list_operations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectQuery>,
) -> Response {
    let views = state.registry.list(query.project.as_deref());

    if query.recursion > 0 {
        let mut grouped: BTreeMap<String, Vec<OperationView>> = BTreeMap::new();
        for view in views {
            grouped
                .entry(view.status.to_string().to_lowercase())
                .or_default()
                .push(view);
        }
        return sync_response(grouped);
    }

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for view in views {
        grouped
            .entry(view.status.to_string().to_lowercase())
            .or_default()
            .push(with_project(operation_url(&view.id), &view.project));
    }
    sync_response(grouped)
}

/// `GET /1.0/operations/:id`
#[instrument(skip(state))]
pub async fn get_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let op = state.registry.get(&id)?;
    Ok(sync_response(op.view()))
}

/// `DELETE /1.0/operations/:id`
#[instrument(skip(state))]
pub async fn cancel_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let view = state.registry.cancel(&id).await?;
    Ok(sync_response(view))
}

/// `GET /1.0/operations/:id/wait?timeout=`
#[instrument(skip(state))]
pub async fn wait_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Response, AppError> {
    let timeout = query
        .timeout
        .filter(|secs| *secs >= 0)
        .map(|secs| Duration::from_secs(secs as u64));
    let view = state.registry.wait(&id, timeout).await?;
    Ok(sync_response(view))
}

/// Liveness check
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "node": state.registry.config().location,
        "operations": state.registry.len(),
    }))
}

/// Create router with all endpoints
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/1.0/instances/:name/snapshots", any(snapshots_handler))
        .route(
            "/1.0/instances/:name/snapshots/:snapshot",
            any(snapshot_handler),
        )
        .route("/1.0/operations", get(list_operations))
        .route(
            "/1.0/operations/:id",
            get(get_operation).delete(cancel_operation),
        )
        .route("/1.0/operations/:id/wait", get(wait_operation))
        .route("/1.0/operations/:id/websocket", get(operation_websocket))
        .with_state(state)
}
