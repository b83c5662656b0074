//! Admin HTTP API: a thin axum adapter over the typed control operations.
//! Everything it can do, the populate file can do through the same calls.

use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::collection::ProxyCollection;
use crate::config::{ProxyInput, ProxyPatch};
use crate::error::Error;
use crate::proxy::{Proxy, ProxyConfig};
use crate::task::ShutdownSignal;
use crate::toxic::{Toxic, ToxicInput, ToxicPatch};

#[derive(Clone)]
pub struct AppState {
    pub proxies: Arc<ProxyCollection>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/reset", post(reset_state))
        .route("/proxies", get(proxy_index).post(proxy_create))
        .route("/populate", post(populate))
        .route(
            "/proxies/{proxy}",
            get(proxy_show).patch(proxy_update).post(proxy_update).delete(proxy_delete),
        )
        .route("/proxies/{proxy}/toxics", get(toxic_index).post(toxic_create))
        .route(
            "/proxies/{proxy}/toxics/{toxic}",
            get(toxic_show).patch(toxic_update).post(toxic_update).delete(toxic_delete),
        )
        .route("/version", get(version))
        .layer(middleware::from_fn(stop_browsers))
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    mut shutdown_signal: ShutdownSignal,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown_signal.wait().await })
        .await
        .context("admin API server failure")
}

/// The admin API is not meant to be driven from a browser.
async fn stop_browsers(request: Request, next: Next) -> Response {
    let is_browser = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|agent| agent.starts_with("Mozilla/"));

    if is_browser {
        return (StatusCode::FORBIDDEN, "User agent not allowed").into_response();
    }
    next.run(request).await
}

struct ApiError {
    message: String,
    status: StatusCode,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError {
            message: error.to_string(),
            status: StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message, "status": self.status.as_u16() });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_body<T: DeserializeOwned>(body: &str) -> ApiResult<T> {
    serde_json::from_str(body).map_err(|error| ApiError::from(Error::BadRequestBody(error.to_string())))
}

async fn proxy_with_toxics(proxy: &Proxy) -> Value {
    json!({
        "name": proxy.name(),
        "listen": proxy.listen_addr(),
        "upstream": proxy.upstream_addr(),
        "enabled": proxy.is_enabled(),
        "toxics": proxy.toxics().list().await,
    })
}

async fn reset_state(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.proxies.reset_state().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn proxy_index(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut index = serde_json::Map::new();
    for proxy in state.proxies.proxies().await {
        index.insert(proxy.name().to_owned(), proxy_with_toxics(&proxy).await);
    }
    Ok(Json(Value::Object(index)))
}

async fn proxy_create(State(state): State<AppState>, body: String) -> ApiResult<Response> {
    let input: ProxyInput = parse_body(&body)?;
    if input.name.is_empty() {
        return Err(Error::MissingField("name".to_owned()).into());
    }
    if input.upstream.is_empty() {
        return Err(Error::MissingField("upstream".to_owned()).into());
    }

    let config = ProxyConfig {
        name: input.name.clone(),
        listen: input.listen_or_default(),
        upstream: input.upstream.clone(),
        enabled: input.enabled.unwrap_or(true),
    };
    let proxy = state.proxies.add(config).await?;

    Ok((StatusCode::CREATED, Json(proxy_with_toxics(&proxy).await)).into_response())
}

async fn populate(State(state): State<AppState>, body: String) -> ApiResult<Response> {
    let entries: Vec<ProxyInput> = parse_body(&body)?;
    let applied = state.proxies.populate(entries).await?;

    let mut list = Vec::with_capacity(applied.len());
    for proxy in &applied {
        list.push(proxy_with_toxics(proxy).await);
    }
    Ok((StatusCode::CREATED, Json(json!({ "proxies": list }))).into_response())
}

async fn proxy_show(State(state): State<AppState>, Path(proxy): Path<String>) -> ApiResult<Json<Value>> {
    let proxy = state.proxies.get(&proxy).await?;
    Ok(Json(proxy_with_toxics(&proxy).await))
}

async fn proxy_update(
    State(state): State<AppState>,
    Path(proxy): Path<String>,
    body: String,
) -> ApiResult<Json<Value>> {
    let patch: ProxyPatch = parse_body(&body)?;
    let proxy = state.proxies.get(&proxy).await?;
    proxy.update(patch.listen, patch.upstream, patch.enabled).await?;
    Ok(Json(proxy_with_toxics(&proxy).await))
}

async fn proxy_delete(State(state): State<AppState>, Path(proxy): Path<String>) -> ApiResult<StatusCode> {
    state.proxies.remove(&proxy).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toxic_index(State(state): State<AppState>, Path(proxy): Path<String>) -> ApiResult<Json<Vec<Toxic>>> {
    let proxy = state.proxies.get(&proxy).await?;
    Ok(Json(proxy.toxics().list().await))
}

async fn toxic_create(
    State(state): State<AppState>,
    Path(proxy): Path<String>,
    body: String,
) -> ApiResult<Json<Toxic>> {
    let input: ToxicInput = parse_body(&body)?;
    let proxy = state.proxies.get(&proxy).await?;
    let toxic = proxy.toxics().add(Toxic::from_input(input)?).await?;
    Ok(Json(toxic))
}

async fn toxic_show(
    State(state): State<AppState>,
    Path((proxy, toxic)): Path<(String, String)>,
) -> ApiResult<Json<Toxic>> {
    let proxy = state.proxies.get(&proxy).await?;
    Ok(Json(proxy.toxics().get(&toxic).await?))
}

async fn toxic_update(
    State(state): State<AppState>,
    Path((proxy, toxic)): Path<(String, String)>,
    body: String,
) -> ApiResult<Json<Toxic>> {
    let patch: ToxicPatch = parse_body(&body)?;
    let proxy = state.proxies.get(&proxy).await?;
    Ok(Json(proxy.toxics().update(&toxic, patch).await?))
}

async fn toxic_delete(
    State(state): State<AppState>,
    Path((proxy, toxic)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let proxy = state.proxies.get(&proxy).await?;
    proxy.toxics().remove(&toxic).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn version() -> Json<Value> {
    Json(json!({ "version": crate::VERSION }))
}
