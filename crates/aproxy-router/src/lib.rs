//! HTTP ingress: health, browser redirects, pass-through, and the provider
//! dispatch path. The outer handler converts any uncaught failure into a
//! 500 so one bad request never takes the proxy down.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};
use uuid::Uuid;

use aproxy_common::RouteDecision;
use aproxy_core::{AppState, RouteClass, classify_path};
use aproxy_oauth::{anthropic, codex, google};
use aproxy_provider_core::{AdapterBody, AdapterResponse, Headers, RequestEntry};

const SERVICE_NAME: &str = "aproxy";

#[derive(Clone)]
struct RouterState {
    app: Arc<AppState>,
}

pub fn build_router(app: Arc<AppState>) -> Router {
    let state = RouterState { app };
    Router::new()
        .route("/", get(health))
        .route("/status", get(health))
        .fallback(dispatch)
        .with_state(state)
}

async fn health(State(state): State<RouterState>) -> Response {
    let app = &state.app;
    let config = app.config.load();
    let body = json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "port": config.port,
        "upstream": config.upstream_base,
        "providers": {
            "anthropic": config.providers.anthropic && app.oauth.ready(anthropic()).await,
            "codex": config.providers.codex && app.oauth.ready(codex()).await,
            "google": config.providers.google && app.oauth.ready(google()).await,
        },
        "stats": app.stats.snapshot(),
    });
    json_response(StatusCode::OK, body)
}

async fn dispatch(
    State(state): State<RouterState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::now_v7().to_string();
    match dispatch_inner(&state, &method, &uri, &headers, body, &trace_id).await {
        Ok(response) => response,
        Err(err) => {
            error!(trace_id, %err, path = uri.path(), "request failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Internal proxy error"}),
            )
        }
    }
}

async fn dispatch_inner(
    state: &RouterState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    trace_id: &str,
) -> Result<Response, DispatchError> {
    let app = &state.app;
    let path = uri.path();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(path)
        .to_string();

    match classify_path(path) {
        RouteClass::Health => Ok(health(State(state.clone())).await),
        RouteClass::BrowserRedirect => {
            let location = format!(
                "{}{}",
                app.config.load().upstream_base.trim_end_matches('/'),
                path_and_query
            );
            Ok((
                StatusCode::FOUND,
                [(header::LOCATION, location)],
            )
                .into_response())
        }
        RouteClass::PassThrough | RouteClass::Upstream => {
            let response = app
                .upstream
                .forward(
                    method.as_str(),
                    &path_and_query,
                    &headers_to_vec(headers),
                    body,
                )
                .await?;
            Ok(adapter_response_into_axum(response))
        }
        RouteClass::Provider { provider, subpath } => {
            let started = Instant::now();
            let thread_id = headers
                .get("x-amp-thread-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let request_body = if method == Method::POST {
                body.clone()
            } else {
                Bytes::new()
            };

            let outcome = app
                .engine
                .handle(
                    provider,
                    &subpath,
                    headers_to_vec(headers),
                    request_body,
                    thread_id.as_deref(),
                )
                .await;

            let (status, response) = match outcome.response {
                Some(response) => {
                    let status = response.status;
                    (status, adapter_response_into_axum(response))
                }
                None => {
                    info!(
                        trace_id,
                        provider = provider.as_str(),
                        decision = RouteDecision::AmpUpstream.as_str(),
                        "serving from paid upstream"
                    );
                    let response = app
                        .upstream
                        .forward(
                            method.as_str(),
                            &path_and_query,
                            &headers_to_vec(headers),
                            body,
                        )
                        .await?;
                    (response.status, adapter_response_into_axum(response))
                }
            };

            app.stats.record(RequestEntry {
                at_ms: aproxy_common::epoch_ms(),
                decision: outcome.decision,
                provider: provider.as_str().to_string(),
                model: outcome.model,
                status,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            Ok(response)
        }
    }
}

#[derive(Debug)]
struct DispatchError(String);

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<aproxy_core::upstream::UpstreamError> for DispatchError {
    fn from(err: aproxy_core::upstream::UpstreamError) -> Self {
        DispatchError(err.to_string())
    }
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn adapter_response_into_axum(response: AdapterResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    let body = match response.body {
        AdapterBody::Bytes(bytes) => Body::from(bytes),
        AdapterBody::Stream(rx) => Body::from_stream(
            tokio_stream::StreamExt::map(ReceiverStream::new(rx), Ok::<_, std::io::Error>),
        ),
    };
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
