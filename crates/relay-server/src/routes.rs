//! HTTP routes over [`Relay`].

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::webhook::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use relay_core::{
    CallbackParams, Relay, RelayError, RequestOrigin, SetupUpdate, WebhookAck, WebhookError,
};
use relay_ingest::DEFAULT_LIST_LIMIT;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

pub const HEALTH_ENDPOINT: &str = "/health";
pub const INTEGRATIONS_ENDPOINT: &str = "/api/integrations";
pub const SETUP_ENDPOINT: &str = "/api/integrations/slack/setup";
pub const SETUP_VALIDATE_ENDPOINT: &str = "/api/integrations/slack/setup/validate";
pub const CONNECT_URL_ENDPOINT: &str = "/api/integrations/slack/connect-url";
pub const CALLBACK_ENDPOINT: &str = relay_core::setup::CALLBACK_PATH;
pub const CHANNELS_ENDPOINT: &str = "/api/integrations/slack/channels";
pub const CHANNELS_IMPORT_ENDPOINT: &str = "/api/integrations/slack/channels/import";
pub const WEBHOOK_ENDPOINT: &str = relay_core::setup::WEBHOOK_PATH;
pub const DISCONNECT_ENDPOINT: &str = "/api/integrations/slack/disconnect";
pub const EVENTS_ENDPOINT: &str = "/api/integrations/slack/events";
pub const SIGNALS_ENDPOINT: &str = "/api/signals";

pub fn build_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route(HEALTH_ENDPOINT, get(handle_health))
        .route(INTEGRATIONS_ENDPOINT, get(handle_integrations))
        .route(SETUP_ENDPOINT, get(handle_setup_get).post(handle_setup_save))
        .route(SETUP_VALIDATE_ENDPOINT, post(handle_setup_validate))
        .route(CONNECT_URL_ENDPOINT, post(handle_connect_url))
        .route(CALLBACK_ENDPOINT, get(handle_callback))
        .route(
            CHANNELS_ENDPOINT,
            get(handle_channels_list).put(handle_channels_update),
        )
        .route(CHANNELS_IMPORT_ENDPOINT, post(handle_channels_import))
        .route(WEBHOOK_ENDPOINT, post(handle_webhook))
        .route(DISCONNECT_ENDPOINT, post(handle_disconnect))
        .route(EVENTS_ENDPOINT, get(handle_events))
        .route(SIGNALS_ENDPOINT, get(handle_signals))
        .with_state(relay)
}

/// JSON error body with a status derived from the failure class.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match &err {
            RelayError::Validation(_) | RelayError::NotConnected => StatusCode::BAD_REQUEST,
            RelayError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::Encryption(_) | RelayError::Persist(_) => {
                error!("request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        let status = match &err {
            WebhookError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidPayload | WebhookError::MissingEventId => StatusCode::BAD_REQUEST,
            WebhookError::Persist(source) => {
                error!("failed to record slack event: {}", source);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::UNAUTHORIZED {
            warn!("rejected slack webhook: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn request_origin(headers: &HeaderMap) -> RequestOrigin {
    RequestOrigin::infer(
        header(headers, "x-forwarded-proto"),
        header(headers, "x-forwarded-host"),
        header(headers, "host"),
        header(headers, "origin"),
    )
}

/// Decode a JSON body; an empty body yields the default value when `allow_empty`.
fn parse_body<T>(body: &Bytes, allow_empty: bool) -> ApiResult<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if allow_empty && body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|_| ApiError::bad_request("invalid json"))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_integrations(State(relay): State<Arc<Relay>>) -> ApiResult<Response> {
    let integrations = relay.integrations()?;
    Ok(Json(json!({ "integrations": integrations })).into_response())
}

async fn handle_setup_get(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let view = relay.setup_view(&request_origin(&headers))?;
    Ok(Json(view).into_response())
}

async fn handle_setup_save(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let update: SetupUpdate = parse_body(&body, false)?;
    let view = relay.save_setup(&request_origin(&headers), update)?;
    Ok(Json(view).into_response())
}

async fn handle_setup_validate(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let report = relay.validate_setup(&request_origin(&headers))?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    access: Option<String>,
}

async fn handle_connect_url(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> ApiResult<Response> {
    let force_full = query
        .access
        .as_deref()
        .is_some_and(|a| a.trim().eq_ignore_ascii_case("full"));
    let url = relay.connect_url(&request_origin(&headers), force_full)?;
    Ok(Json(json!({ "url": url })).into_response())
}

async fn handle_callback(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let target = relay
        .handle_callback(&request_origin(&headers), &params)
        .await;
    (StatusCode::FOUND, [(LOCATION, target)]).into_response()
}

async fn handle_channels_list(State(relay): State<Arc<Relay>>) -> ApiResult<Response> {
    let listing = relay.list_channels().await?;
    Ok(Json(listing).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChannelIdsRequest {
    channel_ids: Vec<String>,
}

async fn handle_channels_update(
    State(relay): State<Arc<Relay>>,
    body: Bytes,
) -> ApiResult<Response> {
    let request: ChannelIdsRequest = parse_body(&body, false)?;
    let update = relay.update_selection(&request.channel_ids).await?;
    Ok(Json(update).into_response())
}

async fn handle_channels_import(
    State(relay): State<Arc<Relay>>,
    body: Bytes,
) -> ApiResult<Response> {
    let request: ChannelIdsRequest = parse_body(&body, true)?;
    let report = relay.import_history(&request.channel_ids).await?;
    Ok(Json(report).into_response())
}

async fn handle_webhook(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let ack = relay
        .receive_webhook(
            header(&headers, TIMESTAMP_HEADER),
            header(&headers, SIGNATURE_HEADER),
            &body,
        )
        .await?;
    let body = match ack {
        WebhookAck::Challenge(challenge) => json!({ "challenge": challenge }),
        ack => json!({ "status": ack.status() }),
    };
    Ok(Json(body).into_response())
}

async fn handle_disconnect(State(relay): State<Arc<Relay>>) -> ApiResult<Response> {
    relay.disconnect().await?;
    Ok(Json(json!({ "status": "ok" })).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    limit: Option<String>,
}

async fn handle_events(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Response> {
    let limit = query
        .limit
        .and_then(|l| l.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let events = relay.recent_events(limit)?;
    Ok(Json(json!({ "events": events })).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct SignalsQuery {
    source: Option<String>,
    limit: Option<String>,
}

/// `limit` outside 1..=200 or unparsable falls back to the default.
fn signals_limit(raw: Option<&str>) -> usize {
    raw.and_then(|l| l.trim().parse::<usize>().ok())
        .filter(|l| (1..=relay_ingest::MAX_LIST_LIMIT).contains(l))
        .unwrap_or(DEFAULT_LIST_LIMIT)
}

async fn handle_signals(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<SignalsQuery>,
) -> ApiResult<Response> {
    let source = query
        .source
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let signals = relay
        .list_signals(source, signals_limit(query.limit.as_deref()))
        .await?;
    Ok(Json(json!({ "signals": signals })).into_response())
}
