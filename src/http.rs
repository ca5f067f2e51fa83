// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # HTTP Surface
//!
//! Axum routers for both services. The data service accepts events over
//! `POST /events`; the logger service answers log queries. Both expose the
//! cached health status on `GET /health`.

use crate::{
    envelope::{new_correlation_id, Envelope, CORRELATION_HEADERS},
    errors::{EnvelopeError, StoreError},
    health::{HealthProbe, HealthStatus},
    publisher::EventPublisher,
    snapshot::{HttpSnapshot, RawHttpRequest},
    store::EventStore,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{info, warn};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, message: String, correlation_id: Option<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_owned(),
            message,
            correlation_id,
        }),
    )
}

#[derive(Clone)]
pub struct LoggerState {
    pub store: Arc<dyn EventStore>,
    pub health: Arc<HealthProbe>,
}

#[derive(Clone)]
pub struct DataState {
    pub publisher: Arc<EventPublisher>,
    pub health: Arc<HealthProbe>,
}

/// `GET /health`, `GET /logs/day/:date`, `GET /logs/range`, `GET /logs/type/:kind`
pub fn logger_router(state: LoggerState) -> Router {
    Router::new()
        .route("/health", get(logger_health))
        .route("/logs/day/:date", get(logs_by_day))
        .route("/logs/range", get(logs_by_range))
        .route("/logs/type/:kind", get(logs_by_type))
        .with_state(state)
}

/// `GET /health`, `POST /events`
pub fn data_router(state: DataState) -> Router {
    Router::new()
        .route("/health", get(data_health))
        .route("/events", post(submit_event))
        .with_state(state)
}

/// Serves `router` on `port` until `shutdown` resolves.
pub async fn serve(
    router: Router,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health_response(probe: &HealthProbe) -> (StatusCode, Json<HealthStatus>) {
    let status = probe.get_status().await;
    let code = if status.is_up() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(status))
}

async fn logger_health(State(state): State<LoggerState>) -> (StatusCode, Json<HealthStatus>) {
    health_response(&state.health).await
}

async fn data_health(State(state): State<DataState>) -> (StatusCode, Json<HealthStatus>) {
    health_response(&state.health).await
}

fn parse_day(value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_DATE",
            format!("`{}` is not a YYYY-MM-DD date", value),
            None,
        )
    })
}

fn store_error(err: StoreError) -> ApiError {
    let (status, code) = match &err {
        StoreError::InvalidRange { .. } => (StatusCode::BAD_REQUEST, "INVALID_RANGE"),
        StoreError::UnknownType(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_TYPE"),
        StoreError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_FAILURE"),
    };

    api_error(status, code, err.to_string(), None)
}

async fn logs_by_day(
    State(state): State<LoggerState>,
    Path(date): Path<String>,
) -> Result<Json<Vec<Envelope>>, ApiError> {
    let day = parse_day(&date)?;
    let events = state.store.query_by_day(day).await.map_err(store_error)?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    start: Option<String>,
    end: Option<String>,
}

async fn logs_by_range(
    State(state): State<LoggerState>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<Envelope>>, ApiError> {
    let (Some(start), Some(end)) = (params.start, params.end) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "MISSING_PARAMETER",
            "both `start` and `end` are required".to_owned(),
            None,
        ));
    };

    let events = state
        .store
        .query_by_range(parse_day(&start)?, parse_day(&end)?)
        .await
        .map_err(store_error)?;
    Ok(Json(events))
}

async fn logs_by_type(
    State(state): State<LoggerState>,
    Path(kind): Path<String>,
) -> Result<Json<Vec<Envelope>>, ApiError> {
    let events = state.store.query_by_type(&kind).await.map_err(store_error)?;
    Ok(Json(events))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAccepted {
    pub published: bool,
    pub outcome: String,
    pub correlation_id: String,
}

fn request_correlation_id(headers: &HeaderMap) -> String {
    CORRELATION_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()))
        .filter(|id| !id.trim().is_empty())
        .map(str::to_owned)
        .unwrap_or_else(new_correlation_id)
}

fn header_map(headers: &HeaderMap) -> Map<String, Value> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), Value::String(v.to_owned())))
        })
        .collect()
}

fn invalid_event(err: EnvelopeError, correlation_id: String) -> ApiError {
    warn!(error = err.to_string(), correlation_id = %correlation_id, "rejecting event");
    let code = match err {
        EnvelopeError::Malformed(_) => "MALFORMED_EVENT",
        _ => "INVALID_EVENT",
    };

    api_error(StatusCode::BAD_REQUEST, code, err.to_string(), Some(correlation_id))
}

/// Normalizes the posted event, attaches a redacted snapshot of this request
/// and publishes it. Publishing is best effort: the answer is 202 whether or
/// not the broker took the event.
async fn submit_event(
    State(state): State<DataState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<(StatusCode, Json<EventAccepted>), ApiError> {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return Err(invalid_event(
                EnvelopeError::Malformed(err.to_string()),
                request_correlation_id(&headers),
            ))
        }
    };

    let snapshot = HttpSnapshot::sanitize(RawHttpRequest {
        method: method.to_string(),
        path: uri.path().to_owned(),
        query: query
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect(),
        body: raw.clone(),
        ip: headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
        headers: header_map(&headers),
    });

    let envelope = match Envelope::normalize(raw, None) {
        Ok(envelope) => envelope
            .with_http_request(snapshot)
            .enrich(state.publisher.service_name()),
        Err(err) => return Err(invalid_event(err, request_correlation_id(&headers))),
    };

    if let Err(err) = envelope.validate() {
        return Err(invalid_event(err, envelope.correlation_id.clone()));
    }

    let outcome = state.publisher.publish(&envelope, None).await;
    info!(
        correlation_id = %envelope.correlation_id,
        outcome = %outcome,
        "event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EventAccepted {
            published: outcome.published(),
            outcome: outcome.as_str().to_owned(),
            correlation_id: envelope.correlation_id,
        }),
    ))
}
