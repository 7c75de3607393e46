use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::health::HealthChecker;
use crate::key_generator::KeyGenerator;
use crate::response::{SegmentsResponse, TranslateResponse};
use crate::validation::{DocumentMessage, IncomingMessage};

/// Shared application state
pub type AppState = Arc<Dispatcher>;

/// Translate one text
pub async fn translate(
    State(dispatcher): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<IncomingMessage>, JsonRejection>,
) -> Result<impl IntoResponse, DispatchError> {
    let Json(mut message) = payload.map_err(malformed)?;
    // The client address comes from the transport, never from the body.
    message.source_ip = KeyGenerator::client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    let dispatched = dispatcher.handle(message).await?;
    Ok(Json(TranslateResponse::from(dispatched)))
}

/// Translate the segments of one document
pub async fn translate_segments(
    State(dispatcher): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<DocumentMessage>, JsonRejection>,
) -> Result<impl IntoResponse, DispatchError> {
    let Json(mut document) = payload.map_err(malformed)?;
    document.source_ip = KeyGenerator::client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    let results = dispatcher.handle_segments(document).await?;
    Ok(Json(SegmentsResponse::new(results)))
}

/// Health check endpoint
pub async fn health_check(State(dispatcher): State<AppState>) -> impl IntoResponse {
    let health = HealthChecker::new(&dispatcher).check_health();
    let status = if health.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health))
}

/// Dispatch counters since startup
pub async fn stats(State(dispatcher): State<AppState>) -> impl IntoResponse {
    Json(dispatcher.stats())
}

fn malformed(rejection: JsonRejection) -> DispatchError {
    DispatchError::Validation(rejection.body_text())
}
