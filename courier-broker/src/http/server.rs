use std::{future::Future, io};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::{
    http::types::{
        ConnectionQuery, ErrorResponse, HealthResponse, ReceiveRequest, RetryAccepted, SendRequest,
    },
    BrokerError, DeliveryCoordinator,
};

pub fn router(coordinator: DeliveryCoordinator) -> Router {
    Router::new()
        .route("/send", post(send))
        .route("/receive", post(receive))
        .route("/failures", get(failures))
        .route("/retry", post(retry))
        .route("/health", get(health))
        .with_state(coordinator)
}

/// Serve the HTTP surface on `listener` until `shutdown` resolves.
pub async fn run_server<F>(
    listener: TcpListener,
    coordinator: DeliveryCoordinator,
    shutdown: F,
) -> Result<(), io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Courier broker listening on {}", addr);
    }
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn send(
    State(coordinator): State<DeliveryCoordinator>,
    Json(request): Json<SendRequest>,
) -> Response {
    match coordinator
        .send(&request.connection_name, &request.message, &request.configuration)
        .await
    {
        Ok(receipts) => json_response(StatusCode::OK, receipts),
        Err(err) => error_response(err),
    }
}

async fn receive(
    State(coordinator): State<DeliveryCoordinator>,
    Json(request): Json<ReceiveRequest>,
) -> Response {
    match coordinator
        .receive(&request.connection_name, &request.configuration)
        .await
    {
        Ok(deliveries) => json_response(StatusCode::OK, deliveries),
        Err(err) => error_response(err),
    }
}

async fn failures(
    State(coordinator): State<DeliveryCoordinator>,
    Query(query): Query<ConnectionQuery>,
) -> Response {
    match coordinator.failures(query.connection.as_deref()).await {
        Ok(entries) => json_response(StatusCode::OK, entries),
        Err(err) => error_response(err),
    }
}

async fn retry(
    State(coordinator): State<DeliveryCoordinator>,
    Query(query): Query<ConnectionQuery>,
) -> Response {
    if coordinator.is_shutting_down() {
        return error_response(BrokerError::ShuttingDown);
    }
    let scope = match query.connection {
        Some(name) => {
            if !coordinator.registry().contains(&name) {
                return error_response(BrokerError::NotConfigured(name));
            }
            coordinator.spawn_retry_connection(&name);
            name
        }
        None => {
            coordinator.spawn_retry_all();
            "all".to_string()
        }
    };
    json_response(StatusCode::ACCEPTED, RetryAccepted { scope })
}

async fn health(State(coordinator): State<DeliveryCoordinator>) -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            connections: coordinator.statuses(),
            pending_failures: coordinator.pending_failures(),
        },
    )
}

fn error_response(err: BrokerError) -> Response {
    let (status, code) = match &err {
        BrokerError::NotConfigured(_) => (StatusCode::NOT_FOUND, "not_configured"),
        BrokerError::InvalidConfiguration { .. } => (StatusCode::BAD_REQUEST, "invalid_configuration"),
        BrokerError::SendFailed { .. } => (StatusCode::SERVICE_UNAVAILABLE, "send_failed"),
        BrokerError::Transport { .. } => (StatusCode::BAD_GATEWAY, "transport"),
        BrokerError::NotImplemented(_) => (StatusCode::NOT_IMPLEMENTED, "not_implemented"),
        BrokerError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
        BrokerError::NotRecorded { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "not_recorded"),
        BrokerError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
        BrokerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    if status.is_server_error() {
        warn!("Request failed: {}", err);
    }
    json_response(status, ErrorResponse::new(code, err.to_string()))
}

fn json_response<T>(status: StatusCode, payload: T) -> Response
where
    T: Serialize,
{
    (status, Json(payload)).into_response()
}
