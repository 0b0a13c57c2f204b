use crate::{model_service::ModelDecoder, state::AppState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler<D: ModelDecoder>(State(state): State<AppState<D>>) -> Response {
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    match String::from_utf8(buffer) {
        Ok(body) => body.into_response(),
        Err(e) => {
            tracing::error!("Metrics are not valid UTF-8: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
