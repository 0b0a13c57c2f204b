mod health;
mod metrics;
mod predict;

use crate::{model_service::ModelDecoder, state::AppState};
use axum::{
    routing::{get, post},
    Router,
};

pub use predict::{PredictError, PredictionResponse};

pub fn api_routes<D: ModelDecoder>() -> Router<AppState<D>> {
    Router::new()
        .route("/", get(health::index))
        .route("/health", get(health::healthcheck::<D>))
        .route("/metrics", get(metrics::metrics_handler::<D>))
        .route("/predict", post(predict::predict::<D>))
        .route("/doctor", post(predict::doctor::<D>))
}
