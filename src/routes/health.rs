use crate::{model_service::ModelDecoder, state::AppState};
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Banner {
    message: String,
}

#[derive(Serialize)]
pub struct Status {
    status: String,
    model_loaded: bool,
}

pub async fn index() -> impl IntoResponse {
    Json(Banner {
        message: "Skin lesion classification API is running".into(),
    })
}

pub async fn healthcheck<D: ModelDecoder>(State(state): State<AppState<D>>) -> impl IntoResponse {
    Json(Status {
        status: "Available".into(),
        model_loaded: state.loader.is_loaded(),
    })
}
