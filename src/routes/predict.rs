use crate::{
    error::ErrorCode,
    formatter::{self, InferenceResult},
    inference::InferenceError,
    model_loader::ModelLoadError,
    model_service::ModelDecoder,
    preprocessing::{ImageInfo, PreprocessError},
    state::AppState,
};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("No file uploaded. Please provide a PNG or JPEG image file.")]
    MissingUpload,
    #[error("Invalid multipart request: {message}")]
    Multipart { status: StatusCode, message: String },
    #[error("Invalid or unsupported image file: {source}")]
    Image {
        #[source]
        source: PreprocessError,
        supported_formats: String,
    },
    #[error("Model unavailable: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("{0}")]
    Inference(#[from] InferenceError),
    #[error("Request task failed: {0}")]
    Task(String),
}

impl PredictError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PredictError::MissingUpload | PredictError::Multipart { .. } => {
                ErrorCode::InvalidRequest
            }
            PredictError::Image { source, .. } => source.code(),
            PredictError::ModelLoad(e) => e.code(),
            PredictError::Inference(e) => e.code(),
            PredictError::Task(_) => ErrorCode::InferenceFailure,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PredictError::MissingUpload | PredictError::Image { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PredictError::Multipart { status, .. } => *status,
            PredictError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
            PredictError::Inference(e) if e.is_contract_violation() => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PredictError::Inference(_) | PredictError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    supported_formats: Option<String>,
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = self.status();
        let supported_formats = match &self {
            PredictError::Image {
                supported_formats, ..
            } => Some(supported_formats.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            supported_formats,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    #[serde(flatten)]
    pub prediction: InferenceResult,
    pub filename: Option<String>,
    pub endpoint: &'static str,
    pub image_info: ImageInfo,
}

struct Upload {
    filename: Option<String>,
    content_type: Option<String>,
    bytes: Bytes,
}

fn multipart_error(status: StatusCode, message: String) -> PredictError {
    PredictError::Multipart { status, message }
}

/// Takes the field named `file`, falling back to the first field that
/// carries a file name.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, PredictError> {
    let mut fallback = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e.status(), e.body_text()))?
    {
        let is_file_field = field.name() == Some("file");
        if !is_file_field && field.file_name().is_none() {
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e.status(), e.body_text()))?;
        let upload = Upload {
            filename,
            content_type,
            bytes,
        };

        if is_file_field {
            return Ok(upload);
        }
        if fallback.is_none() {
            fallback = Some(upload);
        }
    }

    fallback.ok_or(PredictError::MissingUpload)
}

#[instrument(skip(state, multipart))]
pub async fn predict<D: ModelDecoder>(
    State(state): State<AppState<D>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, PredictError> {
    classify_upload(state, multipart, "/predict").await
}

#[instrument(skip(state, multipart))]
pub async fn doctor<D: ModelDecoder>(
    State(state): State<AppState<D>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, PredictError> {
    classify_upload(state, multipart, "/doctor").await
}

async fn classify_upload<D: ModelDecoder>(
    state: AppState<D>,
    multipart: Result<Multipart, MultipartRejection>,
    endpoint: &'static str,
) -> Result<Json<PredictionResponse>, PredictError> {
    let started = Instant::now();
    let result = run_pipeline(&state, multipart, endpoint).await;

    match &result {
        Ok(response) => {
            state.metrics.record_request(endpoint, "success");
            state
                .metrics
                .record_prediction_duration(started.elapsed().as_millis() as u64, endpoint);
            tracing::info!(
                label = %response.prediction.label,
                confidence = response.prediction.confidence,
                "Prediction completed"
            );
        }
        Err(e) => {
            state.metrics.record_request(endpoint, e.code().as_str());
            if e.status().is_server_error() {
                tracing::error!(code = e.code().as_str(), "Prediction failed: {}", e);
            } else {
                tracing::warn!(code = e.code().as_str(), "Rejected upload: {}", e);
            }
        }
    }

    result.map(Json)
}

async fn run_pipeline<D: ModelDecoder>(
    state: &AppState<D>,
    multipart: Result<Multipart, MultipartRejection>,
    endpoint: &'static str,
) -> Result<PredictionResponse, PredictError> {
    let mut multipart = multipart.map_err(|e| multipart_error(e.status(), e.body_text()))?;
    let upload = read_upload(&mut multipart).await?;
    tracing::info!(
        filename = ?upload.filename,
        content_type = ?upload.content_type,
        bytes = upload.bytes.len(),
        "Received upload"
    );

    let preprocessor = state.preprocessor.clone();
    let bytes = upload.bytes.clone();
    let content_type = upload.content_type.clone();
    let processed = tokio::task::spawn_blocking(move || {
        preprocessor.preprocess(&bytes, content_type.as_deref())
    })
    .await
    .map_err(|e| PredictError::Task(e.to_string()))?
    .map_err(|source| PredictError::Image {
        source,
        supported_formats: state.preprocessor.supported_formats_message(),
    })?;

    let model = state.model().await?;

    let engine = state.engine;
    let labels = state.labels.clone();
    let tensor = processed.tensor;
    let prediction = tokio::task::spawn_blocking(move || {
        let distribution = engine.infer(&*model, &tensor)?;
        formatter::format(&distribution, &labels)
    })
    .await
    .map_err(|e| PredictError::Task(e.to_string()))??;

    Ok(PredictionResponse {
        prediction,
        filename: upload.filename,
        endpoint,
        image_info: processed.info,
    })
}
