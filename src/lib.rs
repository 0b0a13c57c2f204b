mod archive;
mod app;
mod error;
mod labels;
mod ort_service;
mod routes;
mod telemetry;

pub mod assembler;
pub mod config;
pub mod formatter;
pub mod inference;
pub mod model_loader;
pub mod model_service;
pub mod preprocessing;
pub mod server;
pub mod state;

pub use app::start_app;
pub use error::ErrorCode;
pub use labels::load_class_labels;
pub use routes::{PredictError, PredictionResponse};
pub use telemetry::Metrics;
