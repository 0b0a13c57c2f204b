use crate::{
    inference::InferenceEngine,
    model_loader::{ModelLoadError, ModelLoader},
    model_service::{Classifier, ModelDecoder},
    preprocessing::ImagePreprocessor,
    telemetry::Metrics,
};
use std::sync::Arc;

/// Per-process context handed to every request. The model itself lives in
/// the loader and is created on first use.
pub struct AppState<D: ModelDecoder> {
    pub loader: Arc<ModelLoader<D>>,
    pub preprocessor: Arc<ImagePreprocessor>,
    pub engine: InferenceEngine,
    pub labels: Arc<Vec<String>>,
    pub metrics: Arc<Metrics>,
}

impl<D: ModelDecoder> AppState<D> {
    pub fn new(
        loader: ModelLoader<D>,
        preprocessor: ImagePreprocessor,
        engine: InferenceEngine,
        labels: Vec<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            loader: Arc::new(loader),
            preprocessor: Arc::new(preprocessor),
            engine,
            labels: Arc::new(labels),
            metrics,
        }
    }

    /// Shared model, loading it first if this is the first caller. A model
    /// whose output width disagrees with the label file is never served.
    pub async fn model(&self) -> Result<Arc<D::Model>, ModelLoadError> {
        let first_load = !self.loader.is_loaded();
        let result = self.loader.load().await.and_then(|model| {
            self.check_labels(&model)?;
            Ok(model)
        });

        if first_load {
            match &result {
                Ok(_) => self.metrics.record_model_load("success"),
                Err(e) => self.metrics.record_model_load(e.code().as_str()),
            }
        }
        result
    }

    fn check_labels(&self, model: &D::Model) -> Result<(), ModelLoadError> {
        match model.num_classes() {
            Some(classes) if classes != self.labels.len() => {
                tracing::error!(
                    classes,
                    labels = self.labels.len(),
                    "Model output width does not match the label file"
                );
                Err(ModelLoadError::LabelMismatch {
                    classes,
                    labels: self.labels.len(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl<D: ModelDecoder> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            loader: self.loader.clone(),
            preprocessor: self.preprocessor.clone(),
            engine: self.engine,
            labels: self.labels.clone(),
            metrics: self.metrics.clone(),
        }
    }
}
