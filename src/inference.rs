use crate::{error::ErrorCode, model_service::Classifier};
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("input tensor shape {actual:?} does not match model input {expected}")]
    ShapeMismatch { expected: String, actual: Vec<usize> },
    #[error("model produced {actual} scores but {expected} classes are labelled")]
    LabelMismatch { expected: usize, actual: usize },
    #[error("model output is not a usable distribution: {0}")]
    InvalidOutput(String),
    #[error("inference runtime error: {0}")]
    Runtime(String),
}

impl InferenceError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InferenceFailure
    }

    /// Only an input that does not fit the model is the caller's fault.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, InferenceError::ShapeMismatch { .. })
    }
}

fn render_shape(shape: &[Option<usize>]) -> String {
    let dims: Vec<String> = shape
        .iter()
        .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
        .collect();
    format!("[{}]", dims.join(", "))
}

/// Runs the shared model and turns its raw output into a probability
/// distribution. Holds no per-request state.
#[derive(Debug, Clone, Copy)]
pub struct InferenceEngine {
    apply_softmax: bool,
}

impl InferenceEngine {
    pub fn new(apply_softmax: bool) -> Self {
        Self { apply_softmax }
    }

    pub fn infer<C: Classifier + ?Sized>(
        &self,
        model: &C,
        tensor: &Array4<f32>,
    ) -> Result<Vec<f32>, InferenceError> {
        let expected = model.input_shape();
        let actual = tensor.shape();
        let matches = expected.len() == actual.len()
            && expected
                .iter()
                .zip(actual)
                .all(|(e, a)| e.map_or(true, |e| e == *a));
        if !matches {
            return Err(InferenceError::ShapeMismatch {
                expected: render_shape(expected),
                actual: actual.to_vec(),
            });
        }

        let scores = model.classify(tensor.view())?;
        if let Some(classes) = model.num_classes() {
            if scores.len() != classes {
                return Err(InferenceError::InvalidOutput(format!(
                    "expected {} scores, got {}",
                    classes,
                    scores.len()
                )));
            }
        }

        self.to_distribution(scores)
    }

    fn to_distribution(&self, scores: Vec<f32>) -> Result<Vec<f32>, InferenceError> {
        if scores.is_empty() {
            return Err(InferenceError::InvalidOutput("empty output".to_string()));
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(InferenceError::InvalidOutput(
                "non-finite score".to_string(),
            ));
        }

        let scores = if self.apply_softmax {
            softmax(&scores)
        } else {
            scores
        };

        if scores.iter().any(|s| *s < 0.0) {
            return Err(InferenceError::InvalidOutput(
                "negative probability; enable apply_softmax for logit outputs".to_string(),
            ));
        }
        let total: f64 = scores.iter().map(|s| f64::from(*s)).sum();
        if total <= 0.0 {
            return Err(InferenceError::InvalidOutput(
                "scores sum to zero".to_string(),
            ));
        }

        Ok(scores
            .iter()
            .map(|s| (f64::from(*s) / total) as f32)
            .collect())
    }
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f64> = scores.iter().map(|s| f64::from(s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| (e / total) as f32).collect()
}
