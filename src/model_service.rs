use crate::inference::InferenceError;
use ndarray::ArrayView4;

/// A ready-to-run classifier. Implementations are shared read-only between
/// request tasks, so `classify` takes `&self`.
pub trait Classifier: Send + Sync + 'static {
    /// Declared input dimensions; `None` marks a dynamic axis such as the batch.
    fn input_shape(&self) -> &[Option<usize>];

    /// Width of the output row when the graph declares it.
    fn num_classes(&self) -> Option<usize>;

    /// Raw scores for a single-image batch.
    fn classify(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, InferenceError>;
}

/// Turns the serialized graph pulled out of the artifact into a classifier.
pub trait ModelDecoder: Send + Sync + 'static {
    type Model: Classifier;

    fn decode(&self, graph: &[u8]) -> Result<Self::Model, String>;
}
