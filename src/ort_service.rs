use crate::{
    inference::InferenceError,
    model_service::{Classifier, ModelDecoder},
};
use ndarray::ArrayView4;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Builds ONNX Runtime sessions from the graph bytes held in the artifact.
#[derive(Debug, Clone)]
pub struct OnnxDecoder {
    num_instances: usize,
    intra_threads: usize,
}

impl OnnxDecoder {
    pub fn new(num_instances: usize) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            num_instances: num_instances.max(1),
            intra_threads: (cores / num_instances.max(1)).max(1),
        }
    }
}

impl ModelDecoder for OnnxDecoder {
    type Model = OnnxClassifier;

    fn decode(&self, graph: &[u8]) -> Result<OnnxClassifier, String> {
        let sessions = (0..self.num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_intra_threads(self.intra_threads)?
                    .commit_from_memory(graph)?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| e.to_string())?;

        let (input_name, input_shape, output_name, num_classes) = {
            let session = sessions[0].lock();
            let input = session
                .inputs
                .first()
                .ok_or_else(|| "model declares no inputs".to_string())?;
            let output = session
                .outputs
                .first()
                .ok_or_else(|| "model declares no outputs".to_string())?;

            let input_shape: Vec<Option<usize>> = input
                .input_type
                .tensor_shape()
                .ok_or_else(|| format!("input {} is not a tensor", input.name))?
                .iter()
                .map(|&d| (d > 0).then_some(d as usize))
                .collect();
            if input_shape.len() != 4 {
                return Err(format!(
                    "input {} has rank {}, expected a 4D image batch",
                    input.name,
                    input_shape.len()
                ));
            }
            let num_classes = output
                .output_type
                .tensor_shape()
                .and_then(|shape| shape.last().copied())
                .and_then(|d| (d > 0).then_some(d as usize));

            (
                input.name.clone(),
                input_shape,
                output.name.clone(),
                num_classes,
            )
        };

        tracing::info!(
            sessions = sessions.len(),
            input = %input_name,
            output = %output_name,
            ?input_shape,
            ?num_classes,
            "Created ONNX sessions"
        );

        Ok(OnnxClassifier {
            sessions,
            counter: AtomicUsize::new(0),
            input_name,
            input_shape,
            output_name,
            num_classes,
        })
    }
}

/// Session pool for one graph. Sessions need exclusive access while running,
/// so requests are spread round-robin over independently locked instances.
pub struct OnnxClassifier {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    input_name: String,
    input_shape: Vec<Option<usize>>,
    output_name: String,
    num_classes: Option<usize>,
}

impl Classifier for OnnxClassifier {
    fn input_shape(&self) -> &[Option<usize>] {
        &self.input_shape
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }

    fn classify(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, InferenceError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index].lock();
        tracing::debug!("Handling request with session {}", index);

        let owned_buffer;
        let input_view = if input.is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| InferenceError::Runtime(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor_ref])
            .map_err(|e| InferenceError::Runtime(format!("inference failed: {}", e)))?;

        let (_, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Runtime(format!("failed to extract tensor: {}", e)))?;

        Ok(data.to_vec())
    }
}
