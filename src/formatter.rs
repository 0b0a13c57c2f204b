use crate::inference::InferenceError;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelConfidence {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    pub label: String,
    pub confidence: f32,
    pub all_predictions: Vec<LabelConfidence>,
}

/// Pairs each probability with its label and ranks them, highest first.
/// Equal confidences keep class index order.
pub fn format(distribution: &[f32], labels: &[String]) -> Result<InferenceResult, InferenceError> {
    if distribution.len() != labels.len() || labels.is_empty() {
        return Err(InferenceError::LabelMismatch {
            expected: labels.len(),
            actual: distribution.len(),
        });
    }

    let mut ranked: Vec<(usize, f32)> = distribution.iter().copied().enumerate().collect();
    ranked.sort_by(|(ia, a), (ib, b)| b.total_cmp(a).then(ia.cmp(ib)));

    let all_predictions: Vec<LabelConfidence> = ranked
        .into_iter()
        .map(|(index, confidence)| LabelConfidence {
            label: labels[index].clone(),
            confidence,
        })
        .collect();
    let top = &all_predictions[0];

    Ok(InferenceResult {
        label: top.label.clone(),
        confidence: top.confidence,
        all_predictions,
    })
}
