use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

// CPU inference on a 224x224 image lands in the tens of milliseconds; the
// coarse tail covers the request that waits on the first model load.
const LATENCY_RANGES_MS: (i32, i32, i32, i32, i32) = (10, 50, 100, 500, 2000);
const LATENCY_STEPS_MS: (usize, usize, usize, usize) = (10, 25, 100, 500);

pub struct Metrics {
    request_counter: Counter<u64>,
    prediction_duration: Histogram<u64>,
    model_loads: Counter<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("lesion_classifier");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("prediction_requests_total")
            .with_description("Prediction requests by route and outcome")
            .build();

        let boundaries = generate_boundaries(LATENCY_RANGES_MS, LATENCY_STEPS_MS);

        let prediction_duration = meter
            .u64_histogram("prediction_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of preprocessing plus inference in milliseconds")
            .build();

        let model_loads = meter
            .u64_counter("model_load_waits_total")
            .with_description("Requests that had to wait on the model load, by outcome")
            .build();

        Ok(Metrics {
            request_counter,
            prediction_duration,
            model_loads,
            registry,
        })
    }

    pub fn record_request(&self, route: &str, outcome: &str) {
        let attributes = [
            KeyValue::new("route", route.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_prediction_duration(&self, duration_ms: u64, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.prediction_duration.record(duration_ms, &attributes);
    }

    pub fn record_model_load(&self, outcome: &str) {
        let attributes = [KeyValue::new("outcome", outcome.to_string())];
        self.model_loads.add(1, &attributes);
    }
}

/// Bucket edges for each `[parts.n, parts.n+1]` range, spaced by the matching
/// entry of `steps`.
fn generate_boundaries(
    parts: (i32, i32, i32, i32, i32),
    steps: (usize, usize, usize, usize),
) -> Vec<f64> {
    let first_part = (parts.0..=parts.1).step_by(steps.0);
    let middle_part = (parts.1..=parts.2).step_by(steps.1);
    let end_part = (parts.2..=parts.3).step_by(steps.2);
    let tail_part = (parts.3..=parts.4).step_by(steps.3);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
