use metrics::Label;
use tracing::Span;

use crate::context::TelemetryLabels;

pub fn record_counter(name: &'static str, value: u64, labels: &TelemetryLabels) {
    metrics::counter!(name, to_labels(labels)).increment(value);
}

pub fn record_histogram(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::histogram!(name, to_labels(labels)).record(value);
}

pub fn record_gauge(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::gauge!(name, to_labels(labels)).set(value);
}

/// Records the recipient and outcome on a span declared with empty fields.
pub fn with_common_fields(span: &Span, recipient: Option<&str>, outcome: Option<&str>) {
    if let Some(recipient) = recipient {
        span.record("recipient", tracing::field::display(recipient));
    }
    if let Some(outcome) = outcome {
        span.record("outcome", tracing::field::display(outcome));
    }
}

fn to_labels(labels: &TelemetryLabels) -> Vec<Label> {
    labels
        .tags()
        .into_iter()
        .map(|(key, value)| Label::new(key, value))
        .collect()
}
