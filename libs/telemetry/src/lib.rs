//! Tracing bootstrap and metric helpers shared by the Greentic messaging
//! services. Metrics go through the `metrics` facade; nothing is exported
//! unless the host process installs a recorder.

mod config;
mod context;
mod recorder;
mod tracing_init;

pub use config::{LogFormat, TelemetryConfig};
pub use context::TelemetryLabels;
pub use recorder::{record_counter, record_gauge, record_histogram, with_common_fields};
pub use tracing_init::init_telemetry;

