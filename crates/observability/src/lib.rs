pub mod metrics_collector;
pub mod scopes;
pub mod telemetry_setup;

pub use metrics_collector::{metric_names, ScopedMetrics};
pub use scopes::Scope;
pub use telemetry_setup::{init_logging, init_metrics};
