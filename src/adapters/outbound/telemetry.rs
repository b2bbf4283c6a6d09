use std::collections::HashMap;

use tracing::event;

use crate::core::ports::TelemetrySink;

/// Emits run lifecycle events on the `expenseflow::telemetry` target.
#[derive(Debug, Default)]
pub struct TracingTelemetrySink;

impl TracingTelemetrySink {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetrySink for TracingTelemetrySink {
    fn record_event(&self, event_name: &str, properties: HashMap<String, String>) {
        let mut props: Vec<_> = properties.into_iter().collect();
        props.sort();
        event!(target: "expenseflow::telemetry", tracing::Level::INFO, %event_name, props = ?props);
    }
}
