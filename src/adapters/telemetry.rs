use serde_json::Value;
use tracing::info;

use crate::error::TelemetryError;

/// Fire-and-forget analytics sink.
///
/// Callers log and discard errors; a failing sink never affects queue state.
pub trait TelemetrySink: Send + Sync {
	fn track(&self, event: &str, properties: &Value) -> Result<(), TelemetryError>;
}

/// Emits telemetry as structured log lines under the `telemetry` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
	fn track(&self, event: &str, properties: &Value) -> Result<(), TelemetryError> {
		info!(target: "telemetry", event, %properties, "track");
		Ok(())
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
	fn track(&self, _event: &str, _properties: &Value) -> Result<(), TelemetryError> {
		Ok(())
	}
}
