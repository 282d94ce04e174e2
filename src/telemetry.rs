//! Telemetry events and the sink they are handed to

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

/// Sent when the host platform cannot run the selected full server.
pub const PLATFORM_NOT_SUPPORTED: &str = "language_server.platform_not_supported";
/// Sent when the full server prerequisites are missing.
pub const NOT_INSTALLED: &str = "language_server.not_installed";
/// Sent when an activation falls back to the simple server.
pub const FALLBACK: &str = "language_server.fallback";
/// Sent once per successful activation.
pub const STARTUP: &str = "language_server.startup";

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub name: String,
    pub measures: BTreeMap<String, f64>,
    pub properties: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            measures: BTreeMap::new(),
            properties: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_measure(mut self, key: impl Into<String>, value: f64) -> Self {
        self.measures.insert(key.into(), value);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Fire-and-forget destination for telemetry events.
///
/// Failures are reported back only so callers can log them; they never alter
/// the outcome of the operation that produced the event.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent) -> anyhow::Result<()>;
}

/// Hands an event to the sink, logging and discarding any failure.
pub fn send(sink: &dyn TelemetrySink, event: TelemetryEvent) {
    let name = event.name.clone();
    if let Err(e) = sink.emit(event) {
        tracing::warn!("Failed to send telemetry event {}: {}", name, e);
    }
}

/// Writes telemetry as structured log records on the `telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: TelemetryEvent) -> anyhow::Result<()> {
        let measures = serde_json::to_string(&event.measures)?;
        let properties = serde_json::to_string(&event.properties)?;
        info!(
            target: "telemetry",
            event = %event.name,
            measures = %measures,
            properties = %properties,
            recorded_at = %event.recorded_at.to_rfc3339(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn emit(&self, _event: TelemetryEvent) -> anyhow::Result<()> {
            anyhow::bail!("pipeline unavailable")
        }
    }

    #[test]
    fn builder_collects_measures_and_properties() {
        let event = TelemetryEvent::new(STARTUP)
            .with_measure("duration", 12.5)
            .with_property("variant", "simple");

        assert_eq!(event.measures.get("duration"), Some(&12.5));
        assert_eq!(
            event.properties.get("variant").map(String::as_str),
            Some("simple")
        );
    }

    #[test]
    fn send_swallows_sink_failures() {
        send(&FailingSink, TelemetryEvent::new(FALLBACK));
    }

    #[test]
    fn tracing_sink_accepts_events() {
        assert!(TracingTelemetry.emit(TelemetryEvent::new(STARTUP)).is_ok());
    }
}
