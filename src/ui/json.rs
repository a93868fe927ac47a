//! ui::json
//!
//! Machine-readable view: one JSON object per event, one event per line.

use std::io::Write;

use super::view::{View, ViewEvent};

/// Serialize an event with its timestamp.
pub fn encode(event: &ViewEvent) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(event)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "@timestamp".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
    serde_json::to_string(&value)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonView;

impl JsonView {
    pub fn new() -> Self {
        Self
    }
}

impl View for JsonView {
    fn emit(&self, event: ViewEvent) {
        match encode(&event) {
            Ok(line) => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", line);
                let _ = out.flush();
            }
            Err(e) => tracing::error!(error = %e, "failed to encode view event"),
        }
    }
}
