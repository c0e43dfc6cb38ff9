//! Wiring for the `courier-worker` binary.
//!
//! Consumer modules register their handlers here. Out of the box the worker
//! ships an audit handler that records every delivery of the event types
//! listed in `OUTBOX_AUDIT_EVENT_TYPES` (comma separated).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use courier_events::{EventHandler, HandlerRegistry, IncomingEvent, RegistryError};

pub const AUDIT_EVENT_TYPES_VAR: &str = "OUTBOX_AUDIT_EVENT_TYPES";

/// Logs each delivered event with its identifiers and payload size.
#[derive(Debug, Clone)]
pub struct AuditLogHandler {
    event_type: String,
}

impl AuditLogHandler {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
        }
    }
}

#[async_trait]
impl EventHandler for AuditLogHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, event: &IncomingEvent) -> anyhow::Result<()> {
        let payload_bytes = event.payload.to_string().len();
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            occurred_at = %event.occurred_at,
            attempt = event.attempt,
            payload_bytes,
            "outbox event delivered"
        );
        Ok(())
    }
}

/// Split a comma separated list, dropping blanks and duplicates.
pub fn audit_event_types(raw: Option<&str>) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    for part in raw.unwrap_or_default().split(',') {
        let part = part.trim();
        if !part.is_empty() && !types.iter().any(|t| t == part) {
            types.push(part.to_string());
        }
    }
    types
}

/// Registry with one `AuditLogHandler` per listed type.
pub fn build_registry(audit_types: &[String]) -> Result<HandlerRegistry, RegistryError> {
    let mut registry = HandlerRegistry::new();
    for event_type in audit_types {
        registry.register(Arc::new(AuditLogHandler::new(event_type.clone())))?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_core::EventId;

    #[test]
    fn parses_audit_list() {
        assert_eq!(
            audit_event_types(Some(" attendance.marked, ,grade.published,attendance.marked ")),
            vec!["attendance.marked".to_string(), "grade.published".to_string()]
        );
        assert!(audit_event_types(None).is_empty());
    }

    #[test]
    fn registry_covers_listed_types() {
        let registry = build_registry(&audit_event_types(Some("a.b,c.d"))).unwrap();
        assert_eq!(registry.event_types(), vec!["a.b", "c.d"]);
    }

    #[tokio::test]
    async fn audit_handler_accepts_any_payload() {
        let handler = AuditLogHandler::new("attendance.marked");
        let event = IncomingEvent {
            id: EventId::new(),
            event_type: "attendance.marked".to_string(),
            payload: serde_json::json!({"student": 1}),
            occurred_at: Utc::now(),
            attempt: 1,
        };
        handler.handle(&event).await.unwrap();
    }
}
