//! Consumer-side contract: handlers registered per event type.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use courier_core::EventId;

use crate::event::OutboxEvent;

/// What a handler sees of a claimed outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    pub id: EventId,
    pub event_type: String,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
    /// 1-based number of this delivery attempt.
    pub attempt: u32,
}

impl IncomingEvent {
    /// Deserialize the payload into the shape the handler expects.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

impl From<&OutboxEvent> for IncomingEvent {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            occurred_at: event.occurred_at,
            attempt: event.attempts.saturating_add(1),
        }
    }
}

/// Handles every event of one type.
///
/// Delivery is at-least-once: the same event may reach `handle` more than
/// once (retries, stale-lock recovery), so implementations must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The event type this handler consumes.
    fn event_type(&self) -> &str;

    /// Process one event. Any error counts as a failed attempt.
    async fn handle(&self, event: &IncomingEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    fn event_type(&self) -> &str {
        (**self).event_type()
    }

    async fn handle(&self, event: &IncomingEvent) -> anyhow::Result<()> {
        (**self).handle(event).await
    }
}

/// A handler that works on a deserialized payload instead of raw JSON.
#[async_trait]
pub trait TypedEventHandler: Send + Sync {
    type Payload: DeserializeOwned + Send + Sync;

    fn event_type(&self) -> &str;

    async fn handle(&self, event: &IncomingEvent, payload: Self::Payload) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> TypedEventHandler for Arc<H>
where
    H: TypedEventHandler + ?Sized,
{
    type Payload = H::Payload;

    fn event_type(&self) -> &str {
        (**self).event_type()
    }

    async fn handle(&self, event: &IncomingEvent, payload: Self::Payload) -> anyhow::Result<()> {
        (**self).handle(event, payload).await
    }
}

/// Adapter from `TypedEventHandler` to `EventHandler`.
pub struct Typed<H> {
    inner: H,
}

/// Wrap a typed handler so it can be registered.
pub fn typed<H: TypedEventHandler>(inner: H) -> Typed<H> {
    Typed { inner }
}

#[async_trait]
impl<H> EventHandler for Typed<H>
where
    H: TypedEventHandler,
{
    fn event_type(&self) -> &str {
        self.inner.event_type()
    }

    async fn handle(&self, event: &IncomingEvent) -> anyhow::Result<()> {
        let payload: H::Payload = event.payload_as().map_err(|e| {
            anyhow::anyhow!(
                "payload of {} could not be decoded: {}",
                event.event_type,
                decode_failure(&e)
            )
        })?;
        self.inner.handle(event, payload).await
    }
}

// Only the category: serde's message may quote payload contents.
fn decode_failure(err: &serde_json::Error) -> &'static str {
    match err.classify() {
        serde_json::error::Category::Io => "io error",
        serde_json::error::Category::Syntax => "syntax error",
        serde_json::error::Category::Data => "schema mismatch",
        serde_json::error::Category::Eof => "unexpected end of input",
    }
}
