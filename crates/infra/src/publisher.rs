//! Producer-facing façade for appending integration events.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use courier_core::{DomainError, EventId};
use courier_events::{EventDraft, IntegrationEvent};

use crate::outbox_store::{OutboxStoreError, OutboxWriter};

#[derive(Debug, Error)]
pub enum PublishError {
    /// The draft was rejected before reaching storage.
    #[error("invalid event: {0}")]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Appends events inside the caller's unit of work `U`.
///
/// Publishing performs no dispatch. The row becomes visible to workers only
/// when the caller commits `U`; rolling back discards it together with the
/// business write.
pub struct Publisher<W, U: ?Sized> {
    writer: W,
    _uow: PhantomData<fn(&mut U)>,
}

impl<W: Clone, U: ?Sized> Clone for Publisher<W, U> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            _uow: PhantomData,
        }
    }
}

impl<W, U> Publisher<W, U>
where
    W: OutboxWriter<U>,
    U: Send + ?Sized,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            _uow: PhantomData,
        }
    }

    /// Serialize `payload` and append it as a `NEW` row.
    pub async fn publish<P>(
        &self,
        uow: &mut U,
        event_type: &str,
        payload: &P,
        occurred_at: DateTime<Utc>,
    ) -> Result<EventId, PublishError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).map_err(|e| {
            DomainError::validation(format!("payload serialization failed for {event_type}: {e}"))
        })?;
        let draft = EventDraft::new(event_type, payload, occurred_at)?;
        self.publish_draft(uow, draft).await
    }

    pub async fn publish_draft(
        &self,
        uow: &mut U,
        draft: EventDraft,
    ) -> Result<EventId, PublishError> {
        let event_type = draft.event_type.clone();
        let id = self.writer.insert(uow, draft).await?;
        debug!(event_id = %id, event_type = %event_type, "outbox event appended");
        Ok(id)
    }

    /// Append a typed integration event under its declared type.
    pub async fn publish_event<E>(&self, uow: &mut U, event: &E) -> Result<EventId, PublishError>
    where
        E: IntegrationEvent + Serialize,
    {
        self.publish_draft(uow, EventDraft::from_typed(event)?).await
    }
}

impl<W, U: ?Sized> core::fmt::Debug for Publisher<W, U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}
