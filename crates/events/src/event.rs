//! The outbox event record and the drafts producers append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{DomainError, DomainResult, EventId, WorkerId};

/// An integration event a producer module wants delivered.
///
/// Implemented by the producer's typed payload so it can be appended with
/// `EventDraft::from_typed` without hand-writing the type string.
pub trait IntegrationEvent {
    /// Stable routing key (e.g. "absence_notice.submitted").
    fn event_type(&self) -> &'static str;

    /// When the originating business fact happened.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Lifecycle status of an outbox row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Appended, never claimed.
    New,
    /// Claimed by a worker; `locked_by`/`locked_at` are set.
    Processing,
    /// Handled successfully.
    Done,
    /// Last attempt failed. Retryable while `next_retry_at` is set.
    Failed,
}

impl EventStatus {
    pub const ALL: [EventStatus; 4] = [
        EventStatus::New,
        EventStatus::Processing,
        EventStatus::Done,
        EventStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "NEW",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Done => "DONE",
            EventStatus::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown event status '{s}'")))
    }
}

/// An event as a producer hands it over, before it has an id or a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_type: String,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl EventDraft {
    pub fn new(
        event_type: impl Into<String>,
        payload: JsonValue,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(DomainError::validation("event_type must not be empty"));
        }
        Ok(Self {
            event_type,
            payload,
            occurred_at,
        })
    }

    /// Serialize a typed integration event into a draft.
    pub fn from_typed<E>(event: &E) -> DomainResult<Self>
    where
        E: IntegrationEvent + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            DomainError::validation(format!(
                "payload serialization failed for {}: {e}",
                event.event_type()
            ))
        })?;
        Self::new(event.event_type(), payload, event.occurred_at())
    }
}

/// A persisted outbox row.
///
/// Rows are only ever mutated through the store's atomic transitions
/// (claim, mark done, mark failed, release stale locks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub event_type: String,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,

    pub status: EventStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// A fresh `NEW` row for a draft.
    pub fn from_draft(id: EventId, draft: EventDraft) -> Self {
        Self {
            id,
            event_type: draft.event_type,
            payload: draft.payload,
            occurred_at: draft.occurred_at,
            status: EventStatus::New,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            locked_by: None,
            locked_at: None,
            processed_at: None,
        }
    }

    /// Whether `claim_batch(.., now)` may pick this row up.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EventStatus::New => true,
            EventStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            EventStatus::Processing | EventStatus::Done => false,
        }
    }

    /// `FAILED` with no retry scheduled: needs an operator.
    pub fn is_terminally_failed(&self) -> bool {
        self.status == EventStatus::Failed && self.next_retry_at.is_none()
    }

    /// `DONE` or terminally failed.
    pub fn is_terminal(&self) -> bool {
        self.status == EventStatus::Done || self.is_terminally_failed()
    }

    /// Verify the row-level invariants of the lifecycle.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.locked_by.is_some() != self.locked_at.is_some() {
            return Err(DomainError::invariant(format!(
                "event {}: locked_by and locked_at must be set together",
                self.id
            )));
        }

        let locked = self.locked_by.is_some();
        match self.status {
            EventStatus::Processing if !locked => Err(DomainError::invariant(format!(
                "event {}: PROCESSING without a lock",
                self.id
            ))),
            EventStatus::New | EventStatus::Done | EventStatus::Failed if locked => {
                Err(DomainError::invariant(format!(
                    "event {}: {} row still holds a lock",
                    self.id, self.status
                )))
            }
            EventStatus::Done if self.processed_at.is_none() => Err(DomainError::invariant(
                format!("event {}: DONE without processed_at", self.id),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[derive(Serialize)]
    struct AbsenceNoticeSubmitted {
        notice_id: u64,
        #[serde(skip)]
        at: DateTime<Utc>,
    }

    impl IntegrationEvent for AbsenceNoticeSubmitted {
        fn event_type(&self) -> &'static str {
            "absence_notice.submitted"
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn new_event() -> OutboxEvent {
        let draft = EventDraft::new("t", serde_json::json!({}), Utc::now()).unwrap();
        OutboxEvent::from_draft(EventId::new(), draft)
    }

    #[test]
    fn draft_from_typed_event_captures_metadata() {
        let at = Utc::now();
        let draft = EventDraft::from_typed(&AbsenceNoticeSubmitted { notice_id: 7, at }).unwrap();

        assert_eq!(draft.event_type, "absence_notice.submitted");
        assert_eq!(draft.occurred_at, at);
        assert_eq!(draft.payload, serde_json::json!({"notice_id": 7}));
    }

    #[test]
    fn draft_rejects_blank_type() {
        assert!(EventDraft::new("  ", serde_json::json!(null), Utc::now()).is_err());
    }

    #[test]
    fn new_row_starts_clean() {
        let ev = new_event();
        assert_eq!(ev.status, EventStatus::New);
        assert_eq!(ev.attempts, 0);
        assert!(ev.check_invariants().is_ok());
        assert!(ev.is_claimable(Utc::now()));
    }

    #[test]
    fn failed_row_is_claimable_only_once_due() {
        let now = Utc::now();
        let mut ev = new_event();
        ev.status = EventStatus::Failed;
        ev.next_retry_at = Some(now + Duration::seconds(5));

        assert!(!ev.is_claimable(now));
        assert!(ev.is_claimable(now + Duration::seconds(5)));

        ev.next_retry_at = None;
        assert!(!ev.is_claimable(now + Duration::days(365)));
        assert!(ev.is_terminally_failed());
        assert!(ev.is_terminal());
    }

    #[test]
    fn invariants_catch_half_set_locks() {
        let mut ev = new_event();
        ev.locked_by = Some(WorkerId::new("w1").unwrap());
        assert!(ev.check_invariants().is_err());

        ev.locked_at = Some(Utc::now());
        // NEW row with a lock
        assert!(ev.check_invariants().is_err());

        ev.status = EventStatus::Processing;
        assert!(ev.check_invariants().is_ok());
    }

    #[test]
    fn done_requires_processed_at() {
        let mut ev = new_event();
        ev.status = EventStatus::Done;
        assert!(ev.check_invariants().is_err());
        ev.processed_at = Some(Utc::now());
        assert!(ev.check_invariants().is_ok());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in EventStatus::ALL {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("DELIVERED".parse::<EventStatus>().is_err());
    }
}
