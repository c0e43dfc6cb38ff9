use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use courier_core::{EventId, WorkerId};
use courier_events::{EventDraft, EventStatus, OutboxEvent};

/// Outbox store operation error.
///
/// These are **infrastructure errors**. Any of them aborts the current
/// processor tick; the next tick starts over from the persisted state.
#[derive(Debug, Error)]
pub enum OutboxStoreError {
    /// The backing storage failed or is unreachable.
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted row could not be decoded into an `OutboxEvent`.
    #[error("corrupt outbox row: {0}")]
    Decode(String),

    /// An in-process lock was poisoned by a panicking writer.
    #[error("outbox store lock poisoned")]
    Poisoned,
}

/// Result of an owner-guarded transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The row was `PROCESSING` under the caller's lock and has been updated.
    Applied,
    /// The row was not (or no longer) owned by the caller; nothing changed.
    Skipped,
}

/// Outcome of a failed attempt, as recorded by `mark_failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Sanitized diagnostic for `last_error`.
    pub error: String,
    /// Total attempts made so far, including the one that just failed.
    pub attempts: u32,
    /// `None` quarantines the event (terminal failure).
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Row counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub new: u64,
    pub processing: u64,
    pub done: u64,
    pub failed_retryable: u64,
    pub failed_terminal: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.new + self.processing + self.done + self.failed_retryable + self.failed_terminal
    }
}

/// Persisted table of outbox events and its atomic transitions.
///
/// ## Concurrency contract
///
/// Several processor instances (possibly in different processes) call these
/// operations concurrently. Implementations must guarantee:
///
/// - `claim_batch` is a single atomic step: two concurrent callers never
///   receive the same row, whatever their `WorkerId`s.
/// - every other transition is one atomic write scoped to one row (or, for
///   `release_stale_locks`, one statement over the matching rows), so a crash
///   never leaves a row half-updated.
///
/// Application-level mutexes are not enough on their own; coordination must
/// live in the storage (row locks, conditional updates).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` eligible rows, oldest `occurred_at` first.
    ///
    /// Eligible: `NEW`, or `FAILED` with `next_retry_at <= now`. Claimed rows
    /// become `PROCESSING` with `locked_by = worker`, `locked_at = now`; the
    /// returned events carry the payload and attempt count needed for dispatch.
    async fn claim_batch(
        &self,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// `PROCESSING -> DONE`, set `processed_at`, clear the lock.
    ///
    /// Returns `Skipped` (not an error) when the row is already `DONE` or no
    /// longer locked by `worker`.
    async fn mark_done(
        &self,
        id: EventId,
        worker: &WorkerId,
        processed_at: DateTime<Utc>,
    ) -> Result<Transition, OutboxStoreError>;

    /// `PROCESSING -> FAILED`, store the failure, clear the lock.
    async fn mark_failed(
        &self,
        id: EventId,
        worker: &WorkerId,
        failure: FailureRecord,
    ) -> Result<Transition, OutboxStoreError>;

    /// Move every `PROCESSING` row locked before `stale_before` to `FAILED`,
    /// immediately eligible (`next_retry_at = now`), without touching
    /// `attempts`. Returns the number of rows released.
    async fn release_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError>;

    /// Rows in `status`, oldest `occurred_at` first.
    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Quarantined rows (`FAILED` with no retry scheduled), oldest first.
    async fn list_terminal_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn claim_batch(
        &self,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).claim_batch(worker, limit, now).await
    }

    async fn mark_done(
        &self,
        id: EventId,
        worker: &WorkerId,
        processed_at: DateTime<Utc>,
    ) -> Result<Transition, OutboxStoreError> {
        (**self).mark_done(id, worker, processed_at).await
    }

    async fn mark_failed(
        &self,
        id: EventId,
        worker: &WorkerId,
        failure: FailureRecord,
    ) -> Result<Transition, OutboxStoreError> {
        (**self).mark_failed(id, worker, failure).await
    }

    async fn release_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        (**self).release_stale_locks(stale_before, now).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn list_terminal_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).list_terminal_failures(limit).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }
}

/// Producer-side insert, executed inside the caller's unit of work `U`.
///
/// The row must commit or roll back together with the business write that
/// shares `U` (a Postgres connection inside an open transaction, or an
/// in-memory unit of work).
#[async_trait]
pub trait OutboxWriter<U>: Send + Sync
where
    U: Send + ?Sized,
{
    /// Append a `NEW` row with `attempts = 0`.
    async fn insert(&self, uow: &mut U, draft: EventDraft) -> Result<EventId, OutboxStoreError>;
}

#[async_trait]
impl<U, W> OutboxWriter<U> for Arc<W>
where
    U: Send + ?Sized,
    W: OutboxWriter<U> + ?Sized,
{
    async fn insert(&self, uow: &mut U, draft: EventDraft) -> Result<EventId, OutboxStoreError> {
        (**self).insert(uow, draft).await
    }
}
