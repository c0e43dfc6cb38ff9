use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{EventId, WorkerId};
use courier_events::{EventDraft, EventStatus, OutboxEvent};

use super::r#trait::{
    FailureRecord, OutboxStats, OutboxStore, OutboxStoreError, OutboxWriter, Transition,
};

/// In-memory outbox store.
///
/// Intended for tests/dev and single-process deployments. Every transition
/// runs under one write lock, which makes claims atomic within the process.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    rows: RwLock<HashMap<EventId, OutboxEvent>>,
}

/// Rows staged by a producer; visible to the store only after `commit`.
///
/// Dropping the unit of work discards its rows (rollback).
#[derive(Debug, Default)]
pub struct InMemoryUnitOfWork {
    staged: Vec<OutboxEvent>,
}

impl InMemoryUnitOfWork {
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Open a unit of work for producer inserts.
    pub fn begin(&self) -> InMemoryUnitOfWork {
        InMemoryUnitOfWork::default()
    }

    /// Publish every row staged in `uow` at once.
    pub fn commit(&self, uow: InMemoryUnitOfWork) -> Result<Vec<EventId>, OutboxStoreError> {
        let mut rows = self.rows.write().map_err(|_| OutboxStoreError::Poisoned)?;
        let ids = uow.staged.iter().map(|e| e.id).collect();
        for event in uow.staged {
            rows.insert(event.id, event);
        }
        Ok(ids)
    }

    /// Load a row exactly as given (fixtures, imports).
    ///
    /// The row must satisfy the lifecycle invariants.
    pub fn restore(&self, event: OutboxEvent) -> Result<(), OutboxStoreError> {
        event
            .check_invariants()
            .map_err(|e| OutboxStoreError::Decode(e.to_string()))?;
        let mut rows = self.rows.write().map_err(|_| OutboxStoreError::Poisoned)?;
        rows.insert(event.id, event);
        Ok(())
    }

    /// All rows, oldest `occurred_at` first.
    pub fn snapshot(&self) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = self.rows.read().map_err(|_| OutboxStoreError::Poisoned)?;
        let mut all: Vec<OutboxEvent> = rows.values().cloned().collect();
        sort_fifo(&mut all);
        Ok(all)
    }

    fn select(
        &self,
        limit: usize,
        filter: impl Fn(&OutboxEvent) -> bool,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = self.rows.read().map_err(|_| OutboxStoreError::Poisoned)?;
        let mut selected: Vec<OutboxEvent> = rows.values().filter(|e| filter(e)).cloned().collect();
        sort_fifo(&mut selected);
        selected.truncate(limit);
        Ok(selected)
    }

    fn transition(
        &self,
        id: EventId,
        worker: &WorkerId,
        apply: impl FnOnce(&mut OutboxEvent),
    ) -> Result<Transition, OutboxStoreError> {
        let mut rows = self.rows.write().map_err(|_| OutboxStoreError::Poisoned)?;
        match rows.get_mut(&id) {
            Some(row)
                if row.status == EventStatus::Processing
                    && row.locked_by.as_ref() == Some(worker) =>
            {
                apply(row);
                row.locked_by = None;
                row.locked_at = None;
                Ok(Transition::Applied)
            }
            _ => Ok(Transition::Skipped),
        }
    }
}

fn sort_fifo(events: &mut [OutboxEvent]) {
    events.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl OutboxWriter<InMemoryUnitOfWork> for InMemoryOutboxStore {
    async fn insert(
        &self,
        uow: &mut InMemoryUnitOfWork,
        draft: EventDraft,
    ) -> Result<EventId, OutboxStoreError> {
        let id = EventId::new();
        uow.staged.push(OutboxEvent::from_draft(id, draft));
        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_batch(
        &self,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut rows = self.rows.write().map_err(|_| OutboxStoreError::Poisoned)?;

        let mut eligible: Vec<(DateTime<Utc>, EventId)> = rows
            .values()
            .filter(|e| e.is_claimable(now))
            .map(|e| (e.occurred_at, e.id))
            .collect();
        eligible.sort();
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(row) = rows.get_mut(&id) {
                row.status = EventStatus::Processing;
                row.locked_by = Some(worker.clone());
                row.locked_at = Some(now);
                claimed.push(row.clone());
            }
        }

        Ok(claimed)
    }

    async fn mark_done(
        &self,
        id: EventId,
        worker: &WorkerId,
        processed_at: DateTime<Utc>,
    ) -> Result<Transition, OutboxStoreError> {
        self.transition(id, worker, |row| {
            row.status = EventStatus::Done;
            row.processed_at = Some(processed_at);
            row.next_retry_at = None;
        })
    }

    async fn mark_failed(
        &self,
        id: EventId,
        worker: &WorkerId,
        failure: FailureRecord,
    ) -> Result<Transition, OutboxStoreError> {
        self.transition(id, worker, |row| {
            row.status = EventStatus::Failed;
            row.last_error = Some(failure.error);
            row.attempts = row.attempts.max(failure.attempts);
            row.next_retry_at = failure.next_retry_at;
        })
    }

    async fn release_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        let mut rows = self.rows.write().map_err(|_| OutboxStoreError::Poisoned)?;
        let mut released = 0;

        for row in rows.values_mut() {
            let stale = row.status == EventStatus::Processing
                && row.locked_at.is_some_and(|at| at < stale_before);
            if !stale {
                continue;
            }

            let holder = row
                .locked_by
                .take()
                .map(|w| w.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            row.status = EventStatus::Failed;
            row.locked_at = None;
            row.next_retry_at = Some(now);
            row.last_error = Some(format!("lock expired (held by {holder})"));
            released += 1;
        }

        Ok(released)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let rows = self.rows.read().map_err(|_| OutboxStoreError::Poisoned)?;
        Ok(rows.get(&id).cloned())
    }

    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        self.select(limit, |e| e.status == status)
    }

    async fn list_terminal_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        self.select(limit, OutboxEvent::is_terminally_failed)
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = self.rows.read().map_err(|_| OutboxStoreError::Poisoned)?;
        let mut stats = OutboxStats::default();

        for row in rows.values() {
            match row.status {
                EventStatus::New => stats.new += 1,
                EventStatus::Processing => stats.processing += 1,
                EventStatus::Done => stats.done += 1,
                EventStatus::Failed if row.next_retry_at.is_some() => stats.failed_retryable += 1,
                EventStatus::Failed => stats.failed_terminal += 1,
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    fn draft(event_type: &str, occurred_at: DateTime<Utc>) -> EventDraft {
        EventDraft::new(event_type, serde_json::json!({"n": 1}), occurred_at).unwrap()
    }

    async fn seed(store: &InMemoryOutboxStore, n: i64, base: DateTime<Utc>) -> Vec<EventId> {
        let mut uow = store.begin();
        // Insert newest first so ordering must come from occurred_at.
        for i in (0..n).rev() {
            store
                .insert(&mut uow, draft("attendance.marked", base + Duration::seconds(i)))
                .await
                .unwrap();
        }
        store.commit(uow).unwrap()
    }

    #[tokio::test]
    async fn uncommitted_rows_are_invisible() {
        let store = InMemoryOutboxStore::new();
        let mut uow = store.begin();
        store
            .insert(&mut uow, draft("attendance.marked", Utc::now()))
            .await
            .unwrap();
        assert_eq!(uow.staged_len(), 1);

        drop(uow);

        assert!(store.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit_and_fifo_order() {
        let store = InMemoryOutboxStore::new();
        let base = Utc::now();
        seed(&store, 15, base).await;

        let claimed = store.claim_batch(&worker("w1"), 10, base).await.unwrap();

        assert_eq!(claimed.len(), 10);
        let times: Vec<_> = claimed.iter().map(|e| e.occurred_at).collect();
        let expected: Vec<_> = (0..10).map(|i| base + Duration::seconds(i)).collect();
        assert_eq!(times, expected);
        for e in &claimed {
            assert_eq!(e.status, EventStatus::Processing);
            assert_eq!(e.locked_by, Some(worker("w1")));
            assert_eq!(e.locked_at, Some(base));
            assert_eq!(e.attempts, 0);
        }

        let rest = store.claim_batch(&worker("w2"), 10, base).await.unwrap();
        assert_eq!(rest.len(), 5);
        assert!(store.claim_batch(&worker("w3"), 10, base).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_retries_are_not_claimed() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let ids = seed(&store, 1, now).await;
        let w = worker("w1");

        store.claim_batch(&w, 1, now).await.unwrap();
        store
            .mark_failed(
                ids[0],
                &w,
                FailureRecord {
                    error: "boom".into(),
                    attempts: 1,
                    next_retry_at: Some(now + Duration::seconds(30)),
                },
            )
            .await
            .unwrap();

        assert!(store.claim_batch(&w, 10, now).await.unwrap().is_empty());
        let due = store
            .claim_batch(&w, 10, now + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
    }

    #[tokio::test]
    async fn terminal_failures_are_never_claimed() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let ids = seed(&store, 1, now).await;
        let w = worker("w1");

        store.claim_batch(&w, 1, now).await.unwrap();
        store
            .mark_failed(
                ids[0],
                &w,
                FailureRecord {
                    error: "boom".into(),
                    attempts: 3,
                    next_retry_at: None,
                },
            )
            .await
            .unwrap();

        let far_future = now + Duration::days(3650);
        assert!(store.claim_batch(&w, 10, far_future).await.unwrap().is_empty());
        assert_eq!(store.list_terminal_failures(10).await.unwrap().len(), 1);
        assert_eq!(store.stats().await.unwrap().failed_terminal, 1);
    }

    #[tokio::test]
    async fn mark_done_is_idempotent_and_owner_guarded() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let ids = seed(&store, 1, now).await;
        let owner = worker("owner");

        store.claim_batch(&owner, 1, now).await.unwrap();

        assert_eq!(
            store.mark_done(ids[0], &worker("intruder"), now).await.unwrap(),
            Transition::Skipped
        );
        assert_eq!(
            store.mark_done(ids[0], &owner, now).await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            store.mark_done(ids[0], &owner, now).await.unwrap(),
            Transition::Skipped
        );

        let row = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Done);
        assert_eq!(row.processed_at, Some(now));
        assert!(row.locked_by.is_none() && row.locked_at.is_none());
        row.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn stale_locks_are_released_without_charging_an_attempt() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let ids = seed(&store, 2, now).await;
        let w = worker("crashed");

        // `seed` returns newest first: the older row (ids[1]) is claimed 10
        // minutes ago, the newer one (ids[0]) 1 minute ago.
        store.claim_batch(&w, 1, now - Duration::minutes(10)).await.unwrap();
        store.claim_batch(&w, 1, now - Duration::minutes(1)).await.unwrap();

        let released = store
            .release_stale_locks(now - Duration::minutes(5), now)
            .await
            .unwrap();
        assert_eq!(released, 1);

        let stale = store.get(ids[1]).await.unwrap().unwrap();
        assert_eq!(stale.status, EventStatus::Failed);
        assert_eq!(stale.attempts, 0);
        assert_eq!(stale.next_retry_at, Some(now));
        assert!(stale.locked_by.is_none() && stale.locked_at.is_none());
        assert!(stale.last_error.unwrap().contains("crashed"));

        let fresh = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(fresh.status, EventStatus::Processing);
        assert_eq!(fresh.locked_by, Some(w.clone()));

        // The original owner finishing late must not clobber the released row.
        assert_eq!(
            store.mark_done(ids[1], &w, now).await.unwrap(),
            Transition::Skipped
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_overlap() {
        let store = InMemoryOutboxStore::arc();
        let now = Utc::now();
        seed(&store, 200, now).await;

        let mut tasks = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let w = WorkerId::new(format!("w{}", n % 2)).unwrap();
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(&w, 7, now).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|e| e.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "event {id} claimed twice");
            }
        }
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn restore_rejects_rows_breaking_invariants() {
        let store = InMemoryOutboxStore::new();
        let mut row = OutboxEvent::from_draft(EventId::new(), draft("t", Utc::now()));
        row.status = EventStatus::Processing;

        assert!(matches!(
            store.restore(row),
            Err(OutboxStoreError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn stats_count_each_state() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let ids = seed(&store, 4, now).await;
        let w = worker("w1");

        let claimed = store.claim_batch(&w, 3, now).await.unwrap();
        assert_eq!(claimed[0].id, ids[3]);
        store.mark_done(claimed[0].id, &w, now).await.unwrap();
        store
            .mark_failed(
                claimed[1].id,
                &w,
                FailureRecord {
                    error: "x".into(),
                    attempts: 1,
                    next_retry_at: Some(now),
                },
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                new: 1,
                processing: 1,
                done: 1,
                failed_retryable: 1,
                failed_terminal: 0,
            }
        );
        assert_eq!(stats.total(), 4);
        assert_eq!(
            store.list_by_status(EventStatus::New, 10).await.unwrap().len(),
            1
        );
    }
}
