//! The processor tick: sweep, claim, dispatch, record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use courier_core::{Clock, SystemClock, WorkerId};
use courier_events::{HandlerRegistry, IncomingEvent, OutboxEvent, RetryPolicy};

use super::dispatch::{AttemptOutcome, invoke, missing_handler};
use crate::config::ProcessorConfig;
use crate::outbox_store::{FailureRecord, OutboxStore, OutboxStoreError, Transition};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Stale `PROCESSING` rows returned to the retry pool.
    pub released: u64,
    pub claimed: usize,
    pub succeeded: usize,
    /// Failed attempts with a retry scheduled.
    pub retried: usize,
    /// Failed attempts that used the last allowed attempt (terminal `FAILED`).
    pub quarantined: usize,
    /// Outcomes dropped because this worker no longer owned the row.
    pub skipped: usize,
    /// Claimed events left undispatched because their lock could go stale
    /// before the handler timeout.
    pub expired: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.released == 0 && self.claimed == 0
    }
}

/// Drives events through their lifecycle, one tick at a time.
///
/// A tick never overlaps with another tick of the same processor: `tick`
/// takes `&self` but the worker awaits each tick before scheduling the next.
pub struct OutboxProcessor<S> {
    store: S,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    config: ProcessorConfig,
}

impl<S: OutboxStore> OutboxProcessor<S> {
    pub fn new(store: S, registry: HandlerRegistry, config: ProcessorConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock),
            retry: config.retry_policy(),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the policy derived from the config (e.g. to add jitter).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one tick.
    ///
    /// A store error aborts the tick; rows already claimed stay `PROCESSING`
    /// and are recovered by a later stale lock sweep.
    pub async fn tick(&self) -> Result<TickReport, OutboxStoreError> {
        let now = self.clock.now();
        let worker = &self.config.worker_id;
        let mut report = TickReport::default();

        report.released = self
            .store
            .release_stale_locks(shift(now, self.config.stale_lock_timeout, false), now)
            .await?;
        if report.released > 0 {
            info!(worker_id = %worker, released = report.released, "released stale outbox locks");
        }

        let batch = self
            .store
            .claim_batch(worker, self.config.batch_size, now)
            .await?;
        report.claimed = batch.len();
        debug!(worker_id = %worker, claimed = report.claimed, "claimed outbox batch");

        self.dispatch(batch, &mut report).await?;

        if report.is_idle() {
            debug!(worker_id = %worker, "outbox tick idle");
        } else {
            info!(
                worker_id = %worker,
                released = report.released,
                claimed = report.claimed,
                succeeded = report.succeeded,
                retried = report.retried,
                quarantined = report.quarantined,
                skipped = report.skipped,
                expired = report.expired,
                "outbox tick completed"
            );
        }
        Ok(report)
    }

    /// Dispatch with at most `max_concurrency` handlers in flight, recording
    /// each outcome as soon as it is known. With a concurrency of 1 events
    /// run strictly in claim order.
    async fn dispatch(
        &self,
        batch: Vec<OutboxEvent>,
        report: &mut TickReport,
    ) -> Result<(), OutboxStoreError> {
        let limit = self.config.max_concurrency.max(1);
        let mut pending = batch.into_iter();
        let mut in_flight: JoinSet<(OutboxEvent, AttemptOutcome)> = JoinSet::new();

        loop {
            while in_flight.len() < limit {
                let Some(event) = pending.next() else { break };

                if self.lock_outlived(&event) {
                    report.expired += 1;
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        worker_id = %self.config.worker_id,
                        "outbox lock too old to dispatch, leaving it to the stale sweep"
                    );
                    continue;
                }

                let Some(handler) = self.registry.lookup(&event.event_type) else {
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "no outbox handler registered"
                    );
                    let outcome = Err(missing_handler(&event.event_type));
                    self.record(&event, outcome, report).await?;
                    continue;
                };

                debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempt = event.attempts + 1,
                    "dispatching outbox event"
                );
                let incoming = IncomingEvent::from(&event);
                let timeout = self.config.handler_timeout;
                in_flight.spawn(async move {
                    let outcome = invoke(handler, incoming, timeout).await;
                    (event, outcome)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                return Ok(());
            };
            match joined {
                Ok((event, outcome)) => self.record(&event, outcome, report).await?,
                // `invoke` contains handler panics; only runtime shutdown lands here.
                Err(err) => {
                    return Err(OutboxStoreError::Storage(format!(
                        "dispatch task failed: {err}"
                    )));
                }
            }
        }
    }

    /// True when a handler started now could still be running once another
    /// worker's sweep treats this lock as stale.
    fn lock_outlived(&self, event: &OutboxEvent) -> bool {
        let Some(locked_at) = event.locked_at else {
            return false;
        };
        let expires = shift(locked_at, self.config.stale_lock_timeout, true);
        shift(self.clock.now(), self.config.handler_timeout, true) >= expires
    }

    async fn record(
        &self,
        event: &OutboxEvent,
        outcome: AttemptOutcome,
        report: &mut TickReport,
    ) -> Result<(), OutboxStoreError> {
        let worker = &self.config.worker_id;
        let now = self.clock.now();

        let transition = match outcome {
            Ok(()) => {
                let transition = self.store.mark_done(event.id, worker, now).await?;
                if transition == Transition::Applied {
                    report.succeeded += 1;
                    debug!(event_id = %event.id, event_type = %event.event_type, "outbox event done");
                }
                transition
            }
            Err(error) => {
                let attempts = event.attempts.saturating_add(1);
                let final_attempt = self.retry.is_final(attempts);
                let next_retry_at =
                    (!final_attempt).then(|| shift(now, self.retry.backoff(attempts), true));

                let transition = self
                    .store
                    .mark_failed(
                        event.id,
                        worker,
                        FailureRecord {
                            error: error.clone(),
                            attempts,
                            next_retry_at,
                        },
                    )
                    .await?;

                if transition == Transition::Applied {
                    match next_retry_at {
                        Some(at) => {
                            report.retried += 1;
                            warn!(
                                event_id = %event.id,
                                event_type = %event.event_type,
                                attempts,
                                next_retry_at = %at,
                                error = %error,
                                "outbox event failed, retry scheduled"
                            );
                        }
                        None => {
                            report.quarantined += 1;
                            error!(
                                event_id = %event.id,
                                event_type = %event.event_type,
                                attempts,
                                error = %error,
                                "outbox event failed permanently"
                            );
                        }
                    }
                }
                transition
            }
        };

        if transition == Transition::Skipped {
            report.skipped += 1;
            warn!(
                event_id = %event.id,
                worker_id = %worker,
                "outbox lock lost before outcome was recorded"
            );
        }
        Ok(())
    }
}

impl<S> core::fmt::Debug for OutboxProcessor<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `at ± by`, saturating at the representable range.
fn shift(at: DateTime<Utc>, by: Duration, forward: bool) -> DateTime<Utc> {
    let shifted = chrono::Duration::from_std(by).ok().and_then(|delta| {
        if forward {
            at.checked_add_signed(delta)
        } else {
            at.checked_sub_signed(delta)
        }
    });
    match shifted {
        Some(t) => t,
        None if forward => DateTime::<Utc>::MAX_UTC,
        None => DateTime::<Utc>::MIN_UTC,
    }
}
