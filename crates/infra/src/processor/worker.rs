//! Background polling loop around an `OutboxProcessor`.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use super::tick::{OutboxProcessor, TickReport};
use crate::outbox_store::{OutboxStore, OutboxStoreError};

/// Cumulative counters over the worker's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub released: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub quarantined: u64,
    pub skipped: u64,
    pub expired: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Error of the most recent aborted tick.
    pub last_error: Option<String>,
}

impl WorkerStats {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.released += report.released;
        self.claimed += report.claimed as u64;
        self.succeeded += report.succeeded as u64;
        self.retried += report.retried as u64;
        self.quarantined += report.quarantined as u64;
        self.skipped += report.skipped as u64;
        self.expired += report.expired as u64;
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct OutboxWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl OutboxWorkerHandle {
    /// Request shutdown and wait for the in-progress tick (if any) to finish.
    ///
    /// Returns the final counters.
    pub async fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "outbox worker task ended abnormally");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Polls the outbox on `poll_interval`, one tick at a time.
pub struct OutboxWorker;

impl OutboxWorker {
    /// Start ticking on the current tokio runtime.
    ///
    /// A disabled processor (`enabled = false`) starts an idle worker that
    /// only waits for shutdown.
    pub fn spawn<S>(processor: OutboxProcessor<S>) -> OutboxWorkerHandle
    where
        S: OutboxStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(run(processor, shutdown_rx, stats.clone()));

        OutboxWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

async fn run<S: OutboxStore>(
    processor: OutboxProcessor<S>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let config = processor.config();
    let worker_id = processor.worker_id().clone();

    if !config.enabled {
        info!(worker_id = %worker_id, "outbox processor disabled");
        let _ = shutdown.wait_for(|stop| *stop).await;
        return;
    }

    info!(
        worker_id = %worker_id,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        max_concurrency = config.max_concurrency,
        "outbox worker started"
    );

    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let result = processor.tick().await;
                if let Err(err) = &result {
                    error!(worker_id = %worker_id, error = %err, "outbox tick aborted");
                }
                record_tick(&stats, result);
            }
        }
    }

    info!(worker_id = %worker_id, "outbox worker stopped");
}

fn record_tick(stats: &Mutex<WorkerStats>, result: Result<TickReport, OutboxStoreError>) {
    let mut totals = stats.lock().unwrap_or_else(|e| e.into_inner());
    totals.last_tick_at = Some(Utc::now());
    match result {
        Ok(report) => totals.absorb(&report),
        Err(err) => {
            totals.ticks += 1;
            totals.failed_ticks += 1;
            totals.last_error = Some(err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;
    use crate::outbox_store::{InMemoryOutboxStore, OutboxWriter};
    use async_trait::async_trait;
    use courier_core::WorkerId;
    use courier_events::{EventDraft, EventHandler, HandlerRegistry, IncomingEvent};
    use std::time::Duration;

    struct Ack;

    #[async_trait]
    impl EventHandler for Ack {
        fn event_type(&self) -> &str {
            "attendance.marked"
        }

        async fn handle(&self, _event: &IncomingEvent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config() -> ProcessorConfig {
        ProcessorConfig::default()
            .with_worker_id(WorkerId::new("loop-test").unwrap())
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn seeded_store(n: usize) -> Arc<InMemoryOutboxStore> {
        let store = InMemoryOutboxStore::arc();
        let mut uow = store.begin();
        for _ in 0..n {
            let draft =
                EventDraft::new("attendance.marked", serde_json::json!({}), Utc::now()).unwrap();
            store.insert(&mut uow, draft).await.unwrap();
        }
        store.commit(uow).unwrap();
        store
    }

    #[tokio::test]
    async fn worker_drains_outbox_until_shutdown() {
        let store = seeded_store(25).await;
        let registry = HandlerRegistry::new().with(Ack).unwrap();
        let processor = OutboxProcessor::new(store.clone(), registry, config());

        let handle = OutboxWorker::spawn(processor);
        for _ in 0..200 {
            if store.stats().await.unwrap().done == 25 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.shutdown().await;

        assert_eq!(store.stats().await.unwrap().done, 25);
        assert_eq!(stats.succeeded, 25);
        assert!(stats.ticks >= 3);
        assert_eq!(stats.failed_ticks, 0);
    }

    #[tokio::test]
    async fn disabled_worker_never_ticks() {
        let store = seeded_store(3).await;
        let mut config = config();
        config.enabled = false;
        let processor = OutboxProcessor::new(store.clone(), HandlerRegistry::new(), config);

        let handle = OutboxWorker::spawn(processor);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.stats().ticks, 0);
        let stats = handle.shutdown().await;

        assert_eq!(stats.ticks, 0);
        assert_eq!(store.stats().await.unwrap().new, 3);
    }
}
