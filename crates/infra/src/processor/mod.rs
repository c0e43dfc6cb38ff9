//! Outbox processing: the per-tick state machine and the polling worker.
//!
//! Each tick:
//! 1. releases `PROCESSING` rows whose lock is older than `stale_lock_timeout`,
//! 2. claims up to `batch_size` eligible rows,
//! 3. dispatches each to its registered handler (isolated task, bounded time),
//! 4. records `DONE`, a scheduled retry, or a terminal failure.
//!
//! Delivery is at-least-once; handlers must be idempotent.

mod dispatch;
pub mod tick;
pub mod worker;

pub use tick::{OutboxProcessor, TickReport};
pub use worker::{OutboxWorker, OutboxWorkerHandle, WorkerStats};
