//! Infrastructure layer: outbox storage (in-memory, Postgres), the producer
//! `Publisher`, the processor tick and its polling worker, and configuration.

pub mod config;
pub mod outbox_store;
pub mod processor;
pub mod publisher;

pub use config::{ConfigError, ProcessorConfig};
pub use outbox_store::{
    FailureRecord, InMemoryOutboxStore, InMemoryUnitOfWork, OutboxStats, OutboxStore,
    OutboxStoreError, OutboxWriter, PostgresOutboxStore, Transition,
};
pub use processor::{OutboxProcessor, OutboxWorker, OutboxWorkerHandle, TickReport, WorkerStats};
pub use publisher::{PublishError, Publisher};
