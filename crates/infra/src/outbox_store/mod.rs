//! Outbox event storage boundary.
//!
//! `OutboxWriter` is the producer side: it appends rows inside the caller's
//! unit of work. `OutboxStore` is the consumer side: atomic claims, owner-guarded
//! outcome transitions, stale lock recovery, and read-only inspection.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryOutboxStore, InMemoryUnitOfWork};
pub use postgres::PostgresOutboxStore;
pub use r#trait::{
    FailureRecord, OutboxStats, OutboxStore, OutboxStoreError, OutboxWriter, Transition,
};
