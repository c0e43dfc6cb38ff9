//! `courier-core`: foundation types shared by the outbox crates.
//!
//! This crate contains pure primitives (no storage, no async runtime).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{EventId, WorkerId};
