//! Outbox events: the row model, the producer and consumer contracts, and the retry policy.

pub mod diagnostic;
pub mod event;
pub mod handler;
pub mod registry;
pub mod retry;

pub use diagnostic::{sanitize_error, sanitize_message};
pub use event::{EventDraft, EventStatus, IntegrationEvent, OutboxEvent};
pub use handler::{EventHandler, IncomingEvent, Typed, TypedEventHandler, typed};
pub use registry::{HandlerRegistry, RegistryError};
pub use retry::RetryPolicy;
