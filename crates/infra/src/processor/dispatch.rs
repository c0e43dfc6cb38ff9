//! One isolated handler invocation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use courier_events::{EventHandler, IncomingEvent, sanitize_error, sanitize_message};

/// How a single delivery attempt ended. `Err` carries the sanitized diagnostic.
pub(crate) type AttemptOutcome = Result<(), String>;

pub(crate) fn missing_handler(event_type: &str) -> String {
    sanitize_message(&format!("No handler registered for type {event_type}"))
}

/// Aborts the handler task when the invocation is dropped, so cancelling
/// the caller cancels the handler too.
struct HandlerTask<T>(JoinHandle<T>);

impl<T> Drop for HandlerTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `handler` in its own task, bounded by `limit`.
///
/// Errors, panics and timeouts all come back as `Err`; nothing escapes into
/// the caller's task. The handler task never outlives this future.
pub(crate) async fn invoke(
    handler: Arc<dyn EventHandler>,
    event: IncomingEvent,
    limit: Duration,
) -> AttemptOutcome {
    let mut task = HandlerTask(tokio::spawn(async move { handler.handle(&event).await }));

    match timeout(limit, &mut task.0).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(sanitize_error(&err)),
        Ok(Err(join_err)) if join_err.is_panic() => Err("handler panicked".to_string()),
        Ok(Err(_)) => Err("handler was cancelled".to_string()),
        Err(_) => Err(format!("handler timed out after {}ms", limit.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use courier_core::EventId;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Scripted(&'static str);

    #[async_trait]
    impl EventHandler for Scripted {
        fn event_type(&self) -> &str {
            "scripted"
        }

        async fn handle(&self, _event: &IncomingEvent) -> anyhow::Result<()> {
            match self.0 {
                "ok" => Ok(()),
                "fail" => Err(anyhow::anyhow!("smtp rejected token=abc123")
                    .context("could not notify guardian")),
                "panic" => panic!("handler bug"),
                _ => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            }
        }
    }

    fn event() -> IncomingEvent {
        IncomingEvent {
            id: EventId::new(),
            event_type: "scripted".to_string(),
            payload: serde_json::json!({}),
            occurred_at: Utc::now(),
            attempt: 1,
        }
    }

    async fn run(mode: &'static str) -> AttemptOutcome {
        invoke(Arc::new(Scripted(mode)), event(), Duration::from_millis(50)).await
    }

    #[tokio::test]
    async fn success_is_ok() {
        assert_eq!(run("ok").await, Ok(()));
    }

    #[tokio::test]
    async fn error_keeps_only_the_outer_message() {
        assert_eq!(run("fail").await, Err("could not notify guardian".to_string()));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        assert_eq!(run("panic").await, Err("handler panicked".to_string()));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        assert_eq!(run("hang").await, Err("handler timed out after 50ms".to_string()));
    }

    #[test]
    fn missing_handler_message_is_capped() {
        let event_type = "x".repeat(2_000);
        let message = missing_handler(&event_type);
        assert!(message.starts_with("No handler registered for type xxx"));
        assert!(message.chars().count() <= 500);
    }

    #[tokio::test]
    async fn dropping_the_invocation_aborts_the_handler() {
        struct Flags {
            started: AtomicBool,
            finished: AtomicBool,
        }

        struct Slow(Arc<Flags>);

        #[async_trait]
        impl EventHandler for Slow {
            fn event_type(&self) -> &str {
                "scripted"
            }

            async fn handle(&self, _event: &IncomingEvent) -> anyhow::Result<()> {
                self.0.started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.0.finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let flags = Arc::new(Flags {
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let invocation = tokio::spawn(invoke(
            Arc::new(Slow(flags.clone())),
            event(),
            Duration::from_secs(30),
        ));
        while !flags.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        invocation.abort();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!flags.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_handler_message_names_the_type() {
        assert_eq!(
            missing_handler("grade.published"),
            "No handler registered for type grade.published"
        );
    }
}
