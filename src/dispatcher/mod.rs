//! Generic inbound-event dispatch (§4.4): validation, timeout enforcement,
//! ack-or-error response, and error counting around every registered
//! handler, driven by an event-name -> handler map.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;

use crate::error::CoreError;

/// Everything a handler needs to know about the socket that sent the event.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub socket_id: String,
    pub event: String,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, CoreError>> + Send>>;
pub type Handler = Arc<dyn Fn(DispatchContext, Value) -> HandlerFuture + Send + Sync>;

struct EventRegistration {
    handler: Handler,
    timeout: Option<Duration>,
}

/// §4.3.2's `handlerTimeout = max(clientTimeout - 1000, 100)`, applied to
/// whatever `clientTimeout` (milliseconds) the event payload carries.
fn handler_timeout_from_client_ms(client_timeout_ms: u64) -> Duration {
    Duration::from_millis(client_timeout_ms.saturating_sub(1000)).max(Duration::from_millis(100))
}

#[derive(Default)]
pub struct DispatchCounters {
    pub handled: AtomicU64,
    pub predictable_errors: AtomicU64,
    pub fatal_errors: AtomicU64,
    pub unknown_events: AtomicU64,
}

/// The result handed back to the transport layer so it can build the
/// client-facing ack envelope.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum DispatchOutcome {
    Ok { data: Value },
    Err { error: String },
}

pub struct EventDispatcher {
    handlers: HashMap<String, EventRegistration>,
    default_timeout: Duration,
    pub counters: Arc<DispatchCounters>,
}

impl EventDispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        EventDispatcher {
            handlers: HashMap::new(),
            default_timeout,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    /// Registers a handler that always runs under the dispatcher's
    /// `default_timeout`.
    pub fn register(&mut self, event: impl Into<String>, handler: Handler) {
        self.handlers.insert(
            event.into(),
            EventRegistration {
                handler,
                timeout: None,
            },
        );
    }

    /// Registers a handler with its own timeout override, per the
    /// registration contract `{eventName: {handler, ackExpected?, timeout?}}`
    /// (§4.4). Still overridden per-call by a `clientTimeout` in the payload.
    pub fn register_with_timeout(&mut self, event: impl Into<String>, handler: Handler, timeout: Duration) {
        self.handlers.insert(
            event.into(),
            EventRegistration {
                handler,
                timeout: Some(timeout),
            },
        );
    }

    /// The five-step contract: look up the handler, run it under a timeout,
    /// classify the outcome, update the counters, and hand back an envelope
    /// the caller can ack with. A [`CoreError::Fatal`] is logged and
    /// re-raised so the caller can close the connection — it is never
    /// swallowed like every other variant.
    pub async fn dispatch(&self, ctx: DispatchContext, payload: Value) -> Result<DispatchOutcome, CoreError> {
        let Some(registration) = self.handlers.get(&ctx.event) else {
            self.counters.unknown_events.fetch_add(1, Ordering::Relaxed);
            return Ok(DispatchOutcome::Err {
                error: format!("Unknown event: {}", ctx.event),
            });
        };

        let effective_timeout = payload
            .get("clientTimeout")
            .and_then(|v| v.as_u64())
            .map(handler_timeout_from_client_ms)
            .unwrap_or_else(|| registration.timeout.unwrap_or(self.default_timeout));

        let result = timeout(effective_timeout, (registration.handler)(ctx.clone(), payload)).await;

        match result {
            Ok(Ok(data)) => {
                self.counters.handled.fetch_add(1, Ordering::Relaxed);
                Ok(DispatchOutcome::Ok { data })
            }
            Ok(Err(err)) if err.is_predictable() => {
                self.counters.predictable_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %ctx.event, socket_id = %ctx.socket_id, error = %err, "Handler returned a predictable error");
                Ok(DispatchOutcome::Err { error: err.reason() })
            }
            Ok(Err(fatal)) => {
                self.counters.fatal_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(event = %ctx.event, socket_id = %ctx.socket_id, error = %fatal, "Fatal error in event handler");
                Err(fatal)
            }
            Err(_elapsed) => {
                self.counters.predictable_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %ctx.event, socket_id = %ctx.socket_id, "Handler timed out");
                Ok(DispatchOutcome::Err {
                    error: CoreError::Timeout.reason(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(event: &str) -> DispatchContext {
        DispatchContext {
            socket_id: "sock-1".into(),
            event: event.into(),
        }
    }

    #[tokio::test]
    async fn unknown_event_is_reported_without_incrementing_error_counters() {
        let dispatcher = EventDispatcher::new(Duration::from_millis(100));
        let outcome = dispatcher.dispatch(ctx("nope"), json!({})).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Err { .. }));
        assert_eq!(dispatcher.counters.unknown_events.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.counters.predictable_errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_handler_increments_handled_counter() {
        let mut dispatcher = EventDispatcher::new(Duration::from_millis(100));
        dispatcher.register(
            "ping",
            Arc::new(|_ctx, _payload| Box::pin(async move { Ok(json!({"pong": true})) })),
        );
        let outcome = dispatcher.dispatch(ctx("ping"), json!({})).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ok { .. }));
        assert_eq!(dispatcher.counters.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn predictable_error_is_swallowed_into_an_error_envelope() {
        let mut dispatcher = EventDispatcher::new(Duration::from_millis(100));
        dispatcher.register(
            "send",
            Arc::new(|_ctx, _payload| {
                Box::pin(async move { Err(CoreError::Validation("content required".into())) })
            }),
        );
        let outcome = dispatcher.dispatch(ctx("send"), json!({})).await.unwrap();
        match outcome {
            DispatchOutcome::Err { error } => assert_eq!(error, "content required"),
            _ => panic!("expected an error envelope"),
        }
        assert_eq!(dispatcher.counters.predictable_errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_error_propagates_instead_of_being_swallowed() {
        let mut dispatcher = EventDispatcher::new(Duration::from_millis(100));
        dispatcher.register(
            "boom",
            Arc::new(|_ctx, _payload| Box::pin(async move { Err(CoreError::Fatal("invariant broken".into())) })),
        );
        let result = dispatcher.dispatch(ctx("boom"), json!({})).await;
        assert!(matches!(result, Err(CoreError::Fatal(_))));
        assert_eq!(dispatcher.counters.fatal_errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_event_timeout_override_is_honored() {
        let mut dispatcher = EventDispatcher::new(Duration::from_millis(500));
        dispatcher.register_with_timeout(
            "slow",
            Arc::new(|_ctx, _payload| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({}))
                })
            }),
            Duration::from_millis(10),
        );
        let outcome = dispatcher.dispatch(ctx("slow"), json!({})).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Err { .. }));
    }

    #[tokio::test]
    async fn client_timeout_in_payload_overrides_registration_timeout() {
        let mut dispatcher = EventDispatcher::new(Duration::from_millis(500));
        dispatcher.register_with_timeout(
            "send",
            Arc::new(|_ctx, _payload| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({}))
                })
            }),
            Duration::from_secs(5),
        );
        // clientTimeout=1050ms -> handlerTimeout = max(1050-1000,100) = 100ms,
        // comfortably above the 50ms sleep, so this should still succeed.
        let outcome = dispatcher
            .dispatch(ctx("send"), json!({"clientTimeout": 1050}))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ok { .. }));
    }

    #[test]
    fn handler_timeout_from_client_ms_floors_at_100ms() {
        assert_eq!(handler_timeout_from_client_ms(500), Duration::from_millis(100));
        assert_eq!(handler_timeout_from_client_ms(5000), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let mut dispatcher = EventDispatcher::new(Duration::from_millis(10));
        dispatcher.register(
            "slow",
            Arc::new(|_ctx, _payload| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(json!({}))
                })
            }),
        );
        let outcome = dispatcher.dispatch(ctx("slow"), json!({})).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Err { .. }));
    }
}
