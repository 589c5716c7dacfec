//! Outbox-style durable append.
//!
//! An external action (e.g. a payment call) runs as a dispatched job; its
//! completion signal lands here and becomes exactly one terminal domain
//! event per attempt, no matter how many times the signal is redelivered.
//! Success maps to `{entity}Completed`, failure and cancellation to
//! `{entity}Failed` with the error carried through. The matching command
//! intent is closed in the same step.

use std::sync::Arc;

use async_trait::async_trait;
use dispatch::{CompletionHandler, CompletionSignal};
use serde::{Deserialize, Serialize};
use store::{append_idempotent, AppendReceipt, EventRecord, TransactionalStore};

use crate::error::Result;
use crate::intent::CommandIntentLedger;

/// Completion-handler ID under which [`DurableAppendHandler`] is registered.
pub const DURABLE_APPEND_HANDLER: &str = "durability.durable_append";

/// Context supplied when an external action is dispatched, passed back
/// verbatim with its completion signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxContext {
    /// The external operation (e.g. `payment`). First segment of the
    /// idempotency key.
    pub operation: String,

    /// Event-type stem: success appends `{entity}Completed`, failure
    /// `{entity}Failed`.
    pub entity: String,

    /// The aggregate type the event belongs to.
    pub stream_type: String,

    /// The aggregate instance ID.
    pub stream_id: String,

    /// The command that triggered the external call.
    pub command_id: String,

    /// The bounded context the event belongs to.
    pub bounded_context: String,
}

impl OutboxContext {
    /// The idempotency key for the terminal event of this attempt. Also
    /// the intent key opened before dispatch.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.operation, self.stream_id, self.command_id)
    }
}

/// Turns action-completion signals into idempotent event appends.
pub struct DurableAppendHandler {
    store: Arc<dyn TransactionalStore>,
    intents: CommandIntentLedger,
}

impl DurableAppendHandler {
    /// Creates a handler over the given store.
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        let intents = CommandIntentLedger::new(Arc::clone(&store));
        Self { store, intents }
    }

    /// Records the terminal event for a completed action and closes the
    /// matching intent. Idempotent per `(operation, stream_id, command_id)`.
    #[tracing::instrument(skip(self, signal), fields(key = %ctx.idempotency_key()))]
    pub async fn handle(&self, signal: &CompletionSignal, ctx: &OutboxContext) -> Result<AppendReceipt> {
        let key = ctx.idempotency_key();

        let (event_type, payload, error) = match signal {
            CompletionSignal::Success { return_value } => (
                format!("{}Completed", ctx.entity),
                serde_json::json!({ "result": return_value }),
                None,
            ),
            CompletionSignal::Failed { error, attempts } => (
                format!("{}Failed", ctx.entity),
                serde_json::json!({ "error": error, "attempts": attempts }),
                Some(error.clone()),
            ),
            CompletionSignal::Canceled => (
                format!("{}Failed", ctx.entity),
                serde_json::json!({ "error": "canceled" }),
                Some("canceled".to_string()),
            ),
        };

        let record = EventRecord::builder()
            .idempotency_key(&key)
            .stream_type(&ctx.stream_type)
            .stream_id(&ctx.stream_id)
            .event_type(event_type)
            .payload_raw(payload)
            .bounded_context(&ctx.bounded_context)
            .build();

        let receipt = append_idempotent(self.store.as_ref(), record).await?;
        metrics::counter!("durable_appends_total").increment(1);

        match error {
            None => {
                self.intents.complete(&key, receipt.event_id).await?;
            }
            Some(error) => {
                self.intents.fail(&key, &error).await?;
            }
        }

        Ok(receipt)
    }
}

#[async_trait]
impl CompletionHandler for DurableAppendHandler {
    async fn on_complete(&self, signal: CompletionSignal, context: serde_json::Value) {
        let ctx: OutboxContext = match serde_json::from_value(context) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(error = %e, "malformed outbox context, signal dropped");
                return;
            }
        };

        if let Err(e) = self.handle(&signal, &ctx).await {
            tracing::error!(key = %ctx.idempotency_key(), error = %e, "durable append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::{AppendStatus, InMemoryStore};

    use crate::intent::IntentStatus;

    fn ctx() -> OutboxContext {
        OutboxContext {
            operation: "payment".to_string(),
            entity: "Payment".to_string(),
            stream_type: "order".to_string(),
            stream_id: "ORD-1".to_string(),
            command_id: "cmd-1".to_string(),
            bounded_context: "sales".to_string(),
        }
    }

    #[tokio::test]
    async fn success_appends_completed_event() {
        let store = Arc::new(InMemoryStore::new());
        let handler = DurableAppendHandler::new(store.clone());

        let receipt = handler
            .handle(
                &CompletionSignal::Success {
                    return_value: serde_json::json!({"charge_id": "ch_1"}),
                },
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.status, AppendStatus::Appended);

        let events = store.events_for_stream("order", "ORD-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "PaymentCompleted");
        assert_eq!(events[0].idempotency_key, "payment:ORD-1:cmd-1");
    }

    #[tokio::test]
    async fn failure_appends_failed_event_with_error() {
        let store = Arc::new(InMemoryStore::new());
        let handler = DurableAppendHandler::new(store.clone());

        handler
            .handle(
                &CompletionSignal::Failed {
                    error: "card declined".to_string(),
                    attempts: 3,
                },
                &ctx(),
            )
            .await
            .unwrap();

        let events = store.events_for_stream("order", "ORD-1").await.unwrap();
        assert_eq!(events[0].event_type, "PaymentFailed");
        assert_eq!(events[0].payload["error"], "card declined");
    }

    #[tokio::test]
    async fn redelivered_signal_appends_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let handler = DurableAppendHandler::new(store.clone());
        let signal = CompletionSignal::Success {
            return_value: serde_json::json!(null),
        };

        let first = handler.handle(&signal, &ctx()).await.unwrap();
        let second = handler.handle(&signal, &ctx()).await.unwrap();

        assert_eq!(first.status, AppendStatus::Appended);
        assert_eq!(second.status, AppendStatus::Duplicate);
        assert_eq!(second.event_id, first.event_id);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn redelivery_after_failure_does_not_flip_the_terminal_event() {
        let store = Arc::new(InMemoryStore::new());
        let handler = DurableAppendHandler::new(store.clone());

        handler
            .handle(
                &CompletionSignal::Failed {
                    error: "timeout".to_string(),
                    attempts: 3,
                },
                &ctx(),
            )
            .await
            .unwrap();
        let receipt = handler
            .handle(
                &CompletionSignal::Success {
                    return_value: serde_json::json!(null),
                },
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(receipt.status, AppendStatus::Duplicate);
        let events = store.events_for_stream("order", "ORD-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "PaymentFailed");
    }

    #[tokio::test]
    async fn completion_closes_the_matching_intent() {
        let store = Arc::new(InMemoryStore::new());
        let intents = CommandIntentLedger::new(store.clone() as Arc<dyn TransactionalStore>);
        intents
            .open("payment:ORD-1:cmd-1", "payment", "order", "ORD-1", 30_000)
            .await
            .unwrap();

        let handler = DurableAppendHandler::new(store.clone());
        handler
            .handle(
                &CompletionSignal::Success {
                    return_value: serde_json::json!(null),
                },
                &ctx(),
            )
            .await
            .unwrap();

        let intent = intents.get("payment:ORD-1:cmd-1").await.unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Completed);
        assert!(intent.event_id.is_some());
    }

    #[tokio::test]
    async fn failure_closes_the_intent_as_failed() {
        let store = Arc::new(InMemoryStore::new());
        let intents = CommandIntentLedger::new(store.clone() as Arc<dyn TransactionalStore>);
        intents
            .open("payment:ORD-1:cmd-1", "payment", "order", "ORD-1", 30_000)
            .await
            .unwrap();

        let handler = DurableAppendHandler::new(store.clone());
        handler
            .handle(&CompletionSignal::Canceled, &ctx())
            .await
            .unwrap();

        let intent = intents.get("payment:ORD-1:cmd-1").await.unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Failed);
        assert_eq!(intent.error.as_deref(), Some("canceled"));
    }

    #[tokio::test]
    async fn handler_works_through_the_completion_seam() {
        let store = Arc::new(InMemoryStore::new());
        let handler = DurableAppendHandler::new(store.clone());

        handler
            .on_complete(
                CompletionSignal::Success {
                    return_value: serde_json::json!(null),
                },
                serde_json::to_value(ctx()).unwrap(),
            )
            .await;

        assert_eq!(store.event_count().await, 1);
    }
}
