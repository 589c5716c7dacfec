//! Order fulfillment saga: reserve stock, confirm the order, confirm the
//! reservation. If any step fails, release whatever stock was reserved
//! and cancel the order with the failure reason.
//!
//! Each step issues one orchestrated command with a deterministic command
//! ID derived from the saga identity, so a resumed or re-run step replays
//! the journaled outcome instead of acting twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::{Command, CommandOrchestrator, CommandOutcome, OutcomeJournal};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::workflow::{StepDisposition, StepExecutor};

/// Saga type identifier.
pub const ORDER_FULFILLMENT: &str = "order_fulfillment";

const STEPS: &[&str] = &["reserve_stock", "confirm_order", "confirm_reservation"];

/// Arguments for one order fulfillment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentArgs {
    /// Tenant the order belongs to.
    pub tenant: String,

    /// The placed order being fulfilled. Doubles as the reservation key.
    pub order_id: String,

    /// Product to reserve.
    pub product_id: String,

    /// Units to reserve.
    pub quantity: i64,
}

/// Step executor for [`ORDER_FULFILLMENT`].
pub struct OrderFulfillmentExecutor {
    orchestrator: Arc<CommandOrchestrator>,
    journal: OutcomeJournal,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl OrderFulfillmentExecutor {
    /// Creates an executor issuing commands through the given orchestrator.
    /// The journal must be the one the orchestrator records outcomes to.
    pub fn new(orchestrator: Arc<CommandOrchestrator>, journal: OutcomeJournal) -> Self {
        Self {
            orchestrator,
            journal,
            poll_interval: Duration::from_millis(25),
            poll_timeout: Duration::from_secs(5),
        }
    }

    /// Overrides the deferred-outcome poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn command_id(args: &FulfillmentArgs, step: &str) -> String {
        format!("{ORDER_FULFILLMENT}:{}:{step}", args.order_id)
    }

    fn step_command(args: &FulfillmentArgs, step: &str) -> Option<Command> {
        let (command_type, command_args) = match step {
            "reserve_stock" => (
                domain::inventory::RESERVE_STOCK,
                serde_json::json!({
                    "product_id": args.product_id,
                    "order_id": args.order_id,
                    "quantity": args.quantity,
                }),
            ),
            "confirm_order" => (
                domain::order::CONFIRM_ORDER,
                serde_json::json!({"order_id": args.order_id}),
            ),
            "confirm_reservation" => (
                domain::inventory::CONFIRM_RESERVATION,
                serde_json::json!({
                    "product_id": args.product_id,
                    "order_id": args.order_id,
                }),
            ),
            _ => return None,
        };
        Some(Command::new(
            Self::command_id(args, step).as_str(),
            command_type,
            args.tenant.as_str(),
            command_args,
        ))
    }

    /// Executes one command and waits for its terminal outcome,
    /// following a deferred execution through the outcome journal.
    async fn execute_to_terminal(&self, command: Command) -> Result<CommandOutcome> {
        let command_id = command.command_id.clone();
        let mut outcome = self.orchestrator.execute(command).await?;

        loop {
            match outcome {
                CommandOutcome::Duplicate { outcome: inner } => {
                    outcome = *inner;
                }
                CommandOutcome::Deferred { .. } => {
                    outcome = self.await_journaled(&command_id).await?;
                }
                terminal => return Ok(terminal),
            }
        }
    }

    async fn await_journaled(&self, command_id: &common::CommandId) -> Result<CommandOutcome> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            if let Some(recorded) = self.journal.get(command_id).await? {
                return Ok(recorded.outcome);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SagaError::StepTimeout(command_id.as_str().to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Issues a compensation command, treating rejections as already
    /// compensated. A re-run compensation finds the reservation gone or
    /// the order no longer cancelable; that is the desired end state.
    async fn compensation_command(&self, command: Command) -> Result<()> {
        let command_id = command.command_id.clone();
        match self.execute_to_terminal(command).await? {
            CommandOutcome::Success { .. } | CommandOutcome::Failed { .. } => Ok(()),
            CommandOutcome::Rejected { code, reason } => {
                tracing::info!(
                    command_id = %command_id,
                    code,
                    reason,
                    "compensation command rejected, treating as settled"
                );
                Ok(())
            }
            CommandOutcome::Duplicate { .. } | CommandOutcome::Deferred { .. } => {
                unreachable!("execute_to_terminal returns terminal outcomes")
            }
        }
    }
}

#[async_trait]
impl StepExecutor for OrderFulfillmentExecutor {
    fn steps(&self) -> &[&str] {
        STEPS
    }

    #[tracing::instrument(skip(self, args))]
    async fn run_step(&self, step: &str, args: &serde_json::Value) -> Result<StepDisposition> {
        let args: FulfillmentArgs = serde_json::from_value(args.clone())?;
        let command = Self::step_command(&args, step)
            .ok_or_else(|| SagaError::UnknownStep(step.to_string()))?;

        match self.execute_to_terminal(command).await? {
            CommandOutcome::Success { .. } => Ok(StepDisposition::Continue),
            CommandOutcome::Failed { error, .. } => {
                Ok(StepDisposition::Compensate { reason: error })
            }
            CommandOutcome::Rejected { code, reason } => Ok(StepDisposition::Compensate {
                reason: format!("{code}: {reason}"),
            }),
            CommandOutcome::Duplicate { .. } | CommandOutcome::Deferred { .. } => {
                unreachable!("execute_to_terminal returns terminal outcomes")
            }
        }
    }

    #[tracing::instrument(skip(self, args))]
    async fn compensate(
        &self,
        completed: &[String],
        reason: &str,
        args: &serde_json::Value,
    ) -> Result<()> {
        let args: FulfillmentArgs = serde_json::from_value(args.clone())?;

        if completed.iter().any(|s| s == "reserve_stock") {
            self.compensation_command(Command::new(
                format!("{ORDER_FULFILLMENT}:{}:release_stock", args.order_id).as_str(),
                domain::inventory::RELEASE_STOCK,
                args.tenant.as_str(),
                serde_json::json!({
                    "product_id": args.product_id,
                    "order_id": args.order_id,
                }),
            ))
            .await?;
        }

        self.compensation_command(Command::new(
            format!("{ORDER_FULFILLMENT}:{}:cancel_order", args.order_id).as_str(),
            domain::order::CANCEL_ORDER,
            args.tenant.as_str(),
            serde_json::json!({"order_id": args.order_id, "reason": reason}),
        ))
        .await?;

        tracing::warn!(order_id = args.order_id, reason, "order fulfillment compensated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> FulfillmentArgs {
        FulfillmentArgs {
            tenant: "acme".to_string(),
            order_id: "O-1".to_string(),
            product_id: "SKU-1".to_string(),
            quantity: 3,
        }
    }

    #[test]
    fn step_command_ids_are_deterministic() {
        let args = args();
        let first = OrderFulfillmentExecutor::step_command(&args, "reserve_stock").unwrap();
        let second = OrderFulfillmentExecutor::step_command(&args, "reserve_stock").unwrap();
        assert_eq!(first.command_id, second.command_id);
        assert_eq!(
            first.command_id.as_str(),
            "order_fulfillment:O-1:reserve_stock"
        );
    }

    #[test]
    fn reserve_step_carries_the_reservation_key() {
        let command = OrderFulfillmentExecutor::step_command(&args(), "reserve_stock").unwrap();
        assert_eq!(command.command_type, domain::inventory::RESERVE_STOCK);
        assert_eq!(command.args["order_id"], "O-1");
        assert_eq!(command.args["quantity"], 3);
    }

    #[test]
    fn unknown_step_yields_no_command() {
        assert!(OrderFulfillmentExecutor::step_command(&args(), "ship_order").is_none());
    }
}
