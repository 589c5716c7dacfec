//! Order decider.
//!
//! Lifecycle: `Placed -> Confirmed` on fulfillment, `Placed -> Cancelled`
//! when the saga compensates. Both terminal states refuse further
//! transitions.

use std::sync::Arc;

use engine::{
    Command, Decider, DeciderContext, DeciderRegistration, DeciderRegistry, Decision, EventDraft,
};
use serde::{Deserialize, Serialize};
use store::EventRecord;

pub const PLACE_ORDER: &str = "PlaceOrder";
pub const CONFIRM_ORDER: &str = "ConfirmOrder";
pub const CANCEL_ORDER: &str = "CancelOrder";

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Placed, awaiting fulfillment.
    Placed,

    /// Fulfilled. Terminal.
    Confirmed,

    /// Cancelled. Terminal.
    Cancelled,
}

/// Materialized state for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub product_id: String,
    pub quantity: i64,
    pub status: OrderStatus,

    /// Cancellation reason, present only for cancelled orders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OrderRecord {
    fn from_state(state: Option<&serde_json::Value>) -> Option<Self> {
        state.and_then(|s| serde_json::from_value(s.clone()).ok())
    }

    fn to_state(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Decider for all order commands.
pub struct OrderDecider;

impl OrderDecider {
    fn place(&self, order: Option<OrderRecord>, command: &Command) -> Decision {
        let order_id = order_id(command);
        if order.is_some() {
            return Decision::Rejected {
                code: "ORDER_EXISTS".to_string(),
                reason: format!("order {order_id} already exists"),
            };
        }

        let product_id = command.args["product_id"].as_str().unwrap_or_default();
        let quantity = command.args["quantity"].as_i64().unwrap_or(0);
        if product_id.is_empty() || quantity <= 0 {
            return Decision::Rejected {
                code: "INVALID_ORDER".to_string(),
                reason: "product_id and a positive quantity are required".to_string(),
            };
        }

        let record = OrderRecord {
            order_id: order_id.clone(),
            product_id: product_id.to_string(),
            quantity,
            status: OrderStatus::Placed,
            reason: None,
        };
        Decision::Success {
            event: EventDraft::new(
                "OrderPlaced",
                serde_json::json!({
                    "order_id": order_id,
                    "product_id": product_id,
                    "quantity": quantity,
                }),
            ),
            data: serde_json::json!({"order_id": order_id}),
            state: record.to_state(),
        }
    }

    fn confirm(&self, order: Option<OrderRecord>, command: &Command) -> Decision {
        let order_id = order_id(command);
        let Some(mut order) = order else {
            return Decision::Rejected {
                code: "ORDER_NOT_FOUND".to_string(),
                reason: format!("order {order_id} does not exist"),
            };
        };
        if order.status != OrderStatus::Placed {
            return Decision::Rejected {
                code: "INVALID_ORDER_STATE".to_string(),
                reason: format!("order {order_id} is {:?}, not placed", order.status),
            };
        }

        order.status = OrderStatus::Confirmed;
        Decision::Success {
            event: EventDraft::new(
                "OrderConfirmed",
                serde_json::json!({"order_id": order_id}),
            ),
            data: serde_json::json!({"order_id": order_id}),
            state: order.to_state(),
        }
    }

    fn cancel(&self, order: Option<OrderRecord>, command: &Command) -> Decision {
        let order_id = order_id(command);
        let reason = command.args["reason"].as_str().unwrap_or("cancelled");
        let Some(mut order) = order else {
            return Decision::Rejected {
                code: "ORDER_NOT_FOUND".to_string(),
                reason: format!("order {order_id} does not exist"),
            };
        };
        if order.status != OrderStatus::Placed {
            return Decision::Rejected {
                code: "INVALID_ORDER_STATE".to_string(),
                reason: format!("order {order_id} is {:?}, not placed", order.status),
            };
        }

        order.status = OrderStatus::Cancelled;
        order.reason = Some(reason.to_string());
        Decision::Success {
            event: EventDraft::new(
                "OrderCancelled",
                serde_json::json!({"order_id": order_id, "reason": reason}),
            ),
            data: serde_json::json!({"order_id": order_id}),
            state: order.to_state(),
        }
    }
}

impl Decider for OrderDecider {
    fn decide(
        &self,
        state: Option<&serde_json::Value>,
        command: &Command,
        _ctx: &DeciderContext,
    ) -> Decision {
        let order = OrderRecord::from_state(state);
        match command.command_type.as_str() {
            PLACE_ORDER => self.place(order, command),
            CONFIRM_ORDER => self.confirm(order, command),
            CANCEL_ORDER => self.cancel(order, command),
            other => Decision::Rejected {
                code: "UNSUPPORTED_COMMAND".to_string(),
                reason: format!("order decider cannot handle {other}"),
            },
        }
    }

    fn evolve(&self, state: Option<serde_json::Value>, event: &EventRecord) -> serde_json::Value {
        let payload = &event.payload;
        match event.event_type.as_str() {
            "OrderPlaced" => OrderRecord {
                order_id: payload["order_id"].as_str().unwrap_or_default().to_string(),
                product_id: payload["product_id"].as_str().unwrap_or_default().to_string(),
                quantity: payload["quantity"].as_i64().unwrap_or(0),
                status: OrderStatus::Placed,
                reason: None,
            }
            .to_state(),
            "OrderConfirmed" => {
                let mut order = OrderRecord::from_state(state.as_ref());
                if let Some(order) = order.as_mut() {
                    order.status = OrderStatus::Confirmed;
                }
                order.map(|o| o.to_state()).unwrap_or_default()
            }
            "OrderCancelled" => {
                let mut order = OrderRecord::from_state(state.as_ref());
                if let Some(order) = order.as_mut() {
                    order.status = OrderStatus::Cancelled;
                    order.reason = payload["reason"].as_str().map(str::to_string);
                }
                order.map(|o| o.to_state()).unwrap_or_default()
            }
            _ => state.unwrap_or_default(),
        }
    }
}

/// Registers the order commands. Each command's scope is the order it
/// addresses.
pub fn register(registry: &mut DeciderRegistry) {
    let decider = Arc::new(OrderDecider);
    for command_type in [PLACE_ORDER, CONFIRM_ORDER, CANCEL_ORDER] {
        registry.register(
            command_type,
            DeciderRegistration::new(Arc::clone(&decider) as Arc<dyn Decider>, "order", "sales", order_id),
        );
    }
}

fn order_id(command: &Command) -> String {
    command.args["order_id"].as_str().unwrap_or_default().to_string()
}
