//! Product stock decider.
//!
//! Stock moves between two buckets: `available` and `reserved`. A
//! reservation holds units for one order until it is either confirmed
//! (units leave the system) or released (units return to `available`).
//! Reserving more than is available records a `StockReservationFailed`
//! event rather than rejecting: the shortage is a domain fact the saga
//! reacts to.

use std::collections::HashMap;
use std::sync::Arc;

use engine::{
    Command, Decider, DeciderContext, DeciderRegistration, DeciderRegistry, Decision, EventDraft,
};
use serde::{Deserialize, Serialize};
use store::EventRecord;

pub const RESERVE_STOCK: &str = "ReserveStock";
pub const CONFIRM_RESERVATION: &str = "ConfirmReservation";
pub const RELEASE_STOCK: &str = "ReleaseStock";
pub const RESTOCK_PRODUCT: &str = "RestockProduct";

/// Materialized stock state for one product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductStock {
    /// The product this state belongs to.
    pub product_id: String,

    /// Units free to reserve.
    pub available: i64,

    /// Units held by open reservations.
    pub reserved: i64,

    /// Open reservations, keyed by order ID.
    pub reservations: HashMap<String, i64>,
}

impl ProductStock {
    fn from_state(state: Option<&serde_json::Value>) -> Self {
        state
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default()
    }

    fn to_state(&self) -> serde_json::Value {
        serde_json::json!({
            "product_id": self.product_id,
            "available": self.available,
            "reserved": self.reserved,
            "reservations": self.reservations,
        })
    }
}

/// Decider for all stock commands.
pub struct InventoryDecider;

impl InventoryDecider {
    fn reserve(&self, mut stock: ProductStock, command: &Command) -> Decision {
        let product_id = product_id(command);
        let order_id = order_id(command);
        let quantity = command.args["quantity"].as_i64().unwrap_or(0);

        if quantity <= 0 {
            return Decision::Rejected {
                code: "INVALID_QUANTITY".to_string(),
                reason: "quantity must be positive".to_string(),
            };
        }
        if stock.reservations.contains_key(&order_id) {
            return Decision::Rejected {
                code: "ALREADY_RESERVED".to_string(),
                reason: format!("order {order_id} already holds a reservation"),
            };
        }
        if stock.available < quantity {
            let error = format!(
                "insufficient stock for {product_id}: requested {quantity}, available {}",
                stock.available
            );
            return Decision::Failed {
                event: EventDraft::new(
                    "StockReservationFailed",
                    serde_json::json!({
                        "product_id": product_id,
                        "order_id": order_id,
                        "requested": quantity,
                        "available": stock.available,
                    }),
                ),
                state: stock.to_state(),
                error,
            };
        }

        stock.product_id = product_id.clone();
        stock.available -= quantity;
        stock.reserved += quantity;
        stock.reservations.insert(order_id.clone(), quantity);

        Decision::Success {
            event: EventDraft::new(
                "StockReserved",
                serde_json::json!({
                    "product_id": product_id,
                    "order_id": order_id,
                    "quantity": quantity,
                    "available": stock.available,
                    "reserved": stock.reserved,
                }),
            ),
            data: serde_json::json!({"reserved": quantity}),
            state: stock.to_state(),
        }
    }

    fn confirm(&self, mut stock: ProductStock, command: &Command) -> Decision {
        let order_id = order_id(command);
        let Some(quantity) = stock.reservations.remove(&order_id) else {
            return Decision::Rejected {
                code: "RESERVATION_NOT_FOUND".to_string(),
                reason: format!("no open reservation for order {order_id}"),
            };
        };
        stock.reserved -= quantity;

        Decision::Success {
            event: EventDraft::new(
                "ReservationConfirmed",
                serde_json::json!({
                    "product_id": stock.product_id,
                    "order_id": order_id,
                    "quantity": quantity,
                }),
            ),
            data: serde_json::json!({"confirmed": quantity}),
            state: stock.to_state(),
        }
    }

    fn release(&self, mut stock: ProductStock, command: &Command) -> Decision {
        let order_id = order_id(command);
        let Some(quantity) = stock.reservations.remove(&order_id) else {
            return Decision::Rejected {
                code: "RESERVATION_NOT_FOUND".to_string(),
                reason: format!("no open reservation for order {order_id}"),
            };
        };
        stock.reserved -= quantity;
        stock.available += quantity;

        Decision::Success {
            event: EventDraft::new(
                "StockReleased",
                serde_json::json!({
                    "product_id": stock.product_id,
                    "order_id": order_id,
                    "quantity": quantity,
                    "available": stock.available,
                }),
            ),
            data: serde_json::json!({"released": quantity}),
            state: stock.to_state(),
        }
    }

    fn restock(&self, mut stock: ProductStock, command: &Command) -> Decision {
        let product_id = product_id(command);
        let quantity = command.args["quantity"].as_i64().unwrap_or(0);
        if quantity <= 0 {
            return Decision::Rejected {
                code: "INVALID_QUANTITY".to_string(),
                reason: "quantity must be positive".to_string(),
            };
        }

        stock.product_id = product_id.clone();
        stock.available += quantity;

        Decision::Success {
            event: EventDraft::new(
                "ProductRestocked",
                serde_json::json!({
                    "product_id": product_id,
                    "quantity": quantity,
                    "available": stock.available,
                }),
            ),
            data: serde_json::json!({"available": stock.available}),
            state: stock.to_state(),
        }
    }
}

impl Decider for InventoryDecider {
    fn decide(
        &self,
        state: Option<&serde_json::Value>,
        command: &Command,
        _ctx: &DeciderContext,
    ) -> Decision {
        let stock = ProductStock::from_state(state);
        match command.command_type.as_str() {
            RESERVE_STOCK => self.reserve(stock, command),
            CONFIRM_RESERVATION => self.confirm(stock, command),
            RELEASE_STOCK => self.release(stock, command),
            RESTOCK_PRODUCT => self.restock(stock, command),
            other => Decision::Rejected {
                code: "UNSUPPORTED_COMMAND".to_string(),
                reason: format!("inventory decider cannot handle {other}"),
            },
        }
    }

    fn evolve(&self, state: Option<serde_json::Value>, event: &EventRecord) -> serde_json::Value {
        let mut stock = ProductStock::from_state(state.as_ref());
        let payload = &event.payload;
        let order_id = payload["order_id"].as_str().unwrap_or_default().to_string();
        let quantity = payload["quantity"].as_i64().unwrap_or(0);

        match event.event_type.as_str() {
            "ProductRestocked" => {
                stock.product_id = payload["product_id"].as_str().unwrap_or_default().to_string();
                stock.available += quantity;
            }
            "StockReserved" => {
                stock.available -= quantity;
                stock.reserved += quantity;
                stock.reservations.insert(order_id, quantity);
            }
            "ReservationConfirmed" => {
                if let Some(quantity) = stock.reservations.remove(&order_id) {
                    stock.reserved -= quantity;
                }
            }
            "StockReleased" => {
                if let Some(quantity) = stock.reservations.remove(&order_id) {
                    stock.reserved -= quantity;
                    stock.available += quantity;
                }
            }
            // StockReservationFailed changes nothing.
            _ => {}
        }
        stock.to_state()
    }
}

/// Registers the stock commands. Each command's scope is the product it
/// addresses.
pub fn register(registry: &mut DeciderRegistry) {
    let decider = Arc::new(InventoryDecider);
    for command_type in [RESERVE_STOCK, CONFIRM_RESERVATION, RELEASE_STOCK, RESTOCK_PRODUCT] {
        registry.register(
            command_type,
            DeciderRegistration::new(Arc::clone(&decider) as Arc<dyn Decider>, "product", "inventory", product_id),
        );
    }
}

fn product_id(command: &Command) -> String {
    command.args["product_id"].as_str().unwrap_or_default().to_string()
}

fn order_id(command: &Command) -> String {
    command.args["order_id"].as_str().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(command: &Command) -> DeciderContext {
        DeciderContext {
            tenant: command.tenant.clone(),
            scope: engine::ScopeKey::new(command.tenant.clone(), "product", product_id(command)),
            correlation_id: None,
        }
    }

    fn command(command_type: &str, args: serde_json::Value) -> Command {
        Command::new("cmd-1", command_type, "acme", args)
    }

    fn stocked(available: i64) -> serde_json::Value {
        ProductStock {
            product_id: "SKU-1".to_string(),
            available,
            reserved: 0,
            reservations: HashMap::new(),
        }
        .to_state()
    }

    #[test]
    fn reserve_moves_units_to_reserved() {
        let cmd = command(
            RESERVE_STOCK,
            serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1", "quantity": 3}),
        );
        let decision = InventoryDecider.decide(Some(&stocked(10)), &cmd, &ctx(&cmd));

        match decision {
            Decision::Success { state, .. } => {
                let stock: ProductStock = serde_json::from_value(state).unwrap();
                assert_eq!(stock.available, 7);
                assert_eq!(stock.reserved, 3);
                assert_eq!(stock.reservations["ORD-1"], 3);
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn reserving_more_than_available_fails_and_leaves_stock_unchanged() {
        let cmd = command(
            RESERVE_STOCK,
            serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1", "quantity": 10}),
        );
        let decision = InventoryDecider.decide(Some(&stocked(3)), &cmd, &ctx(&cmd));

        match decision {
            Decision::Failed { event, state, error } => {
                assert!(error.contains("insufficient stock"));
                assert_eq!(event.event_type, "StockReservationFailed");
                let stock: ProductStock = serde_json::from_value(state).unwrap();
                assert_eq!(stock.available, 3);
                assert_eq!(stock.reserved, 0);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn double_reservation_for_one_order_is_rejected() {
        let cmd = command(
            RESERVE_STOCK,
            serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1", "quantity": 2}),
        );
        let state = match InventoryDecider.decide(Some(&stocked(10)), &cmd, &ctx(&cmd)) {
            Decision::Success { state, .. } => state,
            other => panic!("expected Success, got {other:?}"),
        };

        assert!(matches!(
            InventoryDecider.decide(Some(&state), &cmd, &ctx(&cmd)),
            Decision::Rejected { code, .. } if code == "ALREADY_RESERVED"
        ));
    }

    #[test]
    fn confirm_removes_the_hold_without_restoring_availability() {
        let reserve = command(
            RESERVE_STOCK,
            serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1", "quantity": 4}),
        );
        let state = match InventoryDecider.decide(Some(&stocked(10)), &reserve, &ctx(&reserve)) {
            Decision::Success { state, .. } => state,
            other => panic!("expected Success, got {other:?}"),
        };

        let confirm = command(
            CONFIRM_RESERVATION,
            serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1"}),
        );
        match InventoryDecider.decide(Some(&state), &confirm, &ctx(&confirm)) {
            Decision::Success { state, .. } => {
                let stock: ProductStock = serde_json::from_value(state).unwrap();
                assert_eq!(stock.available, 6);
                assert_eq!(stock.reserved, 0);
                assert!(stock.reservations.is_empty());
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn release_returns_units_to_available() {
        let reserve = command(
            RESERVE_STOCK,
            serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1", "quantity": 4}),
        );
        let state = match InventoryDecider.decide(Some(&stocked(10)), &reserve, &ctx(&reserve)) {
            Decision::Success { state, .. } => state,
            other => panic!("expected Success, got {other:?}"),
        };

        let release = command(
            RELEASE_STOCK,
            serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1"}),
        );
        match InventoryDecider.decide(Some(&state), &release, &ctx(&release)) {
            Decision::Success { state, .. } => {
                let stock: ProductStock = serde_json::from_value(state).unwrap();
                assert_eq!(stock.available, 10);
                assert_eq!(stock.reserved, 0);
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn release_without_reservation_is_rejected() {
        let release = command(
            RELEASE_STOCK,
            serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-9"}),
        );
        assert!(matches!(
            InventoryDecider.decide(Some(&stocked(10)), &release, &ctx(&release)),
            Decision::Rejected { code, .. } if code == "RESERVATION_NOT_FOUND"
        ));
    }

    #[test]
    fn evolve_rebuilds_state_from_the_stream() {
        let events = [
            ("ProductRestocked", serde_json::json!({"product_id": "SKU-1", "quantity": 10})),
            (
                "StockReserved",
                serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1", "quantity": 4}),
            ),
            (
                "StockReleased",
                serde_json::json!({"product_id": "SKU-1", "order_id": "ORD-1", "quantity": 4}),
            ),
        ];

        let mut state = None;
        for (event_type, payload) in events {
            let record = EventRecord::builder()
                .idempotency_key(format!("test:{event_type}"))
                .stream_type("product")
                .stream_id("SKU-1")
                .event_type(event_type)
                .payload_raw(payload)
                .build();
            state = Some(InventoryDecider.evolve(state, &record));
        }

        let stock: ProductStock = serde_json::from_value(state.unwrap()).unwrap();
        assert_eq!(stock.available, 10);
        assert_eq!(stock.reserved, 0);
        assert!(stock.reservations.is_empty());
    }
}
