//! Reference order and inventory domain.
//!
//! Two aggregates: orders (sales context) and product stock (inventory
//! context). Their deciders are registered through the explicit
//! [`DeciderRegistry`] and exercised by the order-fulfillment saga.

pub mod inventory;
pub mod order;

use engine::DeciderRegistry;

pub use inventory::{ProductStock, CONFIRM_RESERVATION, RELEASE_STOCK, RESERVE_STOCK, RESTOCK_PRODUCT};
pub use order::{OrderRecord, OrderStatus, CANCEL_ORDER, CONFIRM_ORDER, PLACE_ORDER};

/// Registers every domain decider.
pub fn register_all(registry: &mut DeciderRegistry) {
    inventory::register(registry);
    order::register(registry);
}
