//! Deciders and their registry.
//!
//! A decider is the pure decision function for one command type: given
//! the scope's current materialized state and the command, it either
//! produces an event plus the updated state, or a rejection. The registry
//! is an explicit object constructed at process start and handed to the
//! orchestrator; there is no module-level registry.

use std::collections::HashMap;
use std::sync::Arc;

use common::{CommandId, CorrelationId, TenantId};
use serde::{Deserialize, Serialize};
use store::EventRecord;

use crate::scope::ScopeKey;

/// A command submitted for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Client-supplied idempotency token.
    pub command_id: CommandId,

    /// Selects the registered decider.
    pub command_type: String,

    /// The tenant the command acts within.
    pub tenant: TenantId,

    /// Command arguments as JSON.
    pub args: serde_json::Value,

    /// Correlation token, propagated into logs and downstream work.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl Command {
    /// Creates a command.
    pub fn new(
        command_id: impl Into<CommandId>,
        command_type: impl Into<String>,
        tenant: impl Into<TenantId>,
        args: serde_json::Value,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            tenant: tenant.into(),
            args,
            correlation_id: None,
        }
    }

    /// Sets the correlation ID.
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Execution context passed to a decider.
#[derive(Debug, Clone)]
pub struct DeciderContext {
    /// The tenant the command acts within.
    pub tenant: TenantId,

    /// The scope the decision commits against.
    pub scope: ScopeKey,

    /// Correlation token, if the caller supplied one.
    pub correlation_id: Option<CorrelationId>,
}

/// The event a decision wants recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Event type (e.g. `StockReserved`).
    pub event_type: String,

    /// Event payload.
    pub payload: serde_json::Value,
}

impl EventDraft {
    /// Creates an event draft.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Outcome of a decision. Expected refusals are variants, never errors.
#[derive(Debug, Clone)]
pub enum Decision {
    /// The command succeeds: record the event, apply the state update.
    Success {
        /// The event to append.
        event: EventDraft,
        /// The scope's new materialized state.
        state: serde_json::Value,
        /// Caller-facing result data.
        data: serde_json::Value,
    },

    /// The decider chose to record a business failure as a domain fact
    /// (e.g. insufficient stock). Still a successful write, distinct from
    /// a rejection.
    Failed {
        /// The failure event to append.
        event: EventDraft,
        /// The scope's new materialized state (typically unchanged).
        state: serde_json::Value,
        /// The business failure reason.
        error: String,
    },

    /// Deterministic business-rule refusal. Nothing is recorded.
    Rejected {
        /// Machine-readable rejection code.
        code: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// A pure decision function for one command type.
pub trait Decider: Send + Sync {
    /// Decides the outcome of a command given the scope's current state
    /// (`None` when the scope has never been written).
    fn decide(
        &self,
        state: Option<&serde_json::Value>,
        command: &Command,
        ctx: &DeciderContext,
    ) -> Decision;

    /// Folds one event into the state, used to rebuild a scope's
    /// materialized state from its stream.
    fn evolve(&self, state: Option<serde_json::Value>, event: &EventRecord) -> serde_json::Value;
}

type StreamIdFn = dyn Fn(&Command) -> String + Send + Sync;
type ScopeFn = dyn Fn(&Command) -> ScopeKey + Send + Sync;

/// A decider plus the routing metadata the orchestrator needs.
pub struct DeciderRegistration {
    decider: Arc<dyn Decider>,
    stream_type: String,
    bounded_context: String,
    stream_id: Box<StreamIdFn>,
    scope: Option<Box<ScopeFn>>,
}

impl DeciderRegistration {
    /// Creates a registration. By default a command's scope is the single
    /// entity it addresses: `tenant:{t}:{stream_type}:{stream_id}`.
    pub fn new(
        decider: Arc<dyn Decider>,
        stream_type: impl Into<String>,
        bounded_context: impl Into<String>,
        stream_id: impl Fn(&Command) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            decider,
            stream_type: stream_type.into(),
            bounded_context: bounded_context.into(),
            stream_id: Box::new(stream_id),
            scope: None,
        }
    }

    /// Overrides the scope derivation, for commands whose consistency
    /// boundary spans more than the addressed entity.
    pub fn with_scope(mut self, scope: impl Fn(&Command) -> ScopeKey + Send + Sync + 'static) -> Self {
        self.scope = Some(Box::new(scope));
        self
    }

    /// The registered decider.
    pub fn decider(&self) -> &dyn Decider {
        self.decider.as_ref()
    }

    /// The stream type events of this command type belong to.
    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    /// The bounded context events of this command type belong to.
    pub fn bounded_context(&self) -> &str {
        &self.bounded_context
    }

    /// The stream ID a command addresses.
    pub fn stream_id(&self, command: &Command) -> String {
        (self.stream_id)(command)
    }

    /// The scope a command commits against.
    pub fn scope_key(&self, command: &Command) -> ScopeKey {
        match &self.scope {
            Some(scope) => scope(command),
            None => ScopeKey::new(
                command.tenant.clone(),
                self.stream_type.clone(),
                self.stream_id(command),
            ),
        }
    }
}

/// Registry mapping command types to deciders. Constructed once and
/// injected into the orchestrator.
#[derive(Default)]
pub struct DeciderRegistry {
    deciders: HashMap<String, DeciderRegistration>,
}

impl DeciderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decider for a command type. Replaces any existing
    /// registration for the same type.
    pub fn register(&mut self, command_type: impl Into<String>, registration: DeciderRegistration) {
        self.deciders.insert(command_type.into(), registration);
    }

    /// Resolves the registration for a command type.
    pub fn get(&self, command_type: &str) -> Option<&DeciderRegistration> {
        self.deciders.get(command_type)
    }

    /// Returns the number of registered command types.
    pub fn len(&self) -> usize {
        self.deciders.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.deciders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysReject;

    impl Decider for AlwaysReject {
        fn decide(
            &self,
            _state: Option<&serde_json::Value>,
            _command: &Command,
            _ctx: &DeciderContext,
        ) -> Decision {
            Decision::Rejected {
                code: "NOPE".to_string(),
                reason: "always rejects".to_string(),
            }
        }

        fn evolve(
            &self,
            state: Option<serde_json::Value>,
            _event: &EventRecord,
        ) -> serde_json::Value {
            state.unwrap_or(serde_json::json!({}))
        }
    }

    fn command() -> Command {
        Command::new(
            "cmd-1",
            "PlaceOrder",
            "acme",
            serde_json::json!({"order_id": "ORD-1"}),
        )
    }

    #[test]
    fn default_scope_is_the_addressed_entity() {
        let registration = DeciderRegistration::new(Arc::new(AlwaysReject), "order", "sales", |c| {
            c.args["order_id"].as_str().unwrap_or_default().to_string()
        });

        let scope = registration.scope_key(&command());
        assert_eq!(scope.to_string(), "tenant:acme:order:ORD-1");
    }

    #[test]
    fn scope_override_replaces_the_default() {
        let registration = DeciderRegistration::new(Arc::new(AlwaysReject), "order", "sales", |c| {
            c.args["order_id"].as_str().unwrap_or_default().to_string()
        })
        .with_scope(|c| ScopeKey::new(c.tenant.clone(), "fulfillment", "batch-7"));

        let scope = registration.scope_key(&command());
        assert_eq!(scope.to_string(), "tenant:acme:fulfillment:batch-7");
    }

    #[test]
    fn registry_resolves_by_command_type() {
        let mut registry = DeciderRegistry::new();
        registry.register(
            "PlaceOrder",
            DeciderRegistration::new(Arc::new(AlwaysReject), "order", "sales", |_| {
                "ORD-1".to_string()
            }),
        );

        assert!(registry.get("PlaceOrder").is_some());
        assert!(registry.get("Unknown").is_none());
        assert_eq!(registry.len(), 1);
    }
}
