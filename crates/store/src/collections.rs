//! Well-known document collections owned by the engine.

/// Consistency-boundary state documents, keyed by scope key. The document
/// version is the ScopeVersion the OCC check compares against.
pub const SCOPES: &str = "scopes";

/// Recorded command outcomes keyed by command ID, backing the duplicate
/// check in the orchestrator.
pub const COMMAND_OUTCOMES: &str = "command_outcomes";

/// Dead-letter entries keyed by correlation key.
pub const DEAD_LETTERS: &str = "dead_letters";

/// Command intents keyed by intent key.
pub const INTENTS: &str = "intents";

/// Saga status rows keyed by `{saga_type}:{saga_id}`.
pub const SAGAS: &str = "sagas";

/// Workflow step checkpoints keyed by `{workflow_type}:{workflow_id}`.
pub const WORKFLOWS: &str = "workflows";
