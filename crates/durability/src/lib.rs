//! Durability layer: outbox-style durable append, dead-letter tracking,
//! and command-intent bracketing for external calls.
//!
//! Everything here is designed for arbitrary redelivery: completion
//! signals may arrive more than once and in any order, so each operation
//! is either naturally idempotent (idempotency-keyed append) or guarded
//! by a compare-and-swap status transition (dead letters, intents).

pub mod dead_letter;
pub mod error;
pub mod intent;
pub mod outbox;

pub use dead_letter::{
    DeadLetterEntry, DeadLetterLedger, DeadLetterRecorder, DeadLetterStats, DeadLetterStatus,
    IgnoreOutcome, MarkRetriedOutcome, PrepareRetryOutcome, RecordFailureOutcome,
    DEAD_LETTER_HANDLER,
};
pub use error::{DurabilityError, Result};
pub use intent::{CloseOutcome, CommandIntent, CommandIntentLedger, IntentStatus, OpenOutcome};
pub use outbox::{DurableAppendHandler, OutboxContext, DURABLE_APPEND_HANDLER};
