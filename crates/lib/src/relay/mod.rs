//! Message relay core: normalize, deduplicate, complete, deliver.
//!
//! The orchestrator owns all concurrency policy (per-conversation ordering, worker pool,
//! retries, circuit breaking, shutdown). The pieces it composes are synchronous or plain
//! async calls without shared state, except the deduplicator's record map.

mod circuit;
mod dedup;
mod orchestrator;
mod retry;
mod stats;

pub use circuit::{CircuitBreaker, CircuitSettings};
pub use dedup::{Deduplicator, Outcome, ProcessingRecord};
pub use orchestrator::{
    Failure, IgnoreReason, RelayOrchestrator, RelayOutcome, RelaySettings, Stage, SubmitError,
    Submission,
};
pub use retry::RetryPolicy;
pub use stats::{RelayStats, StatsSnapshot};
