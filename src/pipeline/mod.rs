//! Reply pipeline.
//!
//! Per thread with new activity:
//! 1. `combiner` — group unanswered customer messages into batches
//! 2. `context` — prior history for the completion request
//! 3. `override_store` — draft a reply, hold it for operator override
//! 4. `dual_writer` — persist to the operational store and the dashboard
//! 5. `MessageSource::send_message` — deliver
//!
//! `processor::ThreadPipeline` runs these in order; `backoff` paces the
//! polling lanes that feed it.

pub mod backoff;
pub mod combiner;
pub mod context;
pub mod dual_writer;
pub mod override_store;
pub mod processor;

pub use backoff::BackoffState;
pub use context::ContextAssembler;
pub use dual_writer::{CommitOutcome, DualWriter};
pub use override_store::{DraftRequest, OverrideStore};
pub use processor::{ThreadOutcome, ThreadPipeline};
