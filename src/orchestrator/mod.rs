//! Call orchestration: scheduling windows, admission control, retries, and
//! the per-attempt workers that talk to channel adapters.

pub mod backoff;
pub mod engine;
pub mod policy;
mod worker;

pub use backoff::BackoffPolicy;
pub use engine::{
    AttemptOutcome, DeferReason, DispatchReport, Orchestrator, ScheduleRequest,
    spawn_dispatch_ticker,
};
pub use policy::{SchedulingPolicy, WindowCheck};
