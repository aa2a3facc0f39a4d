//! The Witness: per-rig supervisor of polecat workers.
//!
//! Split by concern: `state` is the local on-disk document, `handoff` the
//! store-backed state that survives wisp burns, `cleanup` the only code
//! allowed to destroy filesystem state, and `manager` the patrol loop that
//! drives all of it.

mod cleanup;
mod handoff;
mod manager;
mod state;

pub use cleanup::Cleaner;
pub use handoff::{HandoffState, HandoffStore, WorkerState, handoff_issue_id};
pub use manager::{PENDING_COMPLETION_TIMEOUT, STUCK_THRESHOLD, WitnessManager};
pub use state::{RunState, WitnessConfig, WitnessState};
