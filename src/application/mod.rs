//! Application layer: the attempt state machine and everything that drives it.
//!
//! `PaymentAttemptOrchestrator` is the entry point. Each operation is
//! dispatched on a bounded pool, serialized per account, and run through the
//! control plugin pipeline by the operation control callback.

pub mod callback;
pub mod control;
pub mod dispatch;
pub mod orchestrator;
pub mod state_machine;
