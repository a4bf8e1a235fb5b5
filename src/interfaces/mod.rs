//! Outer surfaces: CSV scenario input and outcome output, and the runner
//! wiring them to the orchestrator.

pub mod csv;
pub mod scenario;
