//! Domain layer: ledger records, the control context and the ports the
//! orchestration core depends on.

pub mod account;
pub mod attempt;
pub mod clock;
pub mod context;
pub mod invoice;
pub mod money;
pub mod payment;
pub mod ports;
