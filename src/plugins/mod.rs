//! Control plugins shipped with the crate.

pub mod invoice;
