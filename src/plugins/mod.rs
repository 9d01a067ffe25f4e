//! Subsystems built on the core record store.

pub mod record;
pub mod reputation;
