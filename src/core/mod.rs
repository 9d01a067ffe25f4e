//! Core record store for agentws.
//!
//! Everything that touches a record on disk goes through here: atomic
//! writes with backups, cross-process locks, workspace layout and config.

pub mod atomic;
pub mod config;
pub mod error;
pub mod lock;
pub mod store;
pub mod time;
