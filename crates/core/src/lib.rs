//! `countsync-core`: shared building blocks for the counting engine.
//!
//! This crate contains identifiers and the domain error taxonomy only (no IO).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ClientEventId, LockId, UserId, WarehouseId};
