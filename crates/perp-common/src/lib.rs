//! Shared types for the perp strategy engine.
//!
//! This crate contains the base vocabulary used across the engine:
//! position sides, entry kinds, position status, comparison operators,
//! and the mark-price sample type.
//!
//! CRITICAL: All prices use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod types;

pub use types::{EntryType, Mark, Operator, PositionStatus, Side};
