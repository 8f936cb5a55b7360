//! Strategy building blocks: triggers, orders, and the contract state
//! machine.
//!
//! A strategy is re-hydrated from its persisted params blob (a JSON
//! object), runs as a small state machine driven by mark-price samples,
//! and reports every externally observable event through the
//! [`contract::ContractHook`] seam.

pub mod contract;
pub mod order;
pub mod params;
pub mod trigger;

pub use contract::{Contract, ContractHook, HookError};
pub use params::ParamsError;
pub use trigger::Trigger;
