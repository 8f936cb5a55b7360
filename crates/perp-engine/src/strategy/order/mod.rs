//! Order layer: entry, stop-loss, and take-profit orders.
//!
//! Each order owns one or more triggers plus order-kind-specific
//! parameters. Orders never talk to the exchange themselves; the
//! contract state machine evaluates them and the hook performs the IO.

pub mod entry;
pub mod stop_loss;
pub mod take_profit;

pub use entry::EntryOrder;
pub use stop_loss::StopLossOrder;
pub use take_profit::TakeProfitOrder;
