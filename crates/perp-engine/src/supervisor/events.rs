//! Lifecycle events, each carrying a strategy uuid.
//!
//! Events flow from the runners, the hooks, and the admin HTTP surface
//! into the supervisor's single-consumer event loop.

use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Start a strategy; it is launched immediately.
    Enable(Uuid),
    /// Halt a strategy immediately.
    Disable(Uuid),
    /// Stop and rebuild a strategy from its persisted row.
    Restart(Uuid),
    /// Mark a strategy whose exchange state no longer matches its
    /// persisted status.
    OutOfSync(Uuid),
    /// Clear a finished (or manually fixed) strategy back to closed and
    /// disabled.
    Reset(Uuid),
}

impl Event {
    pub fn uuid(&self) -> Uuid {
        match self {
            Event::Enable(u)
            | Event::Disable(u)
            | Event::Restart(u)
            | Event::OutOfSync(u)
            | Event::Reset(u) => *u,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Enable(_) => "enable",
            Event::Disable(_) => "disable",
            Event::Restart(_) => "restart",
            Event::OutOfSync(_) => "out_of_sync",
            Event::Reset(_) => "reset",
        }
    }
}

/// Unbounded so that a runner publishing from inside `check_price`
/// never blocks against the event loop.
pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;
