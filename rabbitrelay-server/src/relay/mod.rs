//! Relay orchestration
//!
//! One master consumer feeds a [`RelayDispatcher`], which acknowledges each
//! delivery and copies it into the mailbox of every [`PublisherWorker`]. The
//! [`ShutdownCoordinator`] tears the whole thing down on termination.

pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod mailbox;
pub mod shutdown;
pub mod stats;
pub mod worker;

pub use consumer::ConsumerHandle;
pub use context::RelayContext;
pub use dispatcher::RelayDispatcher;
pub use mailbox::{BackpressurePolicy, SendOutcome};
pub use shutdown::{
    ShutdownCoordinator, ShutdownPolicy, ShutdownReport, spawn_termination_listener,
    termination_signal,
};
pub use stats::{RelayStats, RelayStatsSnapshot, spawn_reporter};
pub use worker::{
    CancelPolicy, PublisherWorker, WorkerHandle, WorkerInbox, WorkerOptions, WorkerState,
};

#[cfg(test)]
mod tests;
