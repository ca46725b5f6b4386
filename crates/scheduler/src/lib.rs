//! Delayed dispatch scheduling.
//!
//! A [`ScheduleRequest`] is persisted as a [`ScheduledEntry`] through a
//! [`ScheduleStore`]. The [`SchedulePoller`] repeatedly dequeues due entries
//! and hands each to a [`DueEntryHandler`] (the saga dispatcher). An entry
//! stays pending until it is marked succeeded or cancelled, so scheduled work
//! is delivered at least once. Failed deliveries back off exponentially; an
//! entry that fails permanently is marked failed and leaves the queue.

pub mod entry;
pub mod error;
pub mod memory;
pub mod poller;
pub mod postgres;
pub mod scheduler;
pub mod store;

pub use common::ScheduleId;
pub use entry::{ScheduleRequest, ScheduleStatus, ScheduledEntry};
pub use error::{Result, ScheduleError};
pub use memory::InMemoryScheduleStore;
pub use poller::{DueEntryHandler, PollSummary, PollerConfig, SchedulePoller};
pub use postgres::PostgresScheduleStore;
pub use scheduler::Scheduler;
pub use store::ScheduleStore;
