//! Cooperative Scheduler
//!
//! Single-threaded, poll-driven execution of chained asynchronous steps. Every
//! protocol exchange is a chain of "wait until X, then do Y" tasks evaluated by
//! one queue, so no task state is ever touched from two places at once.

mod backoff;
mod queue;
mod task;

pub use backoff::Backoff;
pub use queue::{TaskQueue, TickReport};
pub use task::{Outcome, Status, Step, Synapse, Verdict, ERROR, RESULTS};
