//! Time-sourced reconciliation: the bot-timeout pass, the queue-timeout
//! escalation pass, and session cleanup. All three issue the same store
//! mutations operator actions do, only the trigger is the clock.

pub mod engine;
pub mod error;

pub use engine::{SchedulerEngine, QUEUE_TIMEOUT_BUCKETS_MIN};
pub use error::{Result, SchedulerError};
