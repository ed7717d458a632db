//! Queue & assignment engine.
//!
//! Event-driven: operator actions, logins and the schedulers push
//! [`QueueTrigger`]s; the dispatcher re-evaluates the affected queues and
//! assigns pending chats to eligible advisors. Assignment itself is a
//! compare-and-swap in the store, so a racing claim simply loses and the
//! dispatcher moves on.

pub mod actions;
pub mod dispatcher;
pub mod eligibility;
pub mod error;
pub mod select;

pub use actions::QueueEngine;
pub use dispatcher::{Dispatcher, QueueHandle, QueueTrigger};
pub use error::{QueueError, Result};
