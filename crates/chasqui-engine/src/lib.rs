//! Flow runtime engine.
//!
//! One logical task per inbound event; tasks for the same conversation are
//! serialized by the conversation lock, tasks for different conversations
//! run in parallel. A task executes one macro-step: it traverses nodes
//! until the flow must wait for the user, suspends on a delay, or
//! terminates (transfer/end).

pub mod condition;
pub mod error;
pub mod runtime;
pub mod sender;
pub mod substitute;
pub mod validate;

pub use error::{EngineError, Result};
pub use runtime::{FlowRuntime, StepEnd};
pub use sender::{CloudSender, OutboundSender};
