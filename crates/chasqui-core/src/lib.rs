//! Shared foundation for the Chasqui platform: configuration, error
//! taxonomy, at-rest secret encryption, log redaction and the handful of
//! types every subsystem speaks (conversation keys, business hours).

pub mod config;
pub mod error;
pub mod hours;
pub mod redact;
pub mod secrets;
pub mod types;

pub use error::{ChasquiError, Result};
