//! WhatsApp Cloud API wire codec and HTTP client, plus the CRM REST
//! contract the flow engine and agent tools consume.
//!
//! Everything provider-shaped lives here: the inbound webhook envelope,
//! the canonical [`event::InboundEvent`] it parses into, outbound payload
//! builders, the verify handshake, and the retrying send client.

pub mod client;
pub mod crm;
pub mod envelope;
pub mod error;
pub mod event;
pub mod outbound;
pub mod verify;

pub use client::CloudApiClient;
pub use error::{Result, WireError};
pub use event::InboundEvent;
