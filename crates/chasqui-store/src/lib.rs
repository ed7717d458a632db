//! Durable state for the platform: conversations, messages, attachments,
//! advisors, queues and channel connections, all in one SQLite file.
//!
//! The [`Store`] is the single shared mutable state between the flow
//! engine, the queue dispatcher, the schedulers and operator actions.
//! Per-conversation writer exclusivity is enforced with keyed async locks
//! ([`Store::lock_conversation`]); every mutation publishes a
//! [`changes::ChangeRecord`] the realtime bus fans out.

pub mod advisors;
pub mod changes;
pub mod connections;
pub mod conversations;
pub mod db;
pub mod error;
pub mod queues;
pub mod reports;
pub mod types;

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::Connection;

pub use changes::{ChangeBus, ChangeRecord};
pub use error::{Result, StoreError};

pub struct Store {
    db: Mutex<Connection>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    changes: ChangeBus,
}

impl Store {
    /// Wrap an already-open connection, initialising the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            locks: DashMap::new(),
            changes: ChangeBus::new(),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn changes(&self) -> &ChangeBus {
        &self.changes
    }

    /// Acquire the conversation's exclusive writer lock. All macro-steps,
    /// assignment attempts and scheduler mutations for a conversation run
    /// under this guard; tasks for different conversations proceed in
    /// parallel.
    pub async fn lock_conversation(&self, conversation_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}
