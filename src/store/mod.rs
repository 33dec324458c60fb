//! Captured message storage.
//!
//! A message becomes visible to `get` and `list` only once `save` has fully
//! completed; implementations serialize concurrent saves so that identifier
//! assignment and visibility happen atomically.

use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod dir;
mod memory;

pub use self::dir::DirStore;
pub use self::memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{:010}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
}

impl Envelope {
    /// Returns `None` when `recipients` is empty.
    pub fn new(sender: String, recipients: Vec<String>) -> Option<Self> {
        if recipients.is_empty() {
            None
        } else {
            Some(Envelope { sender, recipients })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub envelope: Envelope,
    pub body: Vec<u8>,
    pub received: DateTime<Utc>,
}

impl Message {
    pub fn new(envelope: Envelope, body: Vec<u8>) -> Self {
        Message {
            envelope,
            body,
            received: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store is full ({0} messages)")]
    Full(usize),
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt message {id}: {reason}")]
    Corrupt { id: MessageId, reason: String },
}

pub trait MessageStore: Send + Sync {
    fn save(&self, message: Message) -> Result<MessageId, StoreError>;

    fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Identifiers of all visible messages in ascending order.
    fn list(&self) -> Result<Vec<MessageId>, StoreError>;
}
