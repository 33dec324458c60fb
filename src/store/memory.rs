use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{Message, MessageId, MessageStore, StoreError};

#[derive(Debug)]
struct Inner {
    next_id: u64,
    messages: BTreeMap<MessageId, Message>,
}

/// Keeps captured messages in process memory. `max_messages == 0` means
/// unlimited.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_messages: usize,
}

impl MemoryStore {
    pub fn new(max_messages: usize) -> Self {
        MemoryStore {
            inner: Mutex::new(Inner {
                next_id: 1,
                messages: BTreeMap::new(),
            }),
            max_messages,
        }
    }
}

impl MessageStore for MemoryStore {
    fn save(&self, message: Message) -> Result<MessageId, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if self.max_messages > 0 && inner.messages.len() >= self.max_messages {
            return Err(StoreError::Full(self.max_messages));
        }

        let id = MessageId(inner.next_id);
        inner.next_id += 1;
        inner.messages.insert(id, message);

        Ok(id)
    }

    fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.messages.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<MessageId>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.messages.keys().copied().collect())
    }
}
