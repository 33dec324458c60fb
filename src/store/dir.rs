use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Envelope, Message, MessageId, MessageStore, StoreError};

static BODY_EXTENSION: &str = "eml";
static METADATA_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    id: MessageId,
    envelope: Envelope,
    received: DateTime<Utc>,
    size: usize,
}

#[derive(Debug)]
struct Counters {
    next_id: u64,
    stored: usize,
}

/// Stores each message as `<id>.eml` (raw body) plus `<id>.json` (envelope
/// and timestamp). The metadata file is renamed into place last, so a message
/// without one is invisible.
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
    max_messages: usize,
    counters: Mutex<Counters>,
}

impl DirStore {
    pub fn open<P: AsRef<Path>>(root: P, max_messages: usize) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let ids = scan_ids(&root)?;
        let next_id = ids.last().map_or(1, |id| id.0 + 1);

        debug!(
            "opened message store at {}: {} messages, next id {}",
            root.display(),
            ids.len(),
            next_id
        );

        Ok(DirStore {
            root,
            max_messages,
            counters: Mutex::new(Counters {
                next_id,
                stored: ids.len(),
            }),
        })
    }

    fn path(&self, id: MessageId, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, extension))
    }
}

impl MessageStore for DirStore {
    fn save(&self, message: Message) -> Result<MessageId, StoreError> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());

        if self.max_messages > 0 && counters.stored >= self.max_messages {
            return Err(StoreError::Full(self.max_messages));
        }

        let id = MessageId(counters.next_id);
        let metadata = Metadata {
            id,
            envelope: message.envelope,
            received: message.received,
            size: message.body.len(),
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        write_atomic(&self.path(id, BODY_EXTENSION), &message.body)?;
        if let Err(err) = write_atomic(&self.path(id, METADATA_EXTENSION), &json) {
            let _ = fs::remove_file(self.path(id, BODY_EXTENSION));
            return Err(err.into());
        }

        counters.next_id += 1;
        counters.stored += 1;

        Ok(id)
    }

    fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let json = match fs::read(self.path(id, METADATA_EXTENSION)) {
            Ok(json) => json,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let metadata: Metadata = serde_json::from_slice(&json).map_err(|e| StoreError::Corrupt {
            id,
            reason: e.to_string(),
        })?;

        let body = fs::read(self.path(id, BODY_EXTENSION)).map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("body unreadable: {}", e),
        })?;
        if body.len() != metadata.size {
            return Err(StoreError::Corrupt {
                id,
                reason: format!("expected {} bytes, found {}", metadata.size, body.len()),
            });
        }

        Ok(Some(Message {
            envelope: metadata.envelope,
            body,
            received: metadata.received,
        }))
    }

    fn list(&self) -> Result<Vec<MessageId>, StoreError> {
        Ok(scan_ids(&self.root)?)
    }
}

fn scan_ids(root: &Path) -> io::Result<Vec<MessageId>> {
    let mut ids = Vec::new();

    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(METADATA_EXTENSION) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            ids.push(MessageId(id));
        }
    }

    ids.sort();
    Ok(ids)
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn message(sender: &str, body: &str) -> Message {
        let envelope = Envelope::new(sender.into(), vec!["b@x.com".into(), "c@x.com".into()]).unwrap();
        Message::new(envelope, body.as_bytes().to_vec())
    }

    #[test]
    fn saved_message_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = DirStore::open(dir.path(), 0).unwrap();

        let original = message("a@x.com", "Subject: hi\r\n\r\nHello\r\n");
        let id = store.save(original.clone()).unwrap();

        let loaded = store.get(id).unwrap().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(store.list().unwrap(), vec![id]);
        assert!(dir.path().join(format!("{}.eml", id)).exists());
    }

    #[test]
    fn ids_resume_after_reopen() {
        let dir = TempDir::new().unwrap();
        let first = {
            let store = DirStore::open(dir.path(), 0).unwrap();
            store.save(message("a@x.com", "one\r\n")).unwrap();
            store.save(message("a@x.com", "two\r\n")).unwrap()
        };

        let store = DirStore::open(dir.path(), 0).unwrap();
        let next = store.save(message("a@x.com", "three\r\n")).unwrap();
        assert!(next > first);
        assert_eq!(store.list().unwrap().len(), 3);
    }

    #[test]
    fn body_without_metadata_is_invisible() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("0000000007.eml"), b"partial").unwrap();
        fs::write(dir.path().join("0000000008.json.tmp"), b"{").unwrap();

        let store = DirStore::open(dir.path(), 0).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(store.get(MessageId(7)).unwrap().is_none());
    }

    #[test]
    fn truncated_body_is_reported_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = DirStore::open(dir.path(), 0).unwrap();
        let id = store.save(message("a@x.com", "Hello\r\n")).unwrap();
        fs::write(dir.path().join(format!("{}.eml", id)), b"He").unwrap();

        match store.get(id) {
            Err(StoreError::Corrupt { id: bad, .. }) => assert_eq!(bad, id),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn capacity_counts_existing_messages() {
        let dir = TempDir::new().unwrap();
        DirStore::open(dir.path(), 0)
            .unwrap()
            .save(message("a@x.com", "one\r\n"))
            .unwrap();

        let store = DirStore::open(dir.path(), 1).unwrap();
        assert!(matches!(
            store.save(message("a@x.com", "two\r\n")),
            Err(StoreError::Full(1))
        ));
    }
}
