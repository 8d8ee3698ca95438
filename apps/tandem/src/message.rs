use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One chat line as handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sender: String,
    pub text: String,
    pub timestamp_millis: u64,
    /// The remote party of the conversation, whichever direction the line went.
    pub peer_id: String,
}

impl MessageRecord {
    pub fn now(sender: impl Into<String>, text: impl Into<String>, peer_id: impl Into<String>) -> Self {
        let timestamp_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Self {
            sender: sender.into(),
            text: text.into(),
            timestamp_millis,
            peer_id: peer_id.into(),
        }
    }
}

/// Storage for delivered and sent messages.
pub trait MessageSink: Send + Sync {
    fn record(&self, record: MessageRecord);
}

#[derive(Debug, Default)]
pub struct MemoryMessageLog {
    records: Mutex<Vec<MessageRecord>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation(&self, peer_id: &str) -> Vec<MessageRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageSink for MemoryMessageLog {
    fn record(&self, record: MessageRecord) {
        self.records.lock().push(record);
    }
}
