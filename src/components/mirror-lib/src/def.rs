use serde::{Deserialize, Serialize};
use std::fmt;

pub const SERVICE_NAME: &str = "msg_mirror";

pub const MESSAGE_TABLE: &str = "message";
pub const CONTACT_TABLE: &str = "contact";

/// A contact whose chat history is mirrored. `username` never changes,
/// `nickname` may.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub username: String,
    pub nickname: String,
    pub shard_name: Option<String>,
}

/// What the HTTP layer hands to `EntityService::save_entity`. There is no
/// shard field: the target shard is always resolved here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveEntityRequest {
    pub username: String,
    pub nickname: String,
}

/// One row of a source shard's `message` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRow {
    pub seq: i64,
    pub talker: String,
    pub create_time: i64,
    pub content: String,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub shard_name: String,
    pub seq: i64,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.shard_name, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub talker: String,
    pub create_time: i64,
    pub content: String,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: u64,
    pub key: DedupKey,
    pub payload: MessagePayload,
}

impl ShardRow {
    pub fn dedup_key(&self, shard_name: &str) -> DedupKey {
        DedupKey {
            shard_name: shard_name.to_string(),
            seq: self.seq,
        }
    }

    pub fn payload(&self) -> MessagePayload {
        MessagePayload {
            talker: self.talker.clone(),
            create_time: self.create_time,
            content: self.content.clone(),
            sender: self.sender.clone(),
        }
    }

    pub fn into_record(self, id: u64, shard_name: &str) -> CanonicalRecord {
        CanonicalRecord {
            id,
            key: self.dedup_key(shard_name),
            payload: MessagePayload {
                talker: self.talker,
                create_time: self.create_time,
                content: self.content,
                sender: self.sender,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCursor {
    pub shard_name: String,
    pub last_seq: i64,
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
