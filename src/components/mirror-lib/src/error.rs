use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Shard file missing: {0}")]
    ShardFileMissing(String),
    #[error("Open shard {0} failed: {1}")]
    OpenFailed(String, String),
    #[error("Clock moved backwards: last {last} ms, now {now} ms")]
    ClockRegression { last: u64, now: u64 },
    #[error("Scan shard {0} error: {1}")]
    ShardScan(String, String),
    #[error("Writer conflict: {0}")]
    WriterConflict(String),
    #[error("Entity {username} is pinned to shard {pinned}, refusing to move it to {resolved}")]
    ShardReassignment {
        username: String,
        pinned: String,
        resolved: String,
    },
    #[error("Invalid param: {0}")]
    InvalidParam(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("DB Error: {0}")]
    DbError(#[from] rusqlite::Error),
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MirrorError::NotFound(_))
    }
}

pub type MirrorResult<T> = std::result::Result<T, MirrorError>;
