use crate::canonical_store::CanonicalStore;
use crate::config::ShardConfig;
use crate::id_assigner::{IdAssigner, SnowflakeConfig};
use crate::shard_locator::ShardLocator;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct ShardFixture {
    dir: TempDir,
}

impl ShardFixture {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.dir.path().join("shards")
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.path().join("mirror.db")
    }

    fn shard_file(&self, name: &str) -> PathBuf {
        std::fs::create_dir_all(self.shard_dir()).unwrap();
        self.shard_dir().join(format!("{}.db", name))
    }

    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            shard_dir: self.shard_dir(),
            ..Default::default()
        }
    }

    pub fn locator(&self) -> ShardLocator {
        ShardLocator::new(self.shard_config())
    }

    pub fn store(&self) -> Arc<CanonicalStore> {
        Arc::new(CanonicalStore::open(&self.store_path()).unwrap())
    }

    pub fn assigner(&self) -> Arc<IdAssigner> {
        Arc::new(IdAssigner::new(SnowflakeConfig::default()).unwrap())
    }

    pub fn add_message_shard(&self, name: &str, rows: &[(i64, &str, &str)]) {
        let conn = Connection::open(self.shard_file(name)).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS message (
                local_id    INTEGER PRIMARY KEY,
                talker      TEXT,
                create_time INTEGER,
                content     TEXT,
                sender      TEXT
            );",
        )
        .unwrap();
        drop(conn);
        self.add_rows(name, rows);
    }

    pub fn add_rows(&self, name: &str, rows: &[(i64, &str, &str)]) {
        let conn = Connection::open(self.shard_file(name)).unwrap();
        for (seq, talker, content) in rows {
            conn.execute(
                "INSERT INTO message (local_id, talker, create_time, content, sender)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![seq, talker, 1_700_000_000 + seq, content, talker],
            )
            .unwrap();
        }
    }

    pub fn add_row_without_content(&self, name: &str, seq: i64, talker: &str) {
        let conn = Connection::open(self.shard_file(name)).unwrap();
        conn.execute(
            "INSERT INTO message (local_id, talker, create_time, content, sender)
             VALUES (?1, ?2, NULL, NULL, NULL)",
            params![seq, talker],
        )
        .unwrap();
    }

    pub fn rewrite_content(&self, name: &str, seq: i64, content: &str) {
        let conn = Connection::open(self.shard_file(name)).unwrap();
        conn.execute(
            "UPDATE message SET content = ?1 WHERE local_id = ?2",
            params![content, seq],
        )
        .unwrap();
    }

    // Holds an exclusive lock on the shard file until the returned connection commits.
    pub fn lock_shard(&self, name: &str) -> Connection {
        let conn = Connection::open(self.shard_file(name)).unwrap();
        conn.execute_batch("BEGIN EXCLUSIVE;").unwrap();
        conn
    }

    pub fn add_contact_shard(&self, contacts: &[(&str, &str)]) {
        let conn = Connection::open(self.shard_file("contact")).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contact (
                username TEXT PRIMARY KEY,
                nickname TEXT NOT NULL
            );",
        )
        .unwrap();
        for (username, nickname) in contacts {
            conn.execute(
                "INSERT OR REPLACE INTO contact (username, nickname) VALUES (?1, ?2)",
                params![username, nickname],
            )
            .unwrap();
        }
    }

    pub fn write_garbage(&self, name: &str) {
        let junk = "this is not a sqlite database file. ".repeat(64);
        std::fs::write(self.shard_file(name), junk).unwrap();
    }

    pub fn remove_shard(&self, name: &str) {
        std::fs::remove_file(self.shard_file(name)).unwrap();
    }
}
