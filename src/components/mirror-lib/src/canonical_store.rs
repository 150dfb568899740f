use crate::def::{
    now_millis, CanonicalRecord, DedupKey, Entity, MessagePayload, ShardCursor,
};
use crate::error::{MirrorError, MirrorResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// The consolidated store. Holds mirrored messages, the per-shard ingest
/// cursors and the saved entities in one SQLite file.
pub struct CanonicalStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl CanonicalStore {
    pub fn open(db_path: &Path) -> MirrorResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| {
            let msg = format!("failed to open canonical store at {}: {}", db_path.display(), e);
            error!("{}", msg);
            e
        })?;

        // WAL so façade reads are not blocked by the sync writer
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS canonical_messages (
                id          INTEGER PRIMARY KEY,
                shard_name  TEXT NOT NULL,
                local_seq   INTEGER NOT NULL,
                talker      TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                content     TEXT NOT NULL,
                sender      TEXT NOT NULL,
                UNIQUE(shard_name, local_seq)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_talker
            ON canonical_messages (talker, id);

            CREATE TABLE IF NOT EXISTS shard_cursors (
                shard_name  TEXT PRIMARY KEY,
                last_seq    INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entities (
                username    TEXT PRIMARY KEY,
                nickname    TEXT NOT NULL,
                shard_name  TEXT,
                updated_at  INTEGER NOT NULL
            );",
        )
        .map_err(|e| {
            let msg = format!("failed to create canonical store tables: {}", e);
            error!("{}", msg);
            e
        })?;

        info!("canonical store opened at {}", db_path.display());

        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> MirrorResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MirrorError::Internal("canonical store connection poisoned".to_string()))
    }

    /// Inserts `record` unless its dedup key is already stored.
    ///
    /// An existing row with the same payload is a no-op. An existing row
    /// with a different payload, or an id already used by another key, is a
    /// `WriterConflict` and the new write is dropped.
    pub fn upsert(&self, record: &CanonicalRecord) -> MirrorResult<UpsertOutcome> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO canonical_messages
                (id, shard_name, local_seq, talker, create_time, content, sender)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id as i64,
                record.key.shard_name,
                record.key.seq,
                record.payload.talker,
                record.payload.create_time,
                record.payload.content,
                record.payload.sender,
            ],
        )?;
        if changed == 1 {
            return Ok(UpsertOutcome::Inserted);
        }

        let existing = Self::query_record(&conn, &record.key)?;
        match existing {
            Some(existing) if existing.payload == record.payload => {
                Ok(UpsertOutcome::AlreadyPresent)
            }
            Some(existing) => {
                let msg = format!(
                    "divergent content for {}: stored id {}, dropped id {}",
                    record.key, existing.id, record.id
                );
                error!("{}", msg);
                Err(MirrorError::WriterConflict(msg))
            }
            None => {
                let msg = format!("id {} already used, dropped record {}", record.id, record.key);
                error!("{}", msg);
                Err(MirrorError::WriterConflict(msg))
            }
        }
    }

    fn query_record(conn: &Connection, key: &DedupKey) -> MirrorResult<Option<CanonicalRecord>> {
        let record = conn
            .query_row(
                "SELECT id, talker, create_time, content, sender FROM canonical_messages
                 WHERE shard_name = ?1 AND local_seq = ?2",
                params![key.shard_name, key.seq],
                |row| {
                    Ok(CanonicalRecord {
                        id: row.get::<_, i64>(0)? as u64,
                        key: key.clone(),
                        payload: MessagePayload {
                            talker: row.get(1)?,
                            create_time: row.get(2)?,
                            content: row.get(3)?,
                            sender: row.get(4)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_record(&self, key: &DedupKey) -> MirrorResult<Option<CanonicalRecord>> {
        let conn = self.lock()?;
        Self::query_record(&conn, key)
    }

    pub fn find_record_id(&self, key: &DedupKey) -> MirrorResult<Option<u64>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM canonical_messages WHERE shard_name = ?1 AND local_seq = ?2",
                params![key.shard_name, key.seq],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.map(|id| id as u64))
    }

    pub fn record_count(&self) -> MirrorResult<u64> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT count(*) FROM canonical_messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn has_records_from(&self, shard_name: &str, talker: &str) -> MirrorResult<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM canonical_messages WHERE shard_name = ?1 AND talker = ?2 LIMIT 1",
                params![shard_name, talker],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // Ordered by assigned id, which is roughly ingest time.
    pub fn list_messages(
        &self,
        talker: &str,
        after_id: u64,
        limit: usize,
    ) -> MirrorResult<Vec<CanonicalRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, shard_name, local_seq, talker, create_time, content, sender
             FROM canonical_messages
             WHERE talker = ?1 AND id > ?2
             ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![talker, after_id as i64, limit as i64], |row| {
            Ok(CanonicalRecord {
                id: row.get::<_, i64>(0)? as u64,
                key: DedupKey {
                    shard_name: row.get(1)?,
                    seq: row.get(2)?,
                },
                payload: MessagePayload {
                    talker: row.get(3)?,
                    create_time: row.get(4)?,
                    content: row.get(5)?,
                    sender: row.get(6)?,
                },
            })
        })?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    // A shard with no cursor row has ingested nothing yet.
    pub fn load_cursor(&self, shard_name: &str) -> MirrorResult<i64> {
        let conn = self.lock()?;
        let last_seq = conn
            .query_row(
                "SELECT last_seq FROM shard_cursors WHERE shard_name = ?1",
                params![shard_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(last_seq.unwrap_or(0))
    }

    /// Persists the cursor. It only ever moves forward: saving a lower value
    /// than the stored one leaves the stored one in place.
    pub fn save_cursor(&self, shard_name: &str, last_seq: i64) -> MirrorResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO shard_cursors (shard_name, last_seq, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(shard_name) DO UPDATE SET
                last_seq = max(shard_cursors.last_seq, excluded.last_seq),
                updated_at = excluded.updated_at",
            params![shard_name, last_seq, now_millis() as i64],
        )?;
        debug!("cursor of shard {} saved at {}", shard_name, last_seq);
        Ok(())
    }

    pub fn list_cursors(&self) -> MirrorResult<Vec<ShardCursor>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT shard_name, last_seq FROM shard_cursors ORDER BY shard_name")?;
        let rows = stmt.query_map([], |row| {
            Ok(ShardCursor {
                shard_name: row.get(0)?,
                last_seq: row.get(1)?,
            })
        })?;

        let mut cursors = Vec::new();
        for cursor in rows {
            cursors.push(cursor?);
        }
        Ok(cursors)
    }

    pub fn get_entity(&self, username: &str) -> MirrorResult<Option<Entity>> {
        let conn = self.lock()?;
        let entity = conn
            .query_row(
                "SELECT username, nickname, shard_name FROM entities WHERE username = ?1",
                params![username],
                |row| {
                    Ok(Entity {
                        username: row.get(0)?,
                        nickname: row.get(1)?,
                        shard_name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(entity)
    }

    pub fn save_entity(&self, entity: &Entity) -> MirrorResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO entities (username, nickname, shard_name, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(username) DO UPDATE SET
                nickname = excluded.nickname,
                shard_name = excluded.shard_name,
                updated_at = excluded.updated_at",
            params![
                entity.username,
                entity.nickname,
                entity.shard_name,
                now_millis() as i64
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn record(id: u64, shard: &str, seq: i64, content: &str) -> CanonicalRecord {
        CanonicalRecord {
            id,
            key: DedupKey {
                shard_name: shard.to_string(),
                seq,
            },
            payload: MessagePayload {
                talker: "alice".to_string(),
                create_time: 1_700_000_000,
                content: content.to_string(),
                sender: "alice".to_string(),
            },
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> CanonicalStore {
        CanonicalStore::open(&dir.path().join("canonical.db")).unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let rec = record(100, "msg_0", 1, "hello");
        assert_eq!(store.upsert(&rec).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&rec).unwrap(), UpsertOutcome::AlreadyPresent);

        // a replay with a fresh id keeps the first writer's id
        let replay = record(200, "msg_0", 1, "hello");
        assert_eq!(store.upsert(&replay).unwrap(), UpsertOutcome::AlreadyPresent);
        assert_eq!(store.find_record_id(&rec.key).unwrap(), Some(100));
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn test_divergent_content_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert(&record(100, "msg_0", 1, "hello")).unwrap();
        let err = store.upsert(&record(101, "msg_0", 1, "edited")).unwrap_err();
        assert!(matches!(err, MirrorError::WriterConflict(_)));

        let err = store.upsert(&record(100, "msg_1", 7, "other")).unwrap_err();
        assert!(matches!(err, MirrorError::WriterConflict(_)));

        let stored = store.get_record(&record(0, "msg_0", 1, "").key).unwrap().unwrap();
        assert_eq!(stored.payload.content, "hello");
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.load_cursor("msg_0").unwrap(), 0);
        store.save_cursor("msg_0", 5).unwrap();
        store.save_cursor("msg_0", 3).unwrap();
        assert_eq!(store.load_cursor("msg_0").unwrap(), 5);
        store.save_cursor("msg_1", 2).unwrap();

        let cursors = store.list_cursors().unwrap();
        assert_eq!(
            cursors,
            vec![
                ShardCursor {
                    shard_name: "msg_0".to_string(),
                    last_seq: 5
                },
                ShardCursor {
                    shard_name: "msg_1".to_string(),
                    last_seq: 2
                },
            ]
        );

        // survives reopen
        drop(store);
        let store = open_store(&dir);
        assert_eq!(store.load_cursor("msg_0").unwrap(), 5);
    }

    #[test]
    fn test_concurrent_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut inserted = 0;
                for seq in 0..50i64 {
                    // every thread races on the shared shard, and writes its own
                    let shared = record(t * 1000 + seq as u64 + 1, "shared", seq, "same");
                    if store.upsert(&shared).unwrap() == UpsertOutcome::Inserted {
                        inserted += 1;
                    }
                    let own = record(
                        100_000 + t * 1000 + seq as u64,
                        &format!("own_{}", t),
                        seq,
                        "mine",
                    );
                    assert_eq!(store.upsert(&own).unwrap(), UpsertOutcome::Inserted);
                }
                inserted
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(store.record_count().unwrap(), 50 + 4 * 50);
    }

    #[test]
    fn test_entities_and_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let entity = Entity {
            username: "alice".to_string(),
            nickname: "Alice".to_string(),
            shard_name: Some("msg_0".to_string()),
        };
        store.save_entity(&entity).unwrap();
        assert_eq!(store.get_entity("alice").unwrap(), Some(entity));
        assert_eq!(store.get_entity("bob").unwrap(), None);

        store.upsert(&record(10, "msg_0", 1, "a")).unwrap();
        store.upsert(&record(11, "msg_0", 2, "b")).unwrap();
        assert!(store.has_records_from("msg_0", "alice").unwrap());
        assert!(!store.has_records_from("msg_1", "alice").unwrap());

        let messages = store.list_messages("alice", 10, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.content, "b");
    }
}
