use crate::def::{Entity, ShardRow, CONTACT_TABLE, MESSAGE_TABLE};
use crate::error::{MirrorError, MirrorResult};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub type ShardHandle = Arc<ShardConnection>;

// rusqlite calls block, so async callers hand them to the blocking pool.
pub(crate) async fn run_blocking<T, F>(task_name: &str, f: F) -> MirrorResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> MirrorResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        let msg = format!("{} task failed: {}", task_name, e);
        error!("{}", msg);
        MirrorError::Internal(msg)
    })?
}

/// A read-only connection to one source shard file.
#[derive(Debug)]
pub struct ShardConnection {
    name: String,
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl ShardConnection {
    pub fn open(name: &str, path: &Path) -> MirrorResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| {
            let msg = format!("failed to open shard db at {}: {}", path.display(), e);
            error!("{}", msg);
            MirrorError::OpenFailed(name.to_string(), msg)
        })?;

        // sqlite opens lazily, touch the schema so a corrupt file fails here
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| {
            let msg = format!("shard db at {} is not readable: {}", path.display(), e);
            error!("{}", msg);
            MirrorError::OpenFailed(name.to_string(), msg)
        })?;

        debug!("opened shard {} at {}", name, path.display());

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MirrorResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MirrorError::Internal(format!("shard {} connection poisoned", self.name)))
    }

    /// Rows with `local_id > after_seq`, ascending, at most `limit`.
    ///
    /// Only `local_id` is required. A NULL in any other column reads as an
    /// empty string or zero so one bad row cannot stall the shard.
    pub fn read_rows_after(&self, after_seq: i64, limit: usize) -> MirrorResult<Vec<ShardRow>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT local_id, talker, create_time, content, sender FROM {}
             WHERE local_id > ?1 ORDER BY local_id ASC LIMIT ?2",
            MESSAGE_TABLE
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![after_seq, limit as i64], |row| {
            Ok(ShardRow {
                seq: row.get(0)?,
                talker: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                create_time: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
                content: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                sender: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn has_talker(&self, talker: &str) -> MirrorResult<bool> {
        let conn = self.lock()?;
        let sql = format!("SELECT 1 FROM {} WHERE talker = ?1 LIMIT 1", MESSAGE_TABLE);
        let found = conn
            .query_row(&sql, params![talker], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn find_contact_by_nickname(&self, nickname: &str) -> MirrorResult<Option<Entity>> {
        self.find_contact("nickname", nickname)
    }

    pub fn find_contact_by_username(&self, username: &str) -> MirrorResult<Option<Entity>> {
        self.find_contact("username", username)
    }

    fn find_contact(&self, column: &str, value: &str) -> MirrorResult<Option<Entity>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT username, nickname FROM {} WHERE {} = ?1 ORDER BY username ASC LIMIT 1",
            CONTACT_TABLE, column
        );
        let entity = conn
            .query_row(&sql, params![value], |row| {
                Ok(Entity {
                    username: row.get(0)?,
                    nickname: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    shard_name: None,
                })
            })
            .optional()?;
        Ok(entity)
    }
}
