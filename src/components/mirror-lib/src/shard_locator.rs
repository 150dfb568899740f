use crate::config::ShardConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::shard_conn::{run_blocking, ShardConnection, ShardHandle};
use mini_moka::sync::Cache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardLocatorStats {
    pub physical_opens: u64,
    pub open_failures: u64,
    pub closes: u64,
}

/// Owns every live shard connection and the username -> shard mapping.
///
/// Cache hits never take a lock. A miss goes through a per-shard mutex and
/// re-checks the cache, so concurrent callers for the same unopened shard
/// share one physical open.
pub struct ShardLocator {
    config: ShardConfig,
    connections: Cache<String, ShardHandle>,
    resolved: Cache<String, String>,
    open_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    physical_opens: AtomicU64,
    open_failures: AtomicU64,
    closes: AtomicU64,
}

impl ShardLocator {
    pub fn new(config: ShardConfig) -> Self {
        let connections = Cache::builder()
            .max_capacity(config.max_cached_shards)
            .time_to_idle(config.idle_timeout())
            .build();
        let resolved = Cache::new(config.resolve_cache_size);

        info!(
            "shard locator created: dir={}, idle_timeout={:?}, open_timeout={:?}",
            config.shard_dir.display(),
            config.idle_timeout(),
            config.open_timeout()
        );

        Self {
            config,
            connections,
            resolved,
            open_locks: Mutex::new(HashMap::new()),
            physical_opens: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn contact_shard_name(&self) -> &str {
        &self.config.contact_shard
    }

    pub fn stats(&self) -> ShardLocatorStats {
        ShardLocatorStats {
            physical_opens: self.physical_opens.load(Ordering::SeqCst),
            open_failures: self.open_failures.load(Ordering::SeqCst),
            closes: self.closes.load(Ordering::SeqCst),
        }
    }

    // Message shards in the shard dir, in numeric suffix order (msg_2 before
    // msg_10). Names without a numeric suffix sort last. The contact shard is
    // not one of them.
    pub fn list_shards(&self) -> MirrorResult<Vec<String>> {
        let dir = &self.config.shard_dir;
        let entries = std::fs::read_dir(dir).map_err(|e| {
            let msg = format!("failed to read shard dir {}: {}", dir.display(), e);
            error!("{}", msg);
            MirrorError::IoError(e)
        })?;

        let mut shards = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let ext = path.extension().and_then(|s| s.to_str());
            if ext != Some(self.config.extension.as_str()) {
                continue;
            }

            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if stem.starts_with(&self.config.message_prefix) && stem != self.config.contact_shard {
                shards.push(stem.to_string());
            }
        }

        let prefix_len = self.config.message_prefix.len();
        shards.sort_by_cached_key(|name| {
            let index = name[prefix_len..].parse::<u64>().ok();
            (index.is_none(), index, name.clone())
        });
        Ok(shards)
    }

    /// Finds the shard holding `entity_key`'s messages.
    ///
    /// Shards are scanned in `list_shards` order and the first one with a
    /// matching `talker` wins. The answer is cached until `invalidate` is
    /// called or the cache drops it for capacity; a dropped answer is
    /// recomputed on the next call and can differ if an earlier shard has
    /// since gained rows for the key. The shard an entity is pinned to lives
    /// in the canonical store, see `EntityService::save_entity`.
    pub async fn resolve(&self, entity_key: &str) -> MirrorResult<String> {
        let entity_key = entity_key.trim();
        if entity_key.is_empty() {
            return Err(MirrorError::NotFound("empty entity key".to_string()));
        }

        if let Some(shard_name) = self.resolved.get(&entity_key.to_string()) {
            return Ok(shard_name);
        }

        let shards = self.list_shards()?;
        for shard_name in shards {
            let handle = match self.open(&shard_name).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("skip shard {} while resolving {}: {}", shard_name, entity_key, e);
                    continue;
                }
            };

            let talker = entity_key.to_string();
            let scan = run_blocking("resolve scan", move || handle.has_talker(&talker)).await;
            match scan {
                Ok(true) => {
                    info!("resolved {} to shard {}", entity_key, shard_name);
                    self.resolved
                        .insert(entity_key.to_string(), shard_name.clone());
                    return Ok(shard_name);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("failed to scan shard {} for {}: {}", shard_name, entity_key, e);
                }
            }
        }

        Err(MirrorError::NotFound(format!(
            "no shard holds messages for {}",
            entity_key
        )))
    }

    pub fn invalidate(&self, entity_key: &str) {
        self.resolved.invalidate(&entity_key.trim().to_string());
    }

    pub fn is_cached(&self, shard_name: &str) -> bool {
        self.connections.contains_key(&shard_name.to_string())
    }

    pub async fn open(&self, shard_name: &str) -> MirrorResult<ShardHandle> {
        let key = shard_name.to_string();
        if let Some(handle) = self.connections.get(&key) {
            return Ok(handle);
        }

        let lock = {
            let mut locks = self.open_locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock().await;
        let ret = self.open_locked(&key).await;
        drop(guard);

        let mut locks = self.open_locks.lock().await;
        if locks.get(&key).map_or(false, |l| Arc::ptr_eq(l, &lock)) {
            locks.remove(&key);
        }
        ret
    }

    // Caller holds the shard's open lock.
    async fn open_locked(&self, shard_name: &str) -> MirrorResult<ShardHandle> {
        let key = shard_name.to_string();

        // someone else may have finished the open while we waited
        if let Some(handle) = self.connections.get(&key) {
            return Ok(handle);
        }

        let path = self.config.shard_path(shard_name);
        if !path.exists() {
            self.connections.invalidate(&key);
            let msg = format!("shard {} has no file at {}", shard_name, path.display());
            warn!("{}", msg);
            return Err(MirrorError::ShardFileMissing(msg));
        }

        self.physical_opens.fetch_add(1, Ordering::SeqCst);
        let name = key.clone();
        let task = tokio::task::spawn_blocking(move || ShardConnection::open(&name, &path));
        let ret = match tokio::time::timeout(self.config.open_timeout(), task).await {
            Ok(Ok(ret)) => ret,
            Ok(Err(e)) => Err(MirrorError::OpenFailed(
                key.clone(),
                format!("open task failed: {}", e),
            )),
            Err(_) => Err(MirrorError::OpenFailed(
                key.clone(),
                format!("open timed out after {:?}", self.config.open_timeout()),
            )),
        };

        match ret {
            Ok(conn) => {
                let handle: ShardHandle = Arc::new(conn);
                self.connections.insert(key, handle.clone());
                info!("shard {} opened and cached", shard_name);
                Ok(handle)
            }
            Err(e) => {
                self.open_failures.fetch_add(1, Ordering::SeqCst);
                self.connections.invalidate(&key);
                error!("open shard {} failed: {}", shard_name, e);
                Err(e)
            }
        }
    }

    pub async fn open_contact_shard(&self) -> MirrorResult<ShardHandle> {
        let name = self.config.contact_shard.clone();
        self.open(&name).await
    }

    /// Drops the cached handle. Callers still holding it keep a usable
    /// connection until they let go of it.
    pub fn close(&self, shard_name: &str) {
        let key = shard_name.to_string();
        if self.connections.contains_key(&key) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            info!("shard {} closed", shard_name);
        }
        self.connections.invalidate(&key);
    }

    pub fn close_all(&self) {
        info!("closing all cached shards");
        self.connections.invalidate_all();
    }
}
