use crate::canonical_store::{CanonicalStore, UpsertOutcome};
use crate::config::SyncConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::id_assigner::IdAssigner;
use crate::shard_conn::{run_blocking, ShardConnection};
use crate::shard_locator::ShardLocator;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardSyncReport {
    pub shard_name: String,
    pub inserted: u64,
    pub already_present: u64,
    pub conflicts: u64,
    pub cursor: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub shards: Vec<ShardSyncReport>,
    pub failures: Vec<(String, String)>,
}

impl CycleReport {
    pub fn inserted(&self) -> u64 {
        self.shards.iter().map(|s| s.inserted).sum()
    }

    pub fn shard(&self, shard_name: &str) -> Option<&ShardSyncReport> {
        self.shards.iter().find(|s| s.shard_name == shard_name)
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(CycleReport),
    Skipped,
    Aborted(String),
}

/// Marks a sync cycle as in flight. Dropping it clears the flag.
pub struct CycleGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Periodically copies new shard rows into the canonical store.
///
/// At most one cycle runs at a time. A tick that arrives while a cycle is in
/// flight is dropped, not queued. Errors never leave this type; they are
/// logged and counted in the cycle report.
pub struct SyncScheduler {
    config: SyncConfig,
    locator: Arc<ShardLocator>,
    store: Arc<CanonicalStore>,
    assigner: Arc<IdAssigner>,
    running: AtomicBool,
    skipped_ticks: AtomicU64,
    completed_cycles: AtomicU64,
}

impl SyncScheduler {
    pub fn new(
        config: SyncConfig,
        locator: Arc<ShardLocator>,
        store: Arc<CanonicalStore>,
        assigner: Arc<IdAssigner>,
    ) -> Self {
        Self {
            config,
            locator,
            store,
            assigner,
            running: AtomicBool::new(false),
            skipped_ticks: AtomicU64::new(0),
            completed_cycles: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles.load(Ordering::Relaxed)
    }

    pub fn try_begin_cycle(&self) -> Option<CycleGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                running: &self.running,
            })
    }

    pub async fn tick(&self) -> TickOutcome {
        let _guard = match self.try_begin_cycle() {
            Some(guard) => guard,
            None => {
                self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                debug!("previous sync cycle still running, tick dropped");
                return TickOutcome::Skipped;
            }
        };

        match self.run_cycle().await {
            Ok(report) => {
                self.completed_cycles.fetch_add(1, Ordering::Relaxed);
                if report.inserted() > 0 || !report.failures.is_empty() {
                    info!(
                        "sync cycle done: {} new records, {} shard failures",
                        report.inserted(),
                        report.failures.len()
                    );
                }
                TickOutcome::Completed(report)
            }
            Err(e) => {
                let msg = format!("sync cycle aborted: {}", e);
                error!("{}", msg);
                TickOutcome::Aborted(msg)
            }
        }
    }

    async fn run_cycle(&self) -> MirrorResult<CycleReport> {
        // the only failure that aborts the whole cycle
        let shards = self.locator.list_shards()?;

        let mut report = CycleReport::default();
        for shard_name in shards {
            match self.sync_shard(&shard_name).await {
                Ok(shard_report) => report.shards.push(shard_report),
                Err(e) => {
                    let e = MirrorError::ShardScan(shard_name.clone(), e.to_string());
                    error!("{}", e);
                    report.failures.push((shard_name, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    async fn sync_shard(&self, shard_name: &str) -> MirrorResult<ShardSyncReport> {
        let handle = self.locator.open(shard_name).await?;
        let store = self.store.clone();
        let assigner = self.assigner.clone();
        let batch_size = self.config.batch_size;

        let task_name = format!("ingest shard {}", shard_name);
        run_blocking(&task_name, move || {
            ingest_shard(&handle, &store, &assigner, batch_size)
        })
        .await
    }

    /// Ticks every `interval` until `shutdown` turns true. Each tick runs on
    /// its own task so a slow cycle makes later ticks hit the in-flight guard
    /// instead of piling up behind the timer.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("sync scheduler started, interval {:?}", self.config.interval());

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.tick().await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            "sync scheduler stopped after {} cycles, {} ticks dropped",
            self.completed_cycles(),
            self.skipped_ticks()
        );
    }
}

// Runs on the blocking pool: every call below is rusqlite work or the id
// assigner, which may sleep on sequence exhaustion.
fn ingest_shard(
    handle: &ShardConnection,
    store: &CanonicalStore,
    assigner: &IdAssigner,
    batch_size: usize,
) -> MirrorResult<ShardSyncReport> {
    let shard_name = handle.name();
    let mut cursor = store.load_cursor(shard_name)?;
    let mut report = ShardSyncReport {
        shard_name: shard_name.to_string(),
        cursor,
        ..Default::default()
    };

    loop {
        let rows = handle.read_rows_after(cursor, batch_size)?;
        let batch_len = rows.len();
        if batch_len == 0 {
            break;
        }

        let mut last_seq = cursor;
        for row in rows {
            let seq = row.seq;
            let key = row.dedup_key(shard_name);
            if let Some(stored) = store.get_record(&key)? {
                if stored.payload == row.payload() {
                    report.already_present += 1;
                } else {
                    error!(
                        "shard row {} changed after it was mirrored as id {}, change dropped",
                        key, stored.id
                    );
                    report.conflicts += 1;
                }
                last_seq = seq;
                continue;
            }

            let id = assigner.next_id()?;
            let record = row.into_record(id, shard_name);
            match store.upsert(&record) {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::AlreadyPresent) => report.already_present += 1,
                Err(MirrorError::WriterConflict(msg)) => {
                    error!("inconsistent source row dropped: {}", msg);
                    report.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
            last_seq = seq;
        }

        store.save_cursor(shard_name, last_seq)?;
        cursor = last_seq;
        report.cursor = cursor;
        debug!(
            "shard {} batch of {} rows ingested, cursor at {}",
            shard_name, batch_len, cursor
        );

        if batch_len < batch_size {
            break;
        }
    }

    Ok(report)
}
