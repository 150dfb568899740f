use mirror_lib::*;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shards")).unwrap();
        Self { dir }
    }

    pub fn config(&self) -> MirrorConfig {
        let mut config = MirrorConfig::default();
        config.store.path = self.dir.path().join("mirror.db");
        config.shards.shard_dir = self.dir.path().join("shards");
        config.sync.batch_size = 2;
        config
    }

    fn shard_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("shards").join(format!("{}.db", name))
    }

    pub fn write_messages(&self, shard: &str, rows: &[(i64, &str, &str)]) {
        let conn = Connection::open(self.shard_path(shard)).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS message (
                local_id INTEGER PRIMARY KEY,
                talker TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                content TEXT NOT NULL,
                sender TEXT NOT NULL
            );",
        )
        .unwrap();
        for (seq, talker, content) in rows {
            conn.execute(
                "INSERT INTO message VALUES (?1, ?2, ?3, ?4, ?5)",
                params![seq, talker, 1_650_000_000 + seq, content, "self"],
            )
            .unwrap();
        }
    }

    pub fn write_contacts(&self, contacts: &[(&str, &str)]) {
        let conn = Connection::open(self.shard_path("contact")).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contact (username TEXT PRIMARY KEY, nickname TEXT NOT NULL);",
        )
        .unwrap();
        for (username, nickname) in contacts {
            conn.execute(
                "INSERT INTO contact VALUES (?1, ?2)",
                params![username, nickname],
            )
            .unwrap();
        }
    }
}

pub struct Mirror {
    pub locator: Arc<ShardLocator>,
    pub store: Arc<CanonicalStore>,
    pub scheduler: Arc<SyncScheduler>,
    pub entities: EntityService,
}

impl Mirror {
    // Wires the components the same way the service binary does.
    pub fn start(config: &MirrorConfig) -> Self {
        let locator = Arc::new(ShardLocator::new(config.shards.clone()));
        let store = Arc::new(CanonicalStore::open(&config.store.path).unwrap());
        let assigner = Arc::new(IdAssigner::new(config.snowflake.clone()).unwrap());
        let scheduler = Arc::new(SyncScheduler::new(
            config.sync.clone(),
            locator.clone(),
            store.clone(),
            assigner,
        ));
        let entities = EntityService::new(locator.clone(), store.clone());
        Self {
            locator,
            store,
            scheduler,
            entities,
        }
    }
}

pub fn completed(outcome: TickOutcome) -> CycleReport {
    match outcome {
        TickOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {:?}", other),
    }
}
