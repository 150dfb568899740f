use crate::error::{MirrorError, MirrorResult};
use crate::id_assigner::SnowflakeConfig;
use json_value_merge::Merge;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIRROR_ENV_KEY: &str = "MIRROR_ENV";
pub const DEFAULT_ENVIRONMENT: &str = "develop";

const ENV_STORE_PATH: &str = "MIRROR_STORE_PATH";
const ENV_SHARD_DIR: &str = "MIRROR_SHARD_DIR";
const ENV_WORKER_ID: &str = "MIRROR_WORKER_ID";
const ENV_SYNC_INTERVAL_MS: &str = "MIRROR_SYNC_INTERVAL_MS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mirror.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub shard_dir: PathBuf,
    // message shards are <prefix><n>.<extension>
    pub message_prefix: String,
    pub extension: String,
    pub contact_shard: String,
    pub open_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub max_cached_shards: u64,
    pub resolve_cache_size: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_dir: PathBuf::from("shards"),
            message_prefix: "msg_".to_string(),
            extension: "db".to_string(),
            contact_shard: "contact".to_string(),
            open_timeout_ms: 3000,
            idle_timeout_secs: 300,
            max_cached_shards: 64,
            resolve_cache_size: 10_000,
        }
    }
}

impl ShardConfig {
    pub fn shard_path(&self, shard_name: &str) -> PathBuf {
        self.shard_dir
            .join(format!("{}.{}", shard_name, self.extension))
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            batch_size: 500,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub store: StoreConfig,
    pub shards: ShardConfig,
    pub snowflake: SnowflakeConfig,
    pub sync: SyncConfig,
}

impl MirrorConfig {
    pub fn validate(&self) -> MirrorResult<()> {
        self.snowflake.validate()?;

        if self.sync.batch_size == 0 {
            return Err(MirrorError::InvalidConfig(
                "sync.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.sync.interval_ms == 0 {
            return Err(MirrorError::InvalidConfig(
                "sync.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.shards.message_prefix.is_empty() {
            return Err(MirrorError::InvalidConfig(
                "shards.message_prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    // Overrides are applied once here, nothing reads the environment later.
    fn apply_overrides(&mut self, overrides: &HashMap<String, String>) -> MirrorResult<()> {
        if let Some(path) = overrides.get(ENV_STORE_PATH) {
            self.store.path = PathBuf::from(path);
        }
        if let Some(dir) = overrides.get(ENV_SHARD_DIR) {
            self.shards.shard_dir = PathBuf::from(dir);
        }
        if let Some(worker_id) = overrides.get(ENV_WORKER_ID) {
            self.snowflake.worker_id = parse_override(ENV_WORKER_ID, worker_id)?;
        }
        if let Some(interval) = overrides.get(ENV_SYNC_INTERVAL_MS) {
            self.sync.interval_ms = parse_override(ENV_SYNC_INTERVAL_MS, interval)?;
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> MirrorResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        let msg = format!("invalid value for {}: {}", key, value);
        error!("{}", msg);
        MirrorError::ConfigError(msg)
    })
}

pub fn get_mirror_environment() -> String {
    let environment = std::env::var(MIRROR_ENV_KEY)
        .unwrap_or_default()
        .to_lowercase();
    if environment.is_empty() {
        DEFAULT_ENVIRONMENT.to_string()
    } else {
        environment
    }
}

/// Builds one `MirrorConfig` from layered TOML/JSON files.
///
/// Files are read in this order, later ones overriding earlier ones:
/// `app`, `app.<env>`, `<name>`, `<name>.<env>`. Each may be `.toml` or
/// `.json`; missing files are skipped.
pub struct ConfigLoader {
    config_dir: PathBuf,
    app_name: String,
    environment: String,
}

impl ConfigLoader {
    pub fn new(config_dir: &Path, app_name: &str, environment: &str) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            app_name: app_name.to_lowercase(),
            environment: environment.to_lowercase(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn is_debug(&self) -> bool {
        self.environment == DEFAULT_ENVIRONMENT
    }

    pub fn layer_names(&self) -> Vec<String> {
        vec![
            "app".to_string(),
            format!("app.{}", self.environment),
            self.app_name.clone(),
            format!("{}.{}", self.app_name, self.environment),
        ]
    }

    fn find_layer_file(&self, layer: &str) -> Option<PathBuf> {
        ["toml", "json"]
            .iter()
            .map(|ext| self.config_dir.join(format!("{}.{}", layer, ext)))
            .find(|path| path.exists())
    }

    pub fn load_merged_value(&self) -> MirrorResult<JsonValue> {
        let mut merged = JsonValue::Object(Default::default());
        for layer in self.layer_names() {
            let file = match self.find_layer_file(&layer) {
                Some(file) => file,
                None => {
                    debug!("config layer {} not found in {}", layer, self.config_dir.display());
                    continue;
                }
            };

            info!("loading config file: {}", file.display());
            let value = load_file(&file)?;
            merged.merge(&value);
        }

        Ok(merged)
    }

    pub fn load(&self, overrides: &HashMap<String, String>) -> MirrorResult<MirrorConfig> {
        let merged = self.load_merged_value()?;
        let mut config: MirrorConfig = serde_json::from_value(merged).map_err(|e| {
            let msg = format!("failed to parse config: {}", e);
            error!("{}", msg);
            MirrorError::ConfigError(msg)
        })?;

        config.apply_overrides(overrides)?;
        config.validate()?;

        Ok(config)
    }

    pub fn load_from_process_env(&self) -> MirrorResult<MirrorConfig> {
        let overrides: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("MIRROR_"))
            .collect();
        self.load(&overrides)
    }
}

fn load_file(file: &Path) -> MirrorResult<JsonValue> {
    let content = std::fs::read_to_string(file).map_err(|e| {
        let msg = format!("failed to read config file {}: {}", file.display(), e);
        error!("{}", msg);
        MirrorError::ConfigError(msg)
    })?;

    let is_json = file.extension().and_then(|s| s.to_str()) == Some("json");
    if is_json {
        return serde_json::from_str(&content).map_err(|e| {
            let msg = format!("failed to parse json config {}: {}", file.display(), e);
            error!("{}", msg);
            MirrorError::ConfigError(msg)
        });
    }

    let toml_value: toml::Value = toml::from_str(&content).map_err(|e| {
        let msg = format!("failed to parse toml config {}: {}", file.display(), e);
        error!("{}", msg);
        MirrorError::ConfigError(msg)
    })?;

    serde_json::to_value(toml_value).map_err(|e| {
        let msg = format!("failed to convert toml config {}: {}", file.display(), e);
        error!("{}", msg);
        MirrorError::ConfigError(msg)
    })
}
