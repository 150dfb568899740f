use anyhow::{Context, Result};
use clap::{Arg, Command};
use log::*;
use mirror_lib::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

fn build_command() -> Command {
    Command::new(SERVICE_NAME)
        .about("Mirrors per-conversation message shards into one canonical store")
        .arg(
            Arg::new("config-dir")
                .long("config-dir")
                .value_name("DIR")
                .default_value("./etc")
                .help("Directory holding app.toml and friends"),
        )
        .arg(
            Arg::new("pod-id")
                .long("pod-id")
                .value_name("ID")
                .value_parser(clap::value_parser!(u64))
                .help("Worker id of this instance, must be unique per deployment"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .default_value("./logs"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_command().get_matches();
    let config_dir = PathBuf::from(
        matches
            .get_one::<String>("config-dir")
            .context("config-dir is required")?,
    );
    let log_dir = PathBuf::from(
        matches
            .get_one::<String>("log-dir")
            .context("log-dir is required")?,
    );

    let loader = ConfigLoader::new(&config_dir, SERVICE_NAME, &get_mirror_environment());
    init_logging(&log_dir, SERVICE_NAME, loader.is_debug())?;

    info!("environment: {}", loader.environment());
    info!("config dir: {}", config_dir.display());

    let mut config = loader.load_from_process_env()?;
    if let Some(pod_id) = matches.get_one::<u64>("pod-id") {
        config.snowflake.worker_id = *pod_id;
        config.validate()?;
    }

    let locator = Arc::new(ShardLocator::new(config.shards.clone()));
    let store = Arc::new(
        CanonicalStore::open(&config.store.path).context("failed to open canonical store")?,
    );
    let assigner = Arc::new(IdAssigner::new(config.snowflake.clone())?);
    let scheduler = Arc::new(SyncScheduler::new(
        config.sync.clone(),
        locator.clone(),
        store.clone(),
        assigner,
    ));

    // handed to the HTTP layer, which lives outside this service
    let _entity_service = EntityService::new(locator.clone(), store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(scheduler.clone().run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = runner.await {
        error!("sync scheduler task failed: {}", e);
    }
    locator.close_all();

    info!("{} exiting.", SERVICE_NAME);
    Ok(())
}
