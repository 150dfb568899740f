use crate::error::{MirrorError, MirrorResult};
use simplelog::*;
use std::fs::File;
use std::path::Path;
use time::macros::format_description;

pub const MIRROR_LOG_ENV_KEY: &str = "MIRROR_LOG";

// Level comes from MIRROR_LOG, default info. The file always gets info and up.
pub fn init_logging(log_dir: &Path, service_name: &str, console_only: bool) -> MirrorResult<()> {
    let log_level = std::env::var(MIRROR_LOG_ENV_KEY).unwrap_or_else(|_| "info".to_string());
    let log_level = log_level.parse().unwrap_or(LevelFilter::Info);

    let config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        log_level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if !console_only {
        std::fs::create_dir_all(log_dir)?;
        let log_file = log_dir.join(format!("{}.log", service_name));
        loggers.push(WriteLogger::new(
            LevelFilter::Info,
            config,
            File::create(log_file)?,
        ));
    }

    CombinedLogger::init(loggers)
        .map_err(|e| MirrorError::Internal(format!("failed to init logger: {}", e)))
}
