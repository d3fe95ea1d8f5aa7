use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::Deserialize;

use digitrain_core::error::{TrainError, TrainResult};

const CONSOLE_PATTERN: &str = "{d(%H:%M:%S%.3f)} [{T}] {h({l}):5.5} {t} - {m}{n}";
const FILE_PATTERN: &str = "{d(%Y.%m.%d %H:%M:%S)} | {({l}):5.5} | {({f}:{L}):>40.40} — {m}{n}";

#[derive(Deserialize, Debug, Clone)]
pub struct LogSettings {
    pub log_level: String,
    pub log_path: Option<String>,
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
    #[serde(default)]
    pub log_overwrite: bool,
}

fn default_log_file_name() -> String {
    "digitrain.log".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_path: None,
            log_file_name: default_log_file_name(),
            log_overwrite: false,
        }
    }
}

pub fn setup_logging(log_level: &str, log_file_path: Option<PathBuf>) -> TrainResult<Config> {
    let log_level = get_logging_level(log_level);
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();

    let mut config =
        Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");

    if let Some(log_file_path) = log_file_path {
        let log_file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
            .build(&log_file_path)
            .map_err(|e| {
                TrainError::config(format!(
                    "unable to open log file {}: {}",
                    log_file_path.display(),
                    e
                ))
            })?;
        config = config.appender(Appender::builder().build("file", Box::new(log_file)));
        root = root.appender("file");
    }

    config
        .build(root.build(log_level))
        .map_err(|e| TrainError::config(format!("invalid logger configuration: {}", e)))
}

pub fn get_logging_level(log_level: &str) -> LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Resolves the file the run should log to. An existing file is either removed or left in
/// place, in which case the new log gets a timestamped name next to it.
pub fn resolve_log_file(
    base_path: &Path,
    log_settings: &LogSettings,
) -> TrainResult<Option<PathBuf>> {
    let log_path = match &log_settings.log_path {
        Some(path) => base_path.join(path).join("logs"),
        None => return Ok(None),
    };

    if !log_path.exists() {
        fs::create_dir_all(&log_path).map_err(|e| {
            TrainError::config(format!("unable to create {}: {}", log_path.display(), e))
        })?;
    }

    let log_file_path = log_path.join(&log_settings.log_file_name);
    if !log_file_path.exists() {
        return Ok(Some(log_file_path));
    }
    if log_settings.log_overwrite {
        fs::remove_file(&log_file_path).map_err(|e| {
            TrainError::config(format!("unable to clear {}: {}", log_file_path.display(), e))
        })?;
        return Ok(Some(log_file_path));
    }

    let stem = Path::new(&log_settings.log_file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("digitrain");
    let timestamp = Utc::now().format("_%d%m%Y_%H%M%S").to_string();
    Ok(Some(log_path.join(format!("{}{}.log", stem, timestamp))))
}

pub fn initiate_logger(base_path: &Path, log_settings: &LogSettings) -> TrainResult<()> {
    let log_file_path = resolve_log_file(base_path, log_settings)?;
    let logger_config = setup_logging(&log_settings.log_level, log_file_path)?;
    log4rs::init_config(logger_config)
        .map(|_| ())
        .map_err(|e| TrainError::config(format!("logger already initialised: {}", e)))
}
