use crate::config::LoggingConfig;
use crate::constants::{CONFIG_DIR_NAME, LOG_BUFFER_CAPACITY, LOG_FILE_NAME, LOG_TIMESTAMP_FORMAT};
use anyhow::{Context, Result};
use chrono::Local;
use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

static INSTALLED: OnceCell<Logger> = OnceCell::new();

/// In-memory log buffer shared across the application
#[derive(Clone)]
pub struct Logger {
    logs: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Logger {
    pub fn new() -> Self {
        Self::with_capacity(LOG_BUFFER_CAPACITY)
    }

    /// Keep at most `capacity` entries, dropping the oldest first
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            logs: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Add a log entry
    pub fn log(&self, message: String) {
        let timestamp = Local::now().format(LOG_TIMESTAMP_FORMAT).to_string();
        let formatted_message = format!("[{}] {}", timestamp, message);

        if let Ok(mut logs) = self.logs.lock() {
            if logs.len() == self.capacity {
                logs.pop_front();
            }
            logs.push_back(formatted_message);
        }
    }

    /// Get all logs, newest first
    pub fn get_logs(&self) -> Vec<String> {
        if let Ok(logs) = self.logs.lock() {
            logs.iter().rev().cloned().collect()
        } else {
            Vec::new()
        }
    }

    /// Clear all logs
    pub fn clear(&self) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.logs.lock().map(|logs| logs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Default log file location
    pub fn get_log_file_path() -> Result<PathBuf> {
        dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine cache directory"))
            .map(|dir| dir.join(CONFIG_DIR_NAME).join(LOG_FILE_NAME))
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the process-wide `log` backend.
///
/// Records at or above the configured level always go to the returned
/// in-memory [`Logger`]; with `enabled` they are also appended to the log
/// file. Later calls return the logger installed by the first one.
pub fn init(config: &LoggingConfig) -> Result<Logger> {
    INSTALLED.get_or_try_init(|| install(config)).cloned()
}

fn install(config: &LoggingConfig) -> Result<Logger> {
    let logger = Logger::new();
    let memory = logger.clone();

    let mut dispatch = fern::Dispatch::new()
        .level(config.level_filter()?)
        .chain(fern::Output::call(move |record| {
            memory.log(format!("{} {}: {}", record.level(), record.target(), record.args()));
        }));

    if config.enabled {
        let path = match &config.file {
            Some(path) => path.clone(),
            None => Logger::get_log_file_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let file = fern::log_file(&path).with_context(|| format!("Failed to open log file: {}", path.display()))?;

        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "[{}] {} {}: {}",
                        Local::now().format(LOG_TIMESTAMP_FORMAT),
                        record.level(),
                        record.target(),
                        message
                    ))
                })
                .chain(file),
        );
    }

    dispatch.apply().context("Failed to install logger")?;
    Ok(logger)
}
