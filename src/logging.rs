//! Logging infrastructure for mcplink
//!
//! Two layers: a global best-effort file logger (~/.mcplink/logs/, date-based
//! files) and the per-server diagnostic sink type threaded through channels
//! and supervisors for wire traffic, stderr, and lifecycle lines.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Line-oriented diagnostic callback. Purely observational; the runtime
/// never depends on a sink being present.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    file: File,
}

impl Logger {
    fn new() -> Option<Self> {
        let log_dir = dirs::home_dir()?.join(".mcplink").join("logs");
        fs::create_dir_all(&log_dir).ok()?;

        // Use date-based log file
        let date = Local::now().format("%Y-%m-%d");
        let path = log_dir.join(format!("mcplink-{}.log", date));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()?;

        Some(Self { file })
    }

    fn write(&mut self, level: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("[{}] [{}] {}\n", timestamp, level, message);
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.flush();
    }
}

/// Initialize the logger (call once at startup)
pub fn init() {
    if let Ok(mut guard) = LOGGER.lock() {
        if guard.is_none() {
            *guard = Logger::new();
        }
    }
}

/// Log an info message
pub fn info(message: &str) {
    if let Ok(mut guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_mut() {
            logger.write("INFO", message);
        }
    }
}

/// Log a warning message
pub fn warn(message: &str) {
    if let Ok(mut guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_mut() {
            logger.write("WARN", message);
        }
    }
}

/// Log an error message
pub fn error(message: &str) {
    if let Ok(mut guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_mut() {
            logger.write("ERROR", message);
        }
    }
}

/// Log a debug message (only if MCPLINK_TRACE is set)
pub fn debug(message: &str) {
    if std::env::var("MCPLINK_TRACE").is_ok() {
        if let Ok(mut guard) = LOGGER.lock() {
            if let Some(logger) = guard.as_mut() {
                logger.write("DEBUG", message);
            }
        }
    }
}

/// Get path to today's log file
pub fn log_path() -> Option<PathBuf> {
    let log_dir = dirs::home_dir()?.join(".mcplink").join("logs");
    let date = Local::now().format("%Y-%m-%d");
    Some(log_dir.join(format!("mcplink-{}.log", date)))
}
