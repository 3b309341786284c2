use std::fs::{File, OpenOptions};
use std::io::Write;
use parking_lot::Mutex;
use std::time::SystemTime;

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> LogLevel {
        match s.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

struct LogFile {
    file: Mutex<File>,
    level: LogLevel,
}

impl LogFile {
    fn new(path: &str, level: LogLevel) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(LogFile {
            file: Mutex::new(file),
            level,
        })
    }

    fn write(&self, level: LogLevel, message: &str) {
        if level < self.level {
            return;
        }

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let log_line = format!("[{}] [{}] {}\n", timestamp, level_str(level), message);

        let mut file = self.file.lock();
        let _ = file.write_all(log_line.as_bytes());
    }
}

pub struct Logger {
    file: Option<LogFile>,
    console: bool,
    level: LogLevel,
}

impl Logger {
    pub fn from_config(config: &LoggingConfig) -> Result<Self, std::io::Error> {
        let level = LogLevel::parse(&config.level);
        let file = if config.file_enabled {
            Some(LogFile::new(&config.file_path, level)?)
        } else {
            None
        };

        Ok(Logger {
            file,
            console: config.console_enabled,
            level,
        })
    }

    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    fn log(&self, level: LogLevel, message: &str) {
        if level < self.level {
            return;
        }

        if let Some(ref file) = self.file {
            file.write(level, message);
        }

        if self.console {
            println!("[skyfeed] [{}] {}", level_str(level), message);
        }
    }
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "TRACE",
        LogLevel::Debug => "DEBUG",
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
    }
}
