//! Leveled logging to the console and an optional flushed log file.
//!
//! The run of a memory diagnostic is usually the last thing a machine does
//! before being reprovisioned, so every line is flushed to disk as it is
//! written. Timestamps are seconds since logger init: wall-clock time is
//! meaningless on a box whose RTC may itself be suspect.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn color_code(&self) -> &'static str {
        match self {
            LogLevel::Debug => "\x1b[37m",
            LogLevel::Info => "\x1b[36m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Error => "\x1b[31m",
        }
    }
}

pub struct Logger {
    file: Option<Mutex<File>>,
    min_level: LogLevel,
    started: Instant,
}

impl Logger {
    pub fn new(log_file_path: Option<&str>) -> io::Result<Self> {
        let file = match log_file_path {
            Some(path) => {
                if let Some(parent) = Path::new(path).parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Logger {
            file,
            min_level: LogLevel::Debug,
            started: Instant::now(),
        })
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level < self.min_level {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let level_str = level.as_str();

        if level > LogLevel::Debug {
            let color = level.color_code();
            println!("{color}[{elapsed:10.3}s] {level_str}: {message}\x1b[0m");
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "[{elapsed:10.3}s] {level_str}: {message}");
                let _ = file.flush();
            }
        }
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

    pub fn log_fmt(&self, level: LogLevel, args: std::fmt::Arguments) {
        self.log(level, &format!("{}", args));
    }
}

static GLOBAL_LOGGER: OnceLock<Logger> = OnceLock::new();

/// Installs the global logger. Falls back to a console-only logger when the
/// log file cannot be created.
pub fn init_logger(log_file_path: Option<&str>) -> io::Result<()> {
    let logger = Logger::new(log_file_path).or_else(|_| Logger::new(None))?;
    GLOBAL_LOGGER
        .set(logger)
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "logger already initialized"))
}

pub fn get_logger() -> Option<&'static Logger> {
    GLOBAL_LOGGER.get()
}

macro_rules! generate_global_log_fn {
    ($fn_name:ident, $method:ident, $level:literal) => {
        #[allow(dead_code)]
        pub fn $fn_name(message: &str) {
            if let Some(logger) = get_logger() {
                logger.$method(message);
            } else {
                eprintln!("{}: {}", $level, message);
            }
        }
    };
}

generate_global_log_fn!(log_debug, debug, "DEBUG");
generate_global_log_fn!(log_info, info, "INFO");
generate_global_log_fn!(log_warn, warn, "WARN");
generate_global_log_fn!(log_error, error, "ERROR");

#[macro_export]
macro_rules! log_debug_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.log_fmt($crate::logger::LogLevel::Debug, format_args!($($arg)*));
        } else {
            eprintln!("DEBUG: {}", format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_info_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.log_fmt($crate::logger::LogLevel::Info, format_args!($($arg)*));
        } else {
            println!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.log_fmt($crate::logger::LogLevel::Warn, format_args!($($arg)*));
        } else {
            eprintln!("WARN: {}", format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_error_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.log_fmt($crate::logger::LogLevel::Error, format_args!($($arg)*));
        } else {
            eprintln!("ERROR: {}", format!($($arg)*));
        }
    };
}
