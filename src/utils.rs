use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

// Terminal helpers for the hublink binary: file logging and line input

pub struct SimpleLogger {
    log_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&Path>) -> Result<Self> {
        let log_file = match log_file_path {
            Some(path) => Some(Mutex::new(OpenOptions::new().create(true).append(true).open(path)?)),
            None => None,
        };

        Ok(SimpleLogger { log_file })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now: DateTime<Local> = Local::now();
        let log_message = format!(
            "[{}] {} [{}:{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );

        match &self.log_file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(log_message.as_bytes());
                }
            }
            // Only print to stderr if no log file is specified
            None => eprint!("{}", log_message),
        }
    }

    fn flush(&self) {
        match &self.log_file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.flush();
                }
            }
            None => {
                let _ = std::io::stderr().flush();
            }
        }
    }
}

/// Read a line of input from stdin, trimming whitespace. `None` at end of input.
pub fn read_line() -> Result<Option<String>> {
    let mut input = String::new();
    if std::io::stdin().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim().to_string()))
}

pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Ok(())
}
