//! Terminal logging for nodes and test runs.
use std::io::{self, Write};

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR".red().bold(),
            Level::Warn => "WARN ".yellow().bold(),
            Level::Info => "INFO ".green(),
            Level::Debug => "DEBUG".dimmed(),
            Level::Trace => "TRACE".white().dimmed(),
        };
        writeln!(
            io::stderr(),
            "{} {level} {} {}",
            Local::now()
                .format("%H:%M:%S%.3f")
                .to_string()
                .dimmed(),
            format!("[{}]", record.target()).blue(),
            record.args()
        )
        .ok();
    }

    fn flush(&self) {}
}

/// Initialize logging for a node process or test run. The level is read
/// from the `RUST_LOG` environment variable, with `fallback` used when it
/// is unset or unparseable. Logs go to standard error.
pub fn init(fallback: Level) -> Result<(), SetLoggerError> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback);

    log::set_boxed_logger(Box::new(Logger { level }))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}
