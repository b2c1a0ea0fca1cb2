// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use slog::{Drain, Logger, o};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Trace => slog::Level::Trace,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warn => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
        }
    }
}

/// Where a storage processor sends its log
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LogConfig {
    Terminal { level: LogLevel },
    File { level: LogLevel, path: Utf8PathBuf },
}

impl LogConfig {
    pub fn to_logger(&self, name: &str) -> Result<Logger, std::io::Error> {
        let log = match self {
            LogConfig::Terminal { level } => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain = slog_term::FullFormat::new(decorator).build().fuse();
                let drain = slog::LevelFilter(drain, (*level).into()).fuse();
                let drain = slog_async::Async::new(drain).build().fuse();
                Logger::root(drain, o!("name" => name.to_string()))
            }
            LogConfig::File { level, path } => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                let decorator = slog_term::PlainDecorator::new(file);
                let drain = slog_term::FullFormat::new(decorator).build().fuse();
                let drain = slog::LevelFilter(drain, (*level).into()).fuse();
                let drain = slog_async::Async::new(drain).build().fuse();
                Logger::root(drain, o!("name" => name.to_string()))
            }
        };
        Ok(log)
    }
}
