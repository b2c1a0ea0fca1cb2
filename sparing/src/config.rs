// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of a storage processor

use crate::log::LogConfig;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use slog_error_chain::SlogInlineError;
use sparing_protocol::{CopyConfig, NodeId, NodeRole};
use std::time::Duration;
use thiserror::Error;

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    pub node_id: NodeId,
    pub peer_id: NodeId,
    pub role: NodeRole,

    /// How often timers are checked
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    pub log: LogConfig,

    /// Every path the checkpoint ledger is written to
    pub checkpoint_ledger_paths: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub copy: CopyConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum LoadError {
    #[error("error reading \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\"")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log::LogLevel;
    use assert_matches::assert_matches;

    #[test]
    fn sample_config_parses() {
        let path = Utf8Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("configs/sparing.toml");
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.node_id, NodeId(0));
        assert_eq!(config.peer_id, NodeId(1));
        assert_eq!(config.role, NodeRole::Active);
        assert_eq!(config.tick_interval, Duration::from_millis(500));
        assert_eq!(config.log, LogConfig::Terminal { level: LogLevel::Info });
        assert_eq!(config.checkpoint_ledger_paths.len(), 2);
        assert_eq!(config.copy.source_return_timeout, Duration::from_secs(300));
        assert_eq!(config.copy.spare_retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn copy_section_is_optional() {
        let config: Config = toml::from_str(
            r#"
            node_id = 1
            peer_id = 0
            role = "passive"
            tick_interval = 1000
            checkpoint_ledger_paths = ["/var/sparing/checkpoints.json"]

            [log]
            mode = "file"
            level = "debug"
            path = "/var/log/sparing.log"
            "#,
        )
        .unwrap();
        assert_eq!(config.copy, CopyConfig::default());
        assert_eq!(config.role, NodeRole::Passive);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::from_file(Utf8Path::new("/nonexistent/sparing.toml"))
            .unwrap_err();
        assert_matches!(err, LoadError::Io { .. }, "{err}");
    }
}
