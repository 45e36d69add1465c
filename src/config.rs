//! Ambient adapter-wide configuration.
//!
//! Resolved in order of decreasing priority:
//!
//! 1. **Environment variables** — `GODLV_BRIDGE_LOG` (log file path
//!    override), `GODLV_BRIDGE_LOG_LEVEL` (default `info`), plus the
//!    ambient `GOROOT`/`GOPATH`/`PATH` the path mapper and launcher
//!    consult.
//! 2. **Built-in defaults** — log to a temp-dir file at `info` level,
//!    no fixed backend path (the launcher locates `dlv` on `PATH`).
//!
//! Per-session values (mode, apiVersion, load-config, ...) come from
//! the DAP `launch`/`attach` request body itself, not from here — this
//! module only covers what's true for the whole adapter process.

use std::path::PathBuf;

const ENV_LOG_PATH: &str = "GODLV_BRIDGE_LOG";
const ENV_LOG_LEVEL: &str = "GODLV_BRIDGE_LOG_LEVEL";

const DEFAULT_LOG_LEVEL: &str = "info";

/// Process-wide configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Where to write the adapter's own log file. `None` means stderr
    /// (used when stdout is reserved for DAP frames but the process
    /// isn't detached from a terminal).
    pub log_path: Option<PathBuf>,
    pub log_level: String,
    pub goroot: Option<String>,
    pub gopath: Vec<String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            goroot: None,
            gopath: Vec::new(),
        }
    }
}

impl AdapterConfig {
    /// Loads configuration by merging environment variables over
    /// built-in defaults.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(val) = std::env::var(ENV_LOG_PATH) {
            cfg.log_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var(ENV_LOG_LEVEL) {
            cfg.log_level = val;
        }
        if let Ok(val) = std::env::var("GOROOT") {
            cfg.goroot = Some(val);
        }
        if let Ok(val) = std::env::var("GOPATH") {
            cfg.gopath = split_path_list(&val);
        }

        cfg
    }
}

#[cfg(unix)]
fn path_list_separator() -> char {
    ':'
}

#[cfg(not(unix))]
fn path_list_separator() -> char {
    ';'
}

fn split_path_list(val: &str) -> Vec<String> {
    val.split(path_list_separator())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_log_path() -> Option<PathBuf> {
    Some(std::env::temp_dir().join("godlv-bridge.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_info_level_and_a_log_path() {
        let cfg = AdapterConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.log_path.is_some());
        assert!(cfg.gopath.is_empty());
    }

    #[test]
    fn splits_multi_entry_gopath() {
        let sep = path_list_separator();
        let joined = format!("/home/u/go{sep}/opt/go");
        let parsed = split_path_list(&joined);
        assert_eq!(parsed, vec!["/home/u/go".to_string(), "/opt/go".to_string()]);
    }

    #[test]
    fn empty_gopath_entry_parses_to_empty_vec() {
        assert!(split_path_list("").is_empty());
    }
}
