//! Configuration shared by the three binaries.
//!
//! Layered the way the rest of the pack layers config: built-in
//! defaults, optionally overridden by a TOML file, optionally overridden
//! again by environment variables, with CLI flags (parsed by each
//! binary) taking final precedence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_store_path() -> PathBuf {
    PathBuf::from("/hacksm_store")
}

fn default_wait_time_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory of the flat store (§4.5).
    pub store_path: PathBuf,

    /// Migrator quiescence-gap duration, and whether it runs at all
    /// (§4.2 step 8/12, kept configurable per the open question in the
    /// design notes about whether the race it works around applies to
    /// the target filesystem).
    pub wait_time_ms: u64,
    pub quiescence_gap_enabled: bool,

    /// Daemon: poll for events instead of blocking (`-N`).
    pub non_blocking: bool,
    /// Daemon: fork a child per event (`-F`).
    pub fork_per_event: bool,
    /// Daemon: ceiling (seconds) for the randomized recall delay (`-R`),
    /// used only by tests to shake out races; 0 disables it.
    pub recall_delay_ceiling_secs: u64,
    /// Daemon: debug verbosity level (`-d`), separate from RUST_LOG so
    /// the existing hacksmd invocation style keeps working.
    pub debug_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store_path: default_store_path(),
            wait_time_ms: default_wait_time_ms(),
            quiescence_gap_enabled: true,
            non_blocking: false,
            fork_per_event: false,
            recall_delay_ceiling_secs: 0,
            debug_level: 0,
        }
    }
}

impl Config {
    /// Load defaults, then merge a TOML file if it exists, then merge
    /// environment overrides (`HACKSM_STORE_PATH`, `HACKSM_WAIT_TIME_MS`).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = Config::default();

        if let Some(path) = path {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                cfg = toml::from_str(&text)?;
            }
        }

        if let Ok(v) = std::env::var("HACKSM_STORE_PATH") {
            cfg.store_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HACKSM_WAIT_TIME_MS") {
            cfg.wait_time_ms = v.parse()?;
        }

        Ok(cfg)
    }
}
