//! Load agent config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::connection::ControllerConfig;
use emage_core::wire::DEFAULT_MAX_FRAME_LEN;

/// Agent configuration. File: ~/.config/emage/agent.toml or /etc/emage/agent.toml.
/// Env overrides: EMAGE_CTRL_ADDR, EMAGE_CTRL_PORT, EMAGE_RECONNECT_INITIAL_MS,
/// EMAGE_RECONNECT_MAX_MS, EMAGE_REPORT_BUFFER.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Controller host (default 127.0.0.1).
    #[serde(default = "default_controller_addr")]
    pub controller_addr: String,
    /// Controller TCP port (default 2210).
    #[serde(default = "default_controller_port")]
    pub controller_port: u16,
    /// First reconnect delay in milliseconds (default 500).
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds (default 30000).
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Reports buffered per agent while disconnected (default 32).
    #[serde(default = "default_report_buffer")]
    pub report_buffer: usize,
    /// Largest inbound envelope accepted, in bytes (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
}

fn default_controller_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_controller_port() -> u16 {
    2210
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_report_buffer() -> usize {
    32
}
fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_addr: default_controller_addr(),
            controller_port: default_controller_port(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            report_buffer: default_report_buffer(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl Config {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            addr: format!("{}:{}", self.controller_addr, self.controller_port),
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            report_buffer: self.report_buffer,
            max_frame_len: self.max_frame_len,
        }
    }

    fn apply_env(&mut self) {
        if let Ok(s) = std::env::var("EMAGE_CTRL_ADDR") {
            if !s.is_empty() {
                self.controller_addr = s;
            }
        }
        override_parsed("EMAGE_CTRL_PORT", &mut self.controller_port);
        override_parsed("EMAGE_RECONNECT_INITIAL_MS", &mut self.reconnect_initial_ms);
        override_parsed("EMAGE_RECONNECT_MAX_MS", &mut self.reconnect_max_ms);
        override_parsed("EMAGE_REPORT_BUFFER", &mut self.report_buffer);
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(s) = std::env::var(var) {
        match s.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var, value = %s, "ignoring unparsable environment override"),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env();
    c
}

/// Like [`load`], but reads `path` instead of searching the default locations.
pub fn load_from(path: &Path) -> Config {
    let mut c = parse_file(path).unwrap_or_default();
    c.apply_env();
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/emage/agent.toml"));
    }
    out.push(PathBuf::from("/etc/emage/agent.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    parse_file(&path)
}

fn parse_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}
