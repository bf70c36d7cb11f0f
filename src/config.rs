//! Load and validate runtime configuration.

use anyhow::{bail, Context};
use chrono::NaiveTime;
use directories::ProjectDirs;
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct BackendCfg {
    pub http_url: String, // e.g. "http://localhost:8080"
    pub ws_url: String,   // e.g. "ws://localhost:8080"
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionCfg {
    pub default_ticker: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshCfg {
    pub fast_interval_sec: u64, // capital flow
    pub slow_interval_sec: u64, // correlation
    /// Local wall-clock time of the market-open stat refresh, "HH:MM:SS".
    pub market_open: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateCfg {
    /// Open-position cache file. Defaults to the platform data dir.
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ViewCfg {
    pub plot_len: f64,
    pub scale: f64,
    pub render_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamsCfg {
    pub teardown_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub backend: BackendCfg,
    pub session: SessionCfg,
    pub refresh: RefreshCfg,
    #[serde(default)]
    pub state: StateCfg,
    pub view: ViewCfg,
    pub streams: StreamsCfg,
}

fn default_timeout_sec() -> u64 {
    10
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Self = serde_yaml::from_str(&s).context("parse config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.refresh.fast_interval_sec == 0 || self.refresh.slow_interval_sec == 0 {
            bail!("refresh intervals must be positive");
        }
        self.market_open()?;
        if self.view.plot_len <= 180.0 {
            bail!("view.plot_len must exceed 180");
        }
        if self.session.default_ticker.trim().is_empty() {
            bail!("session.default_ticker is empty");
        }
        Ok(())
    }

    pub fn market_open(&self) -> anyhow::Result<NaiveTime> {
        NaiveTime::parse_from_str(self.refresh.market_open.trim(), "%H:%M:%S")
            .with_context(|| format!("bad refresh.market_open `{}`", self.refresh.market_open))
    }

    /// Configured cache path, else `<data dir>/open_positions.json`.
    pub fn state_path(&self) -> PathBuf {
        if let Some(p) = &self.state.path {
            return PathBuf::from(p);
        }
        ProjectDirs::from("", "", "trade-board")
            .map(|d| d.data_dir().join("open_positions.json"))
            .unwrap_or_else(|| PathBuf::from("data/open_positions.json"))
    }
}
