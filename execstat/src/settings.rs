use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use log::debug;
use serde::Deserialize;

use crate::source::{BpftoolSource, MapSource, PinnedMapSource};

const CONFIG_FILE: &str = "execstat";
const ENV_PREFIX: &str = "EXECSTAT";

pub const DEFAULT_MAP_PATH: &str = "/sys/fs/bpf/execve_counts";
const DEFAULT_INTERVAL_SECONDS: u64 = 10;
const DEFAULT_BPFTOOL: &str = "bpftool";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:2112";
const DEFAULT_METRICS_PATH: &str = "/metrics";

/// How the monitor reads the map each cycle.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Open the bpffs pin directly.
    #[default]
    Pinned,
    /// Parse `bpftool -j map dump pinned <path>`.
    Bpftool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct MonitorSettings {
    pub map_path: Option<String>,
    pub interval_secs: Option<u64>,
    pub source: Option<SourceKind>,
    pub bpftool: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct MetricsSettings {
    pub listen_addr: Option<String>,
    pub path: Option<String>,
}

/// Monitor configuration.
///
/// Read from an optional `execstat.{yaml,toml,json}` in the working directory, then from
/// `EXECSTAT_`-prefixed environment variables with `__` between sections, e.g.
/// `EXECSTAT_MONITOR__INTERVAL_SECS=30`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn map_path(&self) -> PathBuf {
        PathBuf::from(
            self.monitor
                .map_path
                .as_deref()
                .unwrap_or(DEFAULT_MAP_PATH),
        )
    }

    /// Sampling interval, at least one second.
    pub fn interval(&self) -> Duration {
        let secs = self
            .monitor
            .interval_secs
            .unwrap_or(DEFAULT_INTERVAL_SECONDS)
            .max(1);
        Duration::from_secs(secs)
    }

    pub fn source_kind(&self) -> SourceKind {
        self.monitor.source.unwrap_or_default()
    }

    pub fn bpftool(&self) -> &str {
        self.monitor.bpftool.as_deref().unwrap_or(DEFAULT_BPFTOOL)
    }

    pub fn listen_addr(&self) -> &str {
        self.metrics
            .listen_addr
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDR)
    }

    /// HTTP path of the scrape endpoint, always starting with `/`.
    pub fn metrics_path(&self) -> String {
        let path = self.metrics.path.as_deref().unwrap_or(DEFAULT_METRICS_PATH);
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        }
    }

    pub fn build_source(&self) -> Box<dyn MapSource + Send> {
        match self.source_kind() {
            SourceKind::Pinned => Box::new(PinnedMapSource::new(self.map_path())),
            SourceKind::Bpftool => Box::new(BpftoolSource::new(self.bpftool(), self.map_path())),
        }
    }
}
