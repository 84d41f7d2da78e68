//! 配置（TOML），所有字段都有默认值，缺失的配置文件等价于空文件。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const INDEX_FILE_NAME: &str = "torrents.db";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatcherKind {
    #[default]
    Polling,
    Notify,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeederConfig {
    /// pointer 文件镜像目录（存储根）
    pub storage_dir: PathBuf,
    /// 默认 `<storage_dir>/torrents.db`
    pub index_file: Option<PathBuf>,
    /// 0 表示不限
    pub max_torrents_to_seed: usize,
    pub file_size_threshold_bytes: u64,
    pub scan_interval_secs: u64,
    pub check_torrents_interval_secs: u64,
    pub flush_db_interval_secs: u64,
    pub worker_pool_size: usize,
    pub piece_hashing_pool_size: usize,
    pub piece_length: u64,
    pub announce_url: Option<String>,
    pub bind_addresses: Vec<SocketAddr>,
    pub watcher: WatcherKind,
    pub watcher_channel_size: usize,
    pub remove_expired_torrent_files: bool,
    pub log_level: String,
    pub report_interval_secs: u64,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            index_file: None,
            max_torrents_to_seed: 2000,
            file_size_threshold_bytes: 10 * 1024 * 1024,
            scan_interval_secs: 30,
            check_torrents_interval_secs: 300,
            flush_db_interval_secs: 180,
            worker_pool_size: 10,
            piece_hashing_pool_size: 4,
            piece_length: 1024 * 1024,
            announce_url: None,
            bind_addresses: Vec::new(),
            watcher: WatcherKind::Polling,
            watcher_channel_size: 4096,
            remove_expired_torrent_files: true,
            log_level: "info".to_string(),
            report_interval_secs: 300,
        }
    }
}

impl SeederConfig {
    /// `path` 为 None 时读取默认位置；文件不存在时使用默认配置
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("read config {:?}", path)),
        };
        Self::from_toml(&text).with_context(|| format!("parse config {:?}", path))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn index_file(&self) -> PathBuf {
        self.index_file
            .clone()
            .unwrap_or_else(|| self.storage_dir.join(INDEX_FILE_NAME))
    }

    /// directory reconciler 使用；0 → 不限
    pub fn seed_limit(&self) -> usize {
        match self.max_torrents_to_seed {
            0 => usize::MAX,
            n => n,
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_torrents_interval_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_db_interval_secs.max(1))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("artifact-seeder").join(CONFIG_FILE_NAME))
}

fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("artifact-seeder").join("torrents"))
        .unwrap_or_else(|| PathBuf::from("torrents"))
}
