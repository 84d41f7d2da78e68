//! 外部协作方的契约：torrent 传输层与 torrent 描述文件工厂。
//!
//! 真正的 BitTorrent 协议（peer wire / tracker announce）不在本 crate 内，
//! 这里只定义 reconciler 需要的最小接口，并提供进程内实现。

pub mod descriptor;
pub mod local;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use descriptor::{DescriptorFactory, TorrentDescriptor};
pub use local::LocalTransport;

/// 传输层：持有"当前正在做种的 torrent 集合"，是做种状态的唯一真相。
pub trait TorrentTransport: Send + Sync {
    fn start(&self, bind_addresses: &[SocketAddr]) -> Result<()>;

    /// 停止并释放所有注册
    fn stop(&self);

    fn is_started(&self) -> bool;

    /// 注册失败（未启动 / 描述文件无效 / 容量已满）返回 false，不抛错。
    fn seed(&self, torrent_file: &Path, source_file: &Path) -> bool;

    fn unseed(&self, torrent_file: &Path);

    fn is_seeding(&self, torrent_file: &Path) -> bool;

    fn active_count(&self) -> usize;

    fn seeded_torrents(&self) -> Vec<PathBuf>;
}

/// 描述文件工厂：为源文件生成（或复用已有的）torrent 描述文件。
pub trait TorrentFileFactory: Send + Sync {
    /// 源文件不是普通文件时返回 `Ok(None)`
    fn create_torrent_file(&self, source: &Path, dest_dir: &Path) -> anyhow::Result<Option<PathBuf>>;

    /// 已有描述文件是否仍对应该源文件
    fn is_valid_torrent_file(&self, torrent: &Path, _source: &Path) -> bool {
        torrent.is_file()
    }
}
