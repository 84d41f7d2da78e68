use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Result, SeedError};
use crate::transport::descriptor::{hash_pieces, TorrentDescriptor};
use crate::transport::TorrentTransport;

#[derive(Clone, Debug)]
pub struct SeedEntry {
    pub source_file: PathBuf,
    pub descriptor: TorrentDescriptor,
    pub since: SystemTime,
}

/// 进程内做种注册表。
///
/// 不做网络 I/O：只维护 torrent → 源文件 的注册关系，并在注册前校验描述文件。
/// 可选的 worker 池用于重新计算 piece 哈希（等价于 BitTorrent 客户端的 recheck）。
pub struct LocalTransport {
    started: AtomicBool,
    bind: Mutex<Vec<SocketAddr>>,
    seeding: DashMap<PathBuf, SeedEntry>,
    validator: Option<Arc<rayon::ThreadPool>>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            bind: Mutex::new(Vec::new()),
            seeding: DashMap::new(),
            validator: None,
        }
    }

    /// 注册前按 piece 重新校验源文件
    pub fn with_validation(worker_pool_size: usize) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_pool_size.max(1))
            .thread_name(|i| format!("seed-worker-{}", i))
            .build()?;
        Ok(Self {
            validator: Some(Arc::new(pool)),
            ..Self::new()
        })
    }

    pub fn bind_addresses(&self) -> Vec<SocketAddr> {
        self.bind.lock().clone()
    }

    pub fn entry(&self, torrent_file: &Path) -> Option<SeedEntry> {
        self.seeding.get(torrent_file).map(|e| e.value().clone())
    }

    fn verify(&self, torrent_file: &Path, source_file: &Path) -> Option<TorrentDescriptor> {
        let descriptor = match TorrentDescriptor::load(torrent_file) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Cannot seed {:?}: {:#}", torrent_file, e);
                return None;
            }
        };
        if !descriptor.matches_source(source_file) {
            tracing::warn!(
                "Cannot seed {:?}: descriptor does not match {:?}",
                torrent_file,
                source_file
            );
            return None;
        }
        if let Some(pool) = &self.validator {
            match hash_pieces(source_file, descriptor.piece_length, pool) {
                Ok(pieces) if pieces == descriptor.pieces => {}
                Ok(_) => {
                    tracing::warn!("Cannot seed {:?}: piece hashes differ", torrent_file);
                    return None;
                }
                Err(e) => {
                    tracing::warn!("Cannot seed {:?}: recheck failed: {}", torrent_file, e);
                    return None;
                }
            }
        }
        Some(descriptor)
    }
}

impl TorrentTransport for LocalTransport {
    fn start(&self, bind_addresses: &[SocketAddr]) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.bind.lock() = bind_addresses.to_vec();
        tracing::info!("Local transport started, bind={:?}", bind_addresses);
        Ok(())
    }

    fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let n = self.seeding.len();
        self.seeding.clear();
        self.bind.lock().clear();
        tracing::info!("Local transport stopped, released {} torrents", n);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn seed(&self, torrent_file: &Path, source_file: &Path) -> bool {
        if !self.is_started() {
            let err = SeedError::TransportUnavailable("transport is not started".into());
            tracing::warn!("Cannot seed {:?}: {}", torrent_file, err);
            return false;
        }
        let Some(descriptor) = self.verify(torrent_file, source_file) else {
            return false;
        };
        self.seeding.insert(
            torrent_file.to_path_buf(),
            SeedEntry {
                source_file: source_file.to_path_buf(),
                descriptor,
                since: SystemTime::now(),
            },
        );
        true
    }

    fn unseed(&self, torrent_file: &Path) {
        self.seeding.remove(torrent_file);
    }

    fn is_seeding(&self, torrent_file: &Path) -> bool {
        self.seeding.contains_key(torrent_file)
    }

    fn active_count(&self) -> usize {
        self.seeding.len()
    }

    fn seeded_torrents(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.seeding.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }
}
