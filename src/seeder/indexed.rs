use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{SeederConfig, INDEX_FILE_NAME};
use crate::error::Result;
use crate::index::{BoundedTorrentIndex, EvictionListener, PathConverter};
use crate::seeder::LoopHandle;
use crate::transport::TorrentTransport;

/// 索引条目被淘汰 / 移除时停止做种，按需删除描述文件
struct UnseedOnEvict {
    transport: Arc<dyn TorrentTransport>,
    remove_expired: Arc<AtomicBool>,
}

impl UnseedOnEvict {
    fn release(&self, torrent: &Path) {
        self.transport.unseed(torrent);
        if self.remove_expired.load(Ordering::Acquire) {
            match std::fs::remove_file(torrent) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to delete expired torrent {:?}: {}", torrent, e),
            }
        }
    }
}

impl EvictionListener for UnseedOnEvict {
    fn on_remove(&self, source: &Path, torrent: &Path) {
        tracing::debug!("Torrent for {:?} left the index, unseeding {:?}", source, torrent);
        self.release(torrent);
    }
}

/// 由调用方直接登记 (源文件, torrent) 的做种器。
///
/// 登记写入有界索引（默认 `<storage>/torrents.db`）；超过上限的最旧条目被淘汰并停止做种。
/// 后台循环定期清理失效条目并落盘。
pub struct IndexedSeeder {
    index: Arc<BoundedTorrentIndex>,
    transport: Arc<dyn TorrentTransport>,
    remove_expired: Arc<AtomicBool>,
    releaser: Arc<UnseedOnEvict>,
    check_interval: Duration,
    flush_interval: Duration,
    working: AtomicBool,
    handle: Mutex<Option<LoopHandle>>,
}

impl IndexedSeeder {
    pub fn new(
        storage_dir: &Path,
        max_torrents: usize,
        converter: Option<Arc<dyn PathConverter>>,
        transport: Arc<dyn TorrentTransport>,
        cfg: &SeederConfig,
    ) -> Self {
        let remove_expired = Arc::new(AtomicBool::new(cfg.remove_expired_torrent_files));
        let releaser = Arc::new(UnseedOnEvict {
            transport: transport.clone(),
            remove_expired: remove_expired.clone(),
        });
        let listener: Arc<dyn EvictionListener> = releaser.clone();
        let index_file = cfg
            .index_file
            .clone()
            .unwrap_or_else(|| storage_dir.join(INDEX_FILE_NAME));
        let index = BoundedTorrentIndex::open(
            index_file,
            max_torrents,
            converter,
            Some(listener),
        );
        Self {
            index: Arc::new(index),
            transport,
            remove_expired,
            releaser,
            check_interval: cfg.check_interval(),
            flush_interval: cfg.flush_interval(),
            working: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn index(&self) -> &BoundedTorrentIndex {
        &self.index
    }

    /// true 时被淘汰的描述文件同时从磁盘删除
    pub fn set_remove_expired_torrent_files(&self, remove: bool) {
        self.remove_expired.store(remove, Ordering::Release);
    }

    /// 源文件已登记到另一个 torrent 时，旧 torrent 按淘汰处理
    pub fn register_src_and_torrent(&self, source: &Path, torrent: &Path, start_seeding: bool) {
        if let Some(previous) = self.index.add_file_and_torrent(source, torrent) {
            tracing::debug!(
                "Torrent for {:?} replaced, releasing {:?}",
                source,
                previous
            );
            self.releaser.release(&previous);
        }
        if start_seeding {
            self.seed_torrent(source, torrent);
        }
    }

    /// 监听器负责 unseed
    pub fn unregister_src_file(&self, source: &Path) {
        self.index.remove_src_file(source);
    }

    fn seed_torrent(&self, source: &Path, torrent: &Path) {
        if self.transport.is_seeding(torrent) {
            self.transport.unseed(torrent);
        }
        tracing::debug!("Start seeding {:?}", source);
        if !self.transport.seed(torrent, source) {
            tracing::warn!("Failed to start seeding torrent {:?}", torrent);
        }
    }

    /// 返回被移除条目的 torrent 路径
    pub fn check_for_broken_files(&self) -> Vec<PathBuf> {
        self.index.cleanup_broken_files()
    }

    pub fn flush(&self) -> Result<()> {
        self.index.flush()
    }

    fn seed_stored(&self) {
        self.check_for_broken_files();
        for entry in self.index.entries() {
            self.seed_torrent(&entry.source_file, &entry.torrent_file);
        }
    }

    /// 启动 transport 并在后台做种已登记的条目
    pub async fn start(self: &Arc<Self>, bind_addresses: &[SocketAddr]) -> Result<()> {
        if self.working.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.transport.start(bind_addresses) {
            self.working.store(false, Ordering::Release);
            return Err(e);
        }
        tracing::info!(
            "Indexed seeder started, {} torrents registered",
            self.index.len()
        );

        let this = self.clone();
        let handle = LoopHandle::spawn(move |shutdown| this.run_loop(shutdown));
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, shutdown: Arc<Notify>) {
        let this = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || this.seed_stored()).await {
            tracing::error!("Seeding stored torrents failed: {}", e);
        }

        let mut check =
            tokio::time::interval_at(Instant::now() + self.check_interval, self.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush =
            tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                _ = check.tick() => {
                    let this = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || this.check_for_broken_files()).await {
                        tracing::error!("Broken files check failed: {}", e);
                    }
                }
                _ = flush.tick() => {
                    let this = self.clone();
                    match tokio::task::spawn_blocking(move || this.flush()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::error!("Failed to flush torrent index: {}", e),
                        Err(e) => tracing::error!("Torrent index flush task failed: {}", e),
                    }
                }
            }
        }
    }

    /// 停止循环与 transport，并把索引落盘（失败只记录日志）
    pub async fn stop(&self) {
        if !self.working.swap(false, Ordering::AcqRel) {
            return;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.transport.stop();
        if let Err(e) = self.index.flush() {
            tracing::warn!("Failed to save torrent index on stop: {}", e);
        }
        tracing::info!("Indexed seeder stopped");
    }

    pub fn is_stopped(&self) -> bool {
        !self.working.load(Ordering::Acquire)
    }

    pub fn is_seeding(&self, torrent: &Path) -> bool {
        self.transport.is_seeding(torrent)
    }

    pub fn seeded_count(&self) -> usize {
        self.transport.active_count()
    }

    /// 缩小上限会立即淘汰最旧的条目
    pub fn set_max_torrents_to_seed(&self, max: usize) {
        self.index.set_max_torrents(max);
    }

    /// 从旧到新
    pub fn registered_torrent_files(&self) -> Vec<PathBuf> {
        self.index
            .entries()
            .into_iter()
            .map(|e| e.torrent_file)
            .collect()
    }
}
