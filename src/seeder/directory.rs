use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{SeederConfig, WatcherKind};
use crate::error::Result;
use crate::pointer::{self, PointerRecord};
use crate::seeder::{publish, LoopHandle};
use crate::stats::{SeederStats, SeedingReport};
use crate::storage::{remove_empty_parents, remove_file_and_empty_parents};
use crate::transport::{TorrentFileFactory, TorrentTransport};
use crate::watcher::{ChangeSet, DirectoryWatcher, NotifyWatcher, PollingWatcher};

#[derive(Clone, Debug)]
pub struct ReconcilerOptions {
    /// `usize::MAX` 表示不限
    pub max_torrents_to_seed: usize,
    pub file_size_threshold: u64,
    pub scan_interval: Duration,
    pub check_interval: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            max_torrents_to_seed: usize::MAX,
            file_size_threshold: 10 * 1024 * 1024,
            scan_interval: Duration::from_secs(30),
            check_interval: Duration::from_secs(300),
        }
    }
}

impl From<&SeederConfig> for ReconcilerOptions {
    fn from(cfg: &SeederConfig) -> Self {
        Self {
            max_torrents_to_seed: cfg.seed_limit(),
            file_size_threshold: cfg.file_size_threshold_bytes,
            scan_interval: cfg.scan_interval(),
            check_interval: cfg.check_interval(),
        }
    }
}

#[derive(Clone, Debug)]
struct Registration {
    source_file: PathBuf,
    torrent_file: PathBuf,
}

struct Inner {
    watcher: Box<dyn DirectoryWatcher>,
    /// pointer -> 当前注册；pointer 被删除后无需再读取它即可撤销
    registrations: HashMap<PathBuf, Registration>,
}

/// 把存储根下 pointer 文件的生命周期转换为 transport 的 seed / unseed。
///
/// 所有 pass（watcher 变更、健康检查、直接调用）都在同一把锁内串行执行，
/// 同一 pointer 的 add / remove 不会交错。
pub struct SeedingReconciler {
    storage_root: PathBuf,
    transport: Arc<dyn TorrentTransport>,
    factory: Arc<dyn TorrentFileFactory>,
    inner: Mutex<Inner>,
    registered: AtomicUsize,
    max_torrents_to_seed: AtomicUsize,
    file_size_threshold: AtomicU64,
    scan_interval: Duration,
    check_interval: Duration,
    stats: Arc<SeederStats>,
    stopped: AtomicBool,
    handle: Mutex<Option<LoopHandle>>,
}

impl SeedingReconciler {
    pub fn new(
        storage_root: PathBuf,
        watcher: Box<dyn DirectoryWatcher>,
        transport: Arc<dyn TorrentTransport>,
        factory: Arc<dyn TorrentFileFactory>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            storage_root,
            transport,
            factory,
            inner: Mutex::new(Inner {
                watcher,
                registrations: HashMap::new(),
            }),
            registered: AtomicUsize::new(0),
            max_torrents_to_seed: AtomicUsize::new(options.max_torrents_to_seed),
            file_size_threshold: AtomicU64::new(options.file_size_threshold),
            scan_interval: options.scan_interval,
            check_interval: options.check_interval,
            stats: Arc::new(SeederStats::default()),
            stopped: AtomicBool::new(true),
            handle: Mutex::new(None),
        }
    }

    /// 按配置创建存储根与 watcher
    pub fn from_config(
        cfg: &SeederConfig,
        transport: Arc<dyn TorrentTransport>,
        factory: Arc<dyn TorrentFileFactory>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cfg.storage_dir)?;
        let root = cfg.storage_dir.clone();
        let watcher: Box<dyn DirectoryWatcher> = match cfg.watcher {
            WatcherKind::Polling => Box::new(PollingWatcher::new(root.clone(), pointer::is_pointer)),
            WatcherKind::Notify => Box::new(NotifyWatcher::new(
                root.clone(),
                pointer::is_pointer,
                cfg.watcher_channel_size,
            )?),
        };
        Ok(Self::new(root, watcher, transport, factory, cfg.into()))
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// 执行一次 watcher → reconcile pass，返回处理的变更数。
    ///
    /// 根目录不可用时跳过本次 pass（不会把所有 pointer 当作已删除）。
    pub fn poll_once(&self) -> usize {
        let mut inner = self.inner.lock();
        let changes = match inner.watcher.poll() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    "Skipping reconciliation pass for {:?}: {}",
                    self.storage_root,
                    e
                );
                return 0;
            }
        };
        self.stats.record_pass();
        let n = changes.len();
        if n > 0 {
            tracing::debug!(
                "Pointer changes: +{} ~{} -{}",
                changes.added().len(),
                changes.modified().len(),
                changes.removed().len()
            );
        }
        self.apply(&mut inner, changes);
        n
    }

    /// 先处理 added / modified，再处理 removed
    pub fn process_changes(&self, changes: ChangeSet) {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, changes);
    }

    fn apply(&self, inner: &mut Inner, changes: ChangeSet) {
        let ChangeSet {
            added,
            modified,
            removed,
        } = changes;
        for link in added.iter().chain(modified.iter()) {
            self.seed_pointer(inner, link);
        }
        for link in &removed {
            self.remove_pointer(inner, link);
        }
        self.registered
            .store(inner.registrations.len(), Ordering::Release);
    }

    fn seed_pointer(&self, inner: &mut Inner, link: &Path) {
        let previous = inner.registrations.remove(link);
        if let Some(old) = &previous {
            tracing::debug!("Re-seeding {:?}, releasing {:?}", link, old.torrent_file);
            self.transport.unseed(&old.torrent_file);
            self.stats.record_unseeded();
        }

        let current = self.register_pointer(link);

        // 新注册不再使用的旧描述文件：位于存储根下的一并删除
        if let Some(old) = previous {
            let reused = current
                .as_ref()
                .is_some_and(|reg| reg.torrent_file == old.torrent_file);
            if !reused && old.torrent_file.starts_with(&self.storage_root) {
                if let Err(e) = remove_file_and_empty_parents(&old.torrent_file, &self.storage_root) {
                    tracing::warn!("Failed to delete stale torrent {:?}: {}", old.torrent_file, e);
                }
            }
        }

        if let Some(reg) = current {
            inner.registrations.insert(link.to_path_buf(), reg);
        }
    }

    /// 读取 pointer 并开始做种；未能做种时返回 None
    fn register_pointer(&self, link: &Path) -> Option<Registration> {
        let record = match PointerRecord::read(link) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Removing unreadable pointer: {}", e);
                self.discard_pointer(link);
                return None;
            }
        };

        if !record.source_file.is_file() {
            tracing::info!(
                "Source {:?} is gone, removing pointer {:?}",
                record.source_file,
                link
            );
            self.discard_pointer(link);
            return None;
        }

        let limit = self.max_torrents_to_seed.load(Ordering::Acquire);
        if self.transport.active_count() >= limit {
            tracing::warn!("Seeding limit {} reached, not seeding {:?}", limit, link);
            self.stats.record_rejected();
            return None;
        }

        let torrent = match self.resolve_torrent(&record) {
            Ok(Some(t)) => t,
            Ok(None) => {
                tracing::warn!("No torrent produced for {:?}", record.source_file);
                self.stats.record_seed_failure();
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to prepare torrent for {:?}: {:#}",
                    record.source_file,
                    e
                );
                self.stats.record_seed_failure();
                return None;
            }
        };

        if !self.transport.seed(&torrent, &record.source_file) {
            self.stats.record_seed_failure();
            return None;
        }
        tracing::debug!("Seeding {:?} for {:?}", torrent, link);
        self.stats.record_seeded();
        Some(Registration {
            source_file: record.source_file,
            torrent_file: torrent,
        })
    }

    /// pointer 中记录的描述文件仍有效则直接使用，否则在其所在目录（或 pointer 目录）重新生成
    fn resolve_torrent(&self, record: &PointerRecord) -> anyhow::Result<Option<PathBuf>> {
        if let Some(torrent) = &record.torrent_file {
            if self.factory.is_valid_torrent_file(torrent, &record.source_file) {
                return Ok(Some(torrent.clone()));
            }
        }
        let dest_dir = record
            .torrent_file
            .as_deref()
            .and_then(Path::parent)
            .or_else(|| record.link_path.parent())
            .unwrap_or(&self.storage_root);
        self.factory
            .create_torrent_file(&record.source_file, dest_dir)
    }

    fn remove_pointer(&self, inner: &mut Inner, link: &Path) {
        match inner.registrations.remove(link) {
            Some(reg) => {
                tracing::debug!("Pointer {:?} removed, unseeding {:?}", link, reg.torrent_file);
                self.release(&reg);
            }
            None => tracing::debug!("Pointer {:?} removed, nothing registered", link),
        }
        if let Some(parent) = link.parent() {
            remove_empty_parents(parent, &self.storage_root);
        }
    }

    fn release(&self, reg: &Registration) {
        self.transport.unseed(&reg.torrent_file);
        self.stats.record_unseeded();
        if let Err(e) = remove_file_and_empty_parents(&reg.torrent_file, &self.storage_root) {
            tracing::warn!("Failed to delete torrent {:?}: {}", reg.torrent_file, e);
        }
    }

    fn discard_pointer(&self, link: &Path) {
        self.stats.record_broken();
        if let Err(e) = remove_file_and_empty_parents(link, &self.storage_root) {
            tracing::warn!("Failed to delete pointer {:?}: {}", link, e);
        }
    }

    /// 源文件消失的注册按 pointer 删除处理（pointer 一并删除），返回处理数
    pub fn check_health(&self) -> usize {
        let mut inner = self.inner.lock();
        let broken: Vec<PathBuf> = inner
            .registrations
            .iter()
            .filter(|(_, reg)| !reg.source_file.is_file())
            .map(|(link, _)| link.clone())
            .collect();

        for link in &broken {
            if let Some(reg) = inner.registrations.remove(link) {
                tracing::info!(
                    "Source {:?} disappeared, unseeding {:?}",
                    reg.source_file,
                    reg.torrent_file
                );
                self.release(&reg);
                self.discard_pointer(link);
            }
        }
        self.registered
            .store(inner.registrations.len(), Ordering::Release);
        broken.len()
    }

    /// stop 之后再次 start：把保留的注册重新交给 transport
    fn reseed_registered(&self) {
        let mut inner = self.inner.lock();
        let transport = self.transport.clone();
        inner
            .registrations
            .retain(|_, reg| transport.seed(&reg.torrent_file, &reg.source_file));
        self.registered
            .store(inner.registrations.len(), Ordering::Release);
    }

    /// 启动 transport，完成首次全量 pass 后再启动周期循环。
    ///
    /// 只有 transport 启动失败会返回错误。
    pub async fn start(self: &Arc<Self>, bind_addresses: &[SocketAddr]) -> Result<()> {
        if !self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        self.transport.start(bind_addresses)?;
        self.stopped.store(false, Ordering::Release);
        tracing::info!("Seeding reconciler started for {:?}", self.storage_root);

        self.run_blocking(|this| {
            this.reseed_registered();
            this.poll_once();
        })
        .await;

        // stop 先置 stopped 再取 handle，这里在同一把锁内复查
        let mut slot = self.handle.lock();
        if self.stopped.load(Ordering::Acquire) {
            tracing::info!("Seeding reconciler stopped during the initial pass");
            return Ok(());
        }
        if slot.is_some() {
            // stop 后又一次 start 已经启动了循环
            return Ok(());
        }
        let this = self.clone();
        *slot = Some(LoopHandle::spawn(move |shutdown| this.run_loop(shutdown)));
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, shutdown: Arc<Notify>) {
        let mut scan = tokio::time::interval_at(Instant::now() + self.scan_interval, self.scan_interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check =
            tokio::time::interval_at(Instant::now() + self.check_interval, self.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                _ = scan.tick() => {
                    self.run_blocking(|this| {
                        this.poll_once();
                    })
                    .await;
                }
                _ = check.tick() => {
                    self.run_blocking(|this| {
                        let n = this.check_health();
                        if n > 0 {
                            tracing::info!("Health check released {} torrents", n);
                        }
                    })
                    .await;
                }
            }
        }
        tracing::debug!("Reconciler loop exited");
    }

    async fn run_blocking<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&SeedingReconciler) + Send + 'static,
    {
        let this = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || f(&*this)).await {
            tracing::error!("Reconciliation pass failed: {}", e);
        }
    }

    /// 等待进行中的 pass 结束后停止 transport；可重复调用
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.transport.stop();
        tracing::info!("Seeding reconciler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn should_create_torrent_for(&self, source: &Path) -> bool {
        std::fs::metadata(source)
            .map(|md| md.is_file() && md.len() >= self.file_size_threshold.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// 生成描述文件与 pointer；下一次 pass 开始做种
    pub fn publish_artifact(
        &self,
        artifact: &Path,
        relative_dir: &Path,
    ) -> anyhow::Result<Option<PathBuf>> {
        publish::publish_artifact(
            self.factory.as_ref(),
            &self.storage_root,
            artifact,
            relative_dir,
            self.file_size_threshold.load(Ordering::Acquire),
        )
    }

    pub fn is_seeding(&self, torrent_file: &Path) -> bool {
        self.transport.is_seeding(torrent_file)
    }

    pub fn seeded_count(&self) -> usize {
        self.transport.active_count()
    }

    /// `None` 表示不限；只影响之后的新注册
    pub fn set_max_torrents_to_seed(&self, max: Option<usize>) {
        self.max_torrents_to_seed
            .store(max.unwrap_or(usize::MAX), Ordering::Release);
    }

    pub fn max_torrents_to_seed(&self) -> Option<usize> {
        match self.max_torrents_to_seed.load(Ordering::Acquire) {
            usize::MAX => None,
            n => Some(n),
        }
    }

    pub fn set_file_size_threshold(&self, bytes: u64) {
        self.file_size_threshold.store(bytes, Ordering::Release);
    }

    pub fn registered_pointers(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.inner.lock().registrations.keys().cloned().collect();
        out.sort();
        out
    }

    /// 不获取 reconciler 锁，可在 pass 进行中调用
    pub fn report(&self) -> SeedingReport {
        self.stats.report(
            self.transport.active_count(),
            self.registered.load(Ordering::Acquire),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::is_pointer;
    use std::collections::HashMap;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("artifact-seeder-reconcile-{}-{}", tag, nanos))
    }

    #[derive(Default)]
    struct RecordingTransport {
        started: AtomicBool,
        seeding: parking_lot::Mutex<HashMap<PathBuf, PathBuf>>,
        unseeded: parking_lot::Mutex<Vec<PathBuf>>,
    }

    impl TorrentTransport for RecordingTransport {
        fn start(&self, _bind: &[SocketAddr]) -> Result<()> {
            self.started.store(true, Ordering::Release);
            Ok(())
        }

        fn stop(&self) {
            self.started.store(false, Ordering::Release);
            self.seeding.lock().clear();
        }

        fn is_started(&self) -> bool {
            self.started.load(Ordering::Acquire)
        }

        fn seed(&self, torrent_file: &Path, source_file: &Path) -> bool {
            if !self.is_started() {
                return false;
            }
            self.seeding
                .lock()
                .insert(torrent_file.to_path_buf(), source_file.to_path_buf());
            true
        }

        fn unseed(&self, torrent_file: &Path) {
            self.seeding.lock().remove(torrent_file);
            self.unseeded.lock().push(torrent_file.to_path_buf());
        }

        fn is_seeding(&self, torrent_file: &Path) -> bool {
            self.seeding.lock().contains_key(torrent_file)
        }

        fn active_count(&self) -> usize {
            self.seeding.lock().len()
        }

        fn seeded_torrents(&self) -> Vec<PathBuf> {
            self.seeding.lock().keys().cloned().collect()
        }
    }

    /// 在目标目录写一个占位描述文件
    struct StubFactory;

    impl TorrentFileFactory for StubFactory {
        fn create_torrent_file(
            &self,
            source: &Path,
            dest_dir: &Path,
        ) -> anyhow::Result<Option<PathBuf>> {
            if !source.is_file() {
                return Ok(None);
            }
            let name = source.file_name().unwrap().to_string_lossy();
            std::fs::create_dir_all(dest_dir)?;
            let torrent = dest_dir.join(format!("{}.torrent", name));
            std::fs::write(&torrent, b"stub")?;
            Ok(Some(torrent))
        }
    }

    struct Fixture {
        artifacts: PathBuf,
        storage: PathBuf,
        transport: Arc<RecordingTransport>,
        reconciler: Arc<SeedingReconciler>,
    }

    /// 首次生成描述文件前先阻塞一段时间
    struct SlowFactory(Duration);

    impl TorrentFileFactory for SlowFactory {
        fn create_torrent_file(
            &self,
            source: &Path,
            dest_dir: &Path,
        ) -> anyhow::Result<Option<PathBuf>> {
            std::thread::sleep(self.0);
            StubFactory.create_torrent_file(source, dest_dir)
        }
    }

    fn fixture(tag: &str, options: ReconcilerOptions) -> Fixture {
        fixture_with(tag, options, Arc::new(StubFactory))
    }

    fn fixture_with(
        tag: &str,
        options: ReconcilerOptions,
        factory: Arc<dyn TorrentFileFactory>,
    ) -> Fixture {
        let dir = unique_tmp_dir(tag);
        let artifacts = dir.join("artifacts");
        let storage = dir.join("storage");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::create_dir_all(&storage).unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let reconciler = Arc::new(SeedingReconciler::new(
            storage.clone(),
            Box::new(PollingWatcher::new(storage.clone(), is_pointer)),
            transport.clone(),
            factory,
            options,
        ));
        Fixture {
            artifacts,
            storage,
            transport,
            reconciler,
        }
    }

    fn artifact(fx: &Fixture, name: &str) -> PathBuf {
        let p = fx.artifacts.join(name);
        std::fs::write(&p, name.as_bytes()).unwrap();
        p
    }

    #[test]
    fn existing_pointer_is_seeded_with_descriptor_next_to_it() {
        let fx = fixture("seed", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let src = artifact(&fx, "a.bin");
        let link = pointer::create(&src, None, &fx.storage.join("p1")).unwrap();

        assert_eq!(fx.reconciler.poll_once(), 1);

        let torrent = fx.storage.join("p1").join("a.bin.torrent");
        assert!(fx.reconciler.is_seeding(&torrent));
        assert_eq!(fx.reconciler.registered_pointers(), vec![link]);
        assert_eq!(fx.reconciler.report().seeded, 1);
    }

    #[test]
    fn missing_source_removes_pointer_and_empty_dirs_but_not_root() {
        let fx = fixture("missing", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let gone = fx.artifacts.join("gone.bin");
        let link = pointer::create(&gone, None, &fx.storage.join("x").join("y")).unwrap();

        fx.reconciler.poll_once();

        assert!(!link.exists());
        assert!(!fx.storage.join("x").exists());
        assert!(fx.storage.is_dir());
        assert_eq!(fx.transport.active_count(), 0);
        assert_eq!(fx.reconciler.report().broken_removed, 1);
    }

    #[test]
    fn removed_pointer_unseeds_and_deletes_descriptor() {
        let fx = fixture("remove", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let src = artifact(&fx, "a.bin");
        let link = pointer::create(&src, None, &fx.storage.join("p1")).unwrap();
        fx.reconciler.poll_once();
        let torrent = fx.storage.join("p1").join("a.bin.torrent");
        assert!(torrent.is_file());

        std::fs::remove_file(&link).unwrap();
        fx.reconciler.poll_once();

        assert!(!fx.reconciler.is_seeding(&torrent));
        assert_eq!(fx.transport.unseeded.lock().as_slice(), &[torrent.clone()]);
        assert!(!torrent.exists());
        assert!(!fx.storage.join("p1").exists());
        assert!(fx.reconciler.registered_pointers().is_empty());
    }

    #[test]
    fn modified_pointer_is_reseeded_exactly_once() {
        let fx = fixture("reseed", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let src = artifact(&fx, "a.bin");
        let link = pointer::create(&src, None, &fx.storage).unwrap();
        fx.reconciler.poll_once();

        let other = artifact(&fx, "other-a.bin");
        std::fs::write(&link, format!("{}\n", other.display())).unwrap();
        fx.reconciler.poll_once();

        assert!(!fx.reconciler.is_seeding(&fx.storage.join("a.bin.torrent")));
        assert!(!fx.storage.join("a.bin.torrent").exists());
        assert!(fx.reconciler.is_seeding(&fx.storage.join("other-a.bin.torrent")));
        assert_eq!(fx.transport.active_count(), 1);

        // 同一 pointer 重复上报不会产生第二个注册
        fx.reconciler.process_changes(ChangeSet {
            added: vec![link.clone()],
            ..ChangeSet::default()
        });
        assert_eq!(fx.transport.active_count(), 1);
        assert_eq!(fx.reconciler.registered_pointers(), vec![link]);
    }

    #[test]
    fn repointed_to_missing_source_cleans_old_descriptor_and_dir() {
        let fx = fixture("repoint-missing", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let src = artifact(&fx, "a.bin");
        let dir = fx.storage.join("builds").join("7");
        let link = pointer::create(&src, None, &dir).unwrap();
        fx.reconciler.poll_once();
        let torrent = dir.join("a.bin.torrent");
        assert!(fx.reconciler.is_seeding(&torrent));

        let gone = fx.artifacts.join("gone.bin");
        std::fs::write(&link, format!("{}\n", gone.display())).unwrap();
        fx.reconciler.poll_once();

        assert!(!fx.reconciler.is_seeding(&torrent));
        assert!(!link.exists());
        assert!(!torrent.exists());
        assert!(!fx.storage.join("builds").exists());
        assert!(fx.storage.is_dir());
        assert!(fx.reconciler.registered_pointers().is_empty());
    }

    #[test]
    fn reseed_keeps_descriptor_outside_storage_root() {
        let fx = fixture("repoint-external", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let src = artifact(&fx, "a.bin");
        let torrent = fx.artifacts.join("given.torrent");
        std::fs::write(&torrent, b"given").unwrap();
        let link = pointer::create(&src, Some(&torrent), &fx.storage).unwrap();
        fx.reconciler.poll_once();
        assert!(fx.reconciler.is_seeding(&torrent));

        let other = artifact(&fx, "b.bin");
        std::fs::write(&link, format!("{}\n", other.display())).unwrap();
        fx.reconciler.poll_once();

        assert!(!fx.reconciler.is_seeding(&torrent));
        assert!(torrent.is_file());
        assert!(fx.reconciler.is_seeding(&fx.storage.join("b.bin.torrent")));
    }

    #[test]
    fn seeds_beyond_limit_are_rejected_without_evicting() {
        let fx = fixture(
            "limit",
            ReconcilerOptions {
                max_torrents_to_seed: 1,
                ..ReconcilerOptions::default()
            },
        );
        fx.transport.start(&[]).unwrap();
        let a = artifact(&fx, "a.bin");
        pointer::create(&a, None, &fx.storage.join("a")).unwrap();
        fx.reconciler.poll_once();

        let b = artifact(&fx, "b.bin");
        pointer::create(&b, None, &fx.storage.join("b")).unwrap();
        fx.reconciler.poll_once();

        assert_eq!(fx.transport.active_count(), 1);
        assert!(fx.reconciler.is_seeding(&fx.storage.join("a").join("a.bin.torrent")));
        assert_eq!(fx.reconciler.report().rejected_at_capacity, 1);

        fx.reconciler.set_max_torrents_to_seed(None);
        assert_eq!(fx.reconciler.max_torrents_to_seed(), None);
    }

    #[test]
    fn health_check_unseeds_and_removes_pointer_of_deleted_source() {
        let fx = fixture("health", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let src = artifact(&fx, "a.bin");
        let link = pointer::create(&src, None, &fx.storage.join("p")).unwrap();
        fx.reconciler.poll_once();

        std::fs::remove_file(&src).unwrap();
        assert_eq!(fx.reconciler.check_health(), 1);

        assert_eq!(fx.transport.active_count(), 0);
        assert!(!link.exists());
        assert!(!fx.storage.join("p").exists());

        // watcher 随后上报的删除是空操作
        fx.reconciler.poll_once();
        assert_eq!(fx.transport.unseeded.lock().len(), 1);
    }

    #[test]
    fn malformed_pointer_is_dropped_without_aborting_pass() {
        let fx = fixture("malformed", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        std::fs::create_dir_all(fx.storage.join("bad")).unwrap();
        let bad = fx.storage.join("bad").join("empty.link");
        std::fs::write(&bad, "").unwrap();
        let src = artifact(&fx, "good.bin");
        pointer::create(&src, None, &fx.storage.join("good")).unwrap();

        fx.reconciler.poll_once();

        assert!(!bad.exists());
        assert!(!fx.storage.join("bad").exists());
        assert!(fx
            .reconciler
            .is_seeding(&fx.storage.join("good").join("good.bin.torrent")));
    }

    #[test]
    fn shared_directory_survives_partial_removal() {
        let fx = fixture("shared", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let dir = fx.storage.join("shared");
        let a = artifact(&fx, "a.bin");
        let b = artifact(&fx, "b.bin");
        let link_a = pointer::create(&a, None, &dir).unwrap();
        pointer::create(&b, None, &dir).unwrap();
        fx.reconciler.poll_once();
        assert_eq!(fx.transport.active_count(), 2);

        std::fs::remove_file(&link_a).unwrap();
        fx.reconciler.poll_once();

        assert!(dir.is_dir());
        assert!(!dir.join("a.bin.torrent").exists());
        assert!(fx.reconciler.is_seeding(&dir.join("b.bin.torrent")));
    }

    #[test]
    fn pointer_with_valid_descriptor_is_used_as_is() {
        let fx = fixture("explicit", ReconcilerOptions::default());
        fx.transport.start(&[]).unwrap();
        let src = artifact(&fx, "a.bin");
        let torrents = fx.artifacts.join("t");
        std::fs::create_dir_all(&torrents).unwrap();
        let torrent = torrents.join("custom.torrent");
        std::fs::write(&torrent, b"given").unwrap();
        pointer::create(&src, Some(&torrent), &fx.storage).unwrap();

        fx.reconciler.poll_once();

        assert!(fx.reconciler.is_seeding(&torrent));
        assert!(!torrents.join("a.bin.torrent").exists());
    }

    #[test]
    fn threshold_controls_descriptor_creation() {
        let fx = fixture(
            "threshold",
            ReconcilerOptions {
                file_size_threshold: 4,
                ..ReconcilerOptions::default()
            },
        );
        let small = artifact(&fx, "s");
        let big = artifact(&fx, "big.bin");
        assert!(!fx.reconciler.should_create_torrent_for(&small));
        assert!(fx.reconciler.should_create_torrent_for(&big));
        assert!(!fx.reconciler.should_create_torrent_for(&fx.artifacts.join("none")));

        let link = fx
            .reconciler
            .publish_artifact(&big, Path::new("builds/1"))
            .unwrap()
            .unwrap();
        assert_eq!(link, fx.storage.join("builds/1/big.bin.link"));
    }

    #[tokio::test]
    async fn start_seeds_existing_pointers_and_loop_picks_up_new_ones() {
        let fx = fixture(
            "lifecycle",
            ReconcilerOptions {
                scan_interval: Duration::from_millis(50),
                ..ReconcilerOptions::default()
            },
        );
        let a = artifact(&fx, "a.bin");
        pointer::create(&a, None, &fx.storage).unwrap();
        assert!(fx.reconciler.is_stopped());

        fx.reconciler.start(&[]).await.unwrap();
        assert!(!fx.reconciler.is_stopped());
        assert!(fx.reconciler.is_seeding(&fx.storage.join("a.bin.torrent")));

        let b = artifact(&fx, "b.bin");
        pointer::create(&b, None, &fx.storage.join("later")).unwrap();
        let torrent_b = fx.storage.join("later").join("b.bin.torrent");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !fx.reconciler.is_seeding(&torrent_b) {
            if tokio::time::Instant::now() >= deadline {
                panic!("new pointer was not seeded in time");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        fx.reconciler.stop().await;
        assert!(fx.reconciler.is_stopped());
        assert!(!fx.transport.is_started());
        assert_eq!(fx.reconciler.seeded_count(), 0);
        // 重复 stop 无副作用
        fx.reconciler.stop().await;
    }

    #[tokio::test]
    async fn stop_during_initial_pass_leaves_no_loop_running() {
        let fx = fixture_with(
            "stop-early",
            ReconcilerOptions {
                scan_interval: Duration::from_millis(50),
                ..ReconcilerOptions::default()
            },
            Arc::new(SlowFactory(Duration::from_millis(400))),
        );
        let a = artifact(&fx, "a.bin");
        pointer::create(&a, None, &fx.storage).unwrap();

        let starting = {
            let reconciler = fx.reconciler.clone();
            tokio::spawn(async move { reconciler.start(&[]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.reconciler.stop().await;
        starting.await.unwrap().unwrap();

        assert!(fx.reconciler.is_stopped());
        assert!(fx.reconciler.handle.lock().is_none());
        let passes = fx.reconciler.report().passes;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.reconciler.report().passes, passes);

        // 之后仍可正常启动
        fx.reconciler.start(&[]).await.unwrap();
        assert!(fx.reconciler.handle.lock().is_some());
        fx.reconciler.stop().await;
        assert!(fx.reconciler.handle.lock().is_none());
    }
}
