use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::{Result, SeedError};
use crate::index::path::{AbsolutePaths, PathConverter};
use crate::storage::write_atomic;

/// 持久化行格式：`<src> || <torrent>`
pub const SEPARATOR: &str = " || ";

/// 条目被淘汰 / 移除时的回调
pub trait EvictionListener: Send + Sync {
    fn on_remove(&self, source: &Path, torrent: &Path);
}

impl<F> EvictionListener for F
where
    F: Fn(&Path, &Path) + Send + Sync,
{
    fn on_remove(&self, source: &Path, torrent: &Path) {
        self(source, torrent)
    }
}

/// 索引条目快照
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub source_file: PathBuf,
    pub torrent_file: PathBuf,
    pub added_at: SystemTime,
    /// 单调插入序号：真正的淘汰顺序键
    pub seq: u64,
}

#[derive(Clone, Debug)]
struct Slot {
    torrent: String,
    seq: u64,
    added_at: SystemTime,
}

#[derive(Debug, Default)]
struct IndexState {
    /// stored(src) -> slot
    entries: HashMap<String, Slot>,
    /// seq -> stored(src)，升序即从旧到新
    order: BTreeMap<u64, String>,
    next_seq: u64,
    max_entries: usize,
    dirty: bool,
    /// 每次变更 +1；flush 只在期间无新变更时才清 dirty
    version: u64,
}

type Removed = Vec<(String, String)>;

impl IndexState {
    /// 返回被替换的旧 torrent（如有）与因超限被淘汰的条目
    fn put(&mut self, src: String, torrent: String) -> (Option<String>, Removed) {
        let replaced = self.entries.remove(&src).map(|old| {
            self.order.remove(&old.seq);
            old.torrent
        });
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, src.clone());
        self.entries.insert(
            src,
            Slot {
                torrent,
                seq,
                added_at: SystemTime::now(),
            },
        );
        self.touch();
        (replaced, self.evict_to_cap())
    }

    fn take(&mut self, src: &str) -> Option<String> {
        let slot = self.entries.remove(src)?;
        self.order.remove(&slot.seq);
        self.touch();
        Some(slot.torrent)
    }

    fn evict_to_cap(&mut self) -> Removed {
        let mut removed = Vec::new();
        while self.entries.len() > self.max_entries {
            let Some((_, src)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&src) {
                removed.push((src, slot.torrent));
            }
        }
        if !removed.is_empty() {
            self.touch();
        }
        removed
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.version += 1;
    }
}

/// 有界、可持久化的 源文件 -> torrent 描述文件 索引。
///
/// - 以源文件为键（重复插入 = 更新 torrent 路径并移到最新）
/// - 超过 `max_entries` 时按插入顺序淘汰最旧条目，每条淘汰回调一次
/// - `flush` 以从旧到新的顺序整体覆盖写入索引文件；重新打开后淘汰顺序一致
///
/// 所有变更串行化在同一把锁内；回调在释放锁之后按淘汰顺序触发，
/// 回调内部可以安全地再次调用索引。
pub struct BoundedTorrentIndex {
    index_file: PathBuf,
    converter: Arc<dyn PathConverter>,
    listener: Option<Arc<dyn EvictionListener>>,
    state: Mutex<IndexState>,
}

impl BoundedTorrentIndex {
    /// 打开（或新建）索引。文件缺失 = 空索引；不可读 / 损坏的行跳过，不视为错误。
    pub fn open(
        index_file: PathBuf,
        max_entries: usize,
        converter: Option<Arc<dyn PathConverter>>,
        listener: Option<Arc<dyn EvictionListener>>,
    ) -> Self {
        let index = Self {
            index_file,
            converter: converter.unwrap_or_else(|| Arc::new(AbsolutePaths)),
            listener,
            state: Mutex::new(IndexState {
                max_entries,
                ..IndexState::default()
            }),
        };
        index.load();
        index
    }

    pub fn index_file(&self) -> &Path {
        &self.index_file
    }

    fn load(&self) {
        // 按字节读取：单行损坏（例如非 UTF-8）只跳过该行
        let content = match std::fs::read(&self.index_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Torrent index {:?} not found, starting empty", self.index_file);
                return;
            }
            Err(e) => {
                let err = SeedError::persistence(&self.index_file, e);
                tracing::warn!("Failed to load torrent index, starting empty: {}", err);
                return;
            }
        };

        // 文件中的行从旧到新，依次插入即可复现淘汰顺序
        let mut loaded = 0usize;
        let mut skipped = 0usize;
        let mut removed = Vec::new();
        {
            let mut st = self.state.lock();
            for raw in content.split(|b| *b == b'\n') {
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                let Ok(line) = std::str::from_utf8(raw) else {
                    skipped += 1;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let parts: Vec<&str> = line.split(SEPARATOR).collect();
                if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
                    skipped += 1;
                    continue;
                }
                loaded += 1;
                let (_, evicted) = st.put(parts[0].to_string(), parts[1].to_string());
                removed.extend(evicted);
            }
            // 与磁盘内容一致；只有加载时发生淘汰才需要回写
            st.dirty = !removed.is_empty();
        }

        if skipped > 0 {
            tracing::warn!(
                "Skipped {} malformed lines in torrent index {:?}",
                skipped,
                self.index_file
            );
        }
        tracing::info!("Loaded {} torrents from {:?}", loaded, self.index_file);
        self.notify(removed);
    }

    /// 登记或更新条目。源文件已登记且 torrent 不同时返回旧 torrent；
    /// 旧 torrent 不经过淘汰回调，由调用方处理。
    pub fn add_file_and_torrent(&self, source: &Path, torrent: &Path) -> Option<PathBuf> {
        let src = self.converter.to_stored(source);
        let tor = self.converter.to_stored(torrent);
        let (replaced, removed) = {
            let mut st = self.state.lock();
            let (replaced, removed) = st.put(src, tor.clone());
            (replaced.filter(|old| *old != tor), removed)
        };
        self.notify(removed);
        replaced.map(|old| self.converter.to_path(&old))
    }

    /// 移除并通知；不存在时无操作、无通知
    pub fn remove_src_file(&self, source: &Path) -> Option<PathBuf> {
        let src = self.converter.to_stored(source);
        let torrent = self.state.lock().take(&src)?;
        let torrent = self.converter.to_path(&torrent);
        if let Some(l) = &self.listener {
            l.on_remove(source, &torrent);
        }
        Some(torrent)
    }

    /// 运行时调整上限；缩小时立即淘汰到新上限
    pub fn set_max_torrents(&self, max_entries: usize) {
        let removed = {
            let mut st = self.state.lock();
            st.max_entries = max_entries;
            st.evict_to_cap()
        };
        if !removed.is_empty() {
            tracing::info!(
                "Torrent index limit set to {}, evicted {} entries",
                max_entries,
                removed.len()
            );
        }
        self.notify(removed);
    }

    pub fn max_entries(&self) -> usize {
        self.state.lock().max_entries
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn file_and_torrent_map(&self) -> HashMap<PathBuf, PathBuf> {
        let st = self.state.lock();
        st.entries
            .iter()
            .map(|(src, slot)| {
                (
                    self.converter.to_path(src),
                    self.converter.to_path(&slot.torrent),
                )
            })
            .collect()
    }

    /// 从旧到新
    pub fn entries(&self) -> Vec<IndexEntry> {
        let st = self.state.lock();
        st.order
            .values()
            .filter_map(|src| {
                let slot = st.entries.get(src)?;
                Some(IndexEntry {
                    source_file: self.converter.to_path(src),
                    torrent_file: self.converter.to_path(&slot.torrent),
                    added_at: slot.added_at,
                    seq: slot.seq,
                })
            })
            .collect()
    }

    /// 移除源文件或 torrent 文件已不存在的条目，返回对应的 torrent 路径。
    ///
    /// 文件检查在锁外进行；检查期间被重新插入的条目（seq 变化）不会被误删。
    pub fn cleanup_broken_files(&self) -> Vec<PathBuf> {
        let candidates: Vec<(String, u64, PathBuf, PathBuf)> = {
            let st = self.state.lock();
            st.entries
                .iter()
                .map(|(src, slot)| {
                    (
                        src.clone(),
                        slot.seq,
                        self.converter.to_path(src),
                        self.converter.to_path(&slot.torrent),
                    )
                })
                .collect()
        };

        let broken: Vec<_> = candidates
            .into_iter()
            .filter(|(_, _, src, torrent)| !src.is_file() || !torrent.is_file())
            .collect();
        if broken.is_empty() {
            return Vec::new();
        }

        let mut removed = Vec::new();
        {
            let mut st = self.state.lock();
            for (key, seq, _, _) in &broken {
                let still_same = st.entries.get(key).map(|s| s.seq == *seq).unwrap_or(false);
                if still_same {
                    if let Some(torrent) = st.take(key) {
                        removed.push((key.clone(), torrent));
                    }
                }
            }
        }

        tracing::info!("Removed {} broken entries from torrent index", removed.len());
        let torrents = removed
            .iter()
            .map(|(_, t)| self.converter.to_path(t))
            .collect();
        self.notify(removed);
        torrents
    }

    /// 有变更时把内存状态整体写回索引文件（从旧到新）。
    ///
    /// 失败不影响内存状态，dirty 标记保留以便下次重试。
    pub fn flush(&self) -> Result<()> {
        let (payload, count, version) = {
            let st = self.state.lock();
            if !st.dirty && self.index_file.exists() {
                tracing::debug!("Torrent index unchanged, skipping flush");
                return Ok(());
            }
            let mut out = String::new();
            for src in st.order.values() {
                if let Some(slot) = st.entries.get(src) {
                    out.push_str(src);
                    out.push_str(SEPARATOR);
                    out.push_str(&slot.torrent);
                    out.push('\n');
                }
            }
            (out, st.entries.len(), st.version)
        };

        write_atomic(&self.index_file, payload.as_bytes())
            .map_err(|e| SeedError::persistence(&self.index_file, e))?;

        let mut st = self.state.lock();
        if st.version == version {
            st.dirty = false;
        }
        tracing::debug!("Torrent index flushed: {} entries", count);
        Ok(())
    }

    fn notify(&self, removed: Removed) {
        let Some(listener) = &self.listener else {
            return;
        };
        for (src, torrent) in removed {
            let src = self.converter.to_path(&src);
            let torrent = self.converter.to_path(&torrent);
            tracing::debug!("Torrent index evicted {:?}", src);
            listener.on_remove(&src, &torrent);
        }
    }
}
