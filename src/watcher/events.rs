use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, TryRecvError};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::Result;
use crate::watcher::{diff_into, scan_tree, ChangeSet, DirectoryWatcher, FileStamp, PathFilter};

/// OS 事件驱动的 watcher。
///
/// 事件只用来缩小需要 stat 的路径集合，最终结论仍以 stat 为准，
/// 因此丢事件 / 事件乱序不会产生错误的 added/removed。
/// 使用 bounded channel 做背压：队列满时丢弃并计数，下次 poll 退化为全量对比。
pub struct NotifyWatcher {
    root: PathBuf,
    filter: PathFilter,
    rx: Receiver<notify::Event>,
    overflow_drops: Arc<AtomicU64>,
    seen_drops: u64,
    known: HashMap<PathBuf, FileStamp>,
    primed: bool,
    // 必须持有，否则监听随 drop 停止
    _watcher: RecommendedWatcher,
}

impl NotifyWatcher {
    pub fn new(root: PathBuf, filter: PathFilter, channel_size: usize) -> Result<Self> {
        let (tx, rx) = channel::bounded(channel_size.max(1));
        let overflow_drops = Arc::new(AtomicU64::new(0));
        let drops = overflow_drops.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    // 非阻塞发送：队列满时丢弃并计数
                    if tx.try_send(event).is_err() {
                        let n = drops.fetch_add(1, Ordering::AcqRel);
                        if n % 1000 == 0 {
                            tracing::warn!("Pointer event channel overflow, total drops: {}", n + 1);
                        }
                    }
                }
                Err(e) => {
                    drops.fetch_add(1, Ordering::AcqRel);
                    tracing::warn!("Watcher error, forcing rescan: {}", e);
                }
            },
            Config::default(),
        )
        .map_err(notify_to_io)?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(notify_to_io)?;

        Ok(Self {
            root,
            filter,
            rx,
            overflow_drops,
            seen_drops: 0,
            known: HashMap::new(),
            primed: false,
            _watcher: watcher,
        })
    }

    fn drain_touched(&self) -> HashSet<PathBuf> {
        let mut touched = HashSet::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    touched.extend(event.paths);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        touched
    }

    fn candidates(&self, touched: HashSet<PathBuf>) -> HashSet<PathBuf> {
        let mut out = HashSet::new();
        for path in touched {
            if !path.starts_with(&self.root) {
                continue;
            }
            if (self.filter)(&path) {
                out.insert(path);
                continue;
            }
            // 目录级事件：目录被整体删除 / 移入
            for known in self.known.keys() {
                if known.starts_with(&path) {
                    out.insert(known.clone());
                }
            }
            if path.is_dir() {
                // 目录可能在扫描途中再次消失，忽略即可
                if let Ok(found) = scan_tree(&path, self.filter) {
                    out.extend(found.into_keys());
                }
            }
        }
        out
    }
}

impl DirectoryWatcher for NotifyWatcher {
    fn root(&self) -> &Path {
        &self.root
    }

    fn poll(&mut self) -> Result<ChangeSet> {
        let drops = self.overflow_drops.load(Ordering::Acquire);
        let touched = self.drain_touched();

        if !self.primed || drops != self.seen_drops {
            let current = scan_tree(&self.root, self.filter)?;
            self.primed = true;
            self.seen_drops = drops;
            return Ok(diff_into(&mut self.known, current));
        }

        if !self.root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("watched root {:?} is not a directory", self.root),
            )
            .into());
        }

        let mut changes = ChangeSet::default();
        for path in self.candidates(touched) {
            match (FileStamp::of(&path), self.known.get(&path).copied()) {
                (Some(stamp), None) => {
                    self.known.insert(path.clone(), stamp);
                    changes.added.push(path);
                }
                (Some(stamp), Some(old)) if stamp != old => {
                    self.known.insert(path.clone(), stamp);
                    changes.modified.push(path);
                }
                (None, Some(_)) => {
                    self.known.remove(&path);
                    changes.removed.push(path);
                }
                _ => {}
            }
        }
        changes.sort();
        Ok(changes)
    }
}

fn notify_to_io(e: notify::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}
