//! 目录变更检测
//!
//! 两种实现满足同一契约（自上次 poll 以来新增 / 修改 / 删除的文件，按谓词过滤）：
//! - [`PollingWatcher`]：遍历 + stat 对比（默认，最稳妥）
//! - [`NotifyWatcher`]：OS 事件驱动，溢出时退化为全量对比

pub mod events;
pub mod polling;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ignore::WalkBuilder;

use crate::error::Result;

pub use events::NotifyWatcher;
pub use polling::PollingWatcher;

pub type PathFilter = fn(&Path) -> bool;

/// 一次 poll 的结果，各列表按路径排序
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn added(&self) -> &[PathBuf] {
        &self.added
    }

    pub fn modified(&self) -> &[PathBuf] {
        &self.modified
    }

    pub fn removed(&self) -> &[PathBuf] {
        &self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    fn sort(&mut self) {
        self.added.sort();
        self.modified.sort();
        self.removed.sort();
    }
}

pub trait DirectoryWatcher: Send {
    fn root(&self) -> &Path;

    /// 首次调用把根下已有的文件全部报告为 added。
    fn poll(&mut self) -> Result<ChangeSet>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    pub(crate) fn of(path: &Path) -> Option<Self> {
        let md = std::fs::metadata(path).ok()?;
        if !md.is_file() {
            return None;
        }
        Some(Self {
            modified: md.modified().ok(),
            len: md.len(),
        })
    }
}

/// 全量遍历根目录，返回匹配谓词的文件及其 stamp
pub(crate) fn scan_tree(root: &Path, filter: PathFilter) -> Result<HashMap<PathBuf, FileStamp>> {
    if !root.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("watched root {:?} is not a directory", root),
        )
        .into());
    }

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .build();

    let mut out = HashMap::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if !filter(path) {
            continue;
        }
        if let Some(stamp) = FileStamp::of(path) {
            out.insert(path.to_path_buf(), stamp);
        }
    }
    Ok(out)
}

/// known -> current 的差异；known 被替换为 current
pub(crate) fn diff_into(
    known: &mut HashMap<PathBuf, FileStamp>,
    current: HashMap<PathBuf, FileStamp>,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (path, stamp) in &current {
        match known.get(path) {
            None => changes.added.push(path.clone()),
            Some(old) if old != stamp => changes.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in known.keys() {
        if !current.contains_key(path) {
            changes.removed.push(path.clone());
        }
    }
    *known = current;
    changes.sort();
    changes
}
