use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::watcher::{diff_into, scan_tree, ChangeSet, DirectoryWatcher, FileStamp, PathFilter};

/// 轮询式 watcher：每次 poll 全量遍历 + (mtime, len) 对比。
///
/// 中间状态（两次 poll 之间的 创建→删除）会被合并掉，这对 reconciler 是可接受的。
pub struct PollingWatcher {
    root: PathBuf,
    filter: PathFilter,
    known: HashMap<PathBuf, FileStamp>,
}

impl PollingWatcher {
    pub fn new(root: PathBuf, filter: PathFilter) -> Self {
        Self {
            root,
            filter,
            known: HashMap::new(),
        }
    }
}

impl DirectoryWatcher for PollingWatcher {
    fn root(&self) -> &Path {
        &self.root
    }

    fn poll(&mut self) -> Result<ChangeSet> {
        let current = scan_tree(&self.root, self.filter)?;
        Ok(diff_into(&mut self.known, current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::is_pointer;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("artifact-seeder-poll-{}-{}", tag, nanos))
    }

    #[test]
    fn reports_added_modified_removed_pointer_files_only() {
        let root = unique_tmp_dir("diff");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        let a = root.join("a.zip.link");
        let b = root.join("sub").join("b.zip.link");
        std::fs::write(&a, "/src/a.zip\n").unwrap();
        std::fs::write(&b, "/src/b.zip\n").unwrap();
        std::fs::write(root.join("a.zip.torrent"), "{}").unwrap();

        let mut w = PollingWatcher::new(root.clone(), is_pointer);
        let first = w.poll().unwrap();
        assert_eq!(first.added(), &[a.clone(), b.clone()]);
        assert!(first.modified().is_empty() && first.removed().is_empty());

        assert!(w.poll().unwrap().is_empty());

        // 改变长度保证即使 mtime 粒度较粗也能检测到修改
        std::fs::write(&a, "/src/a.zip\n/src/a.zip.torrent\n").unwrap();
        std::fs::remove_file(&b).unwrap();
        let c = root.join("c.zip.link");
        std::fs::write(&c, "/src/c.zip\n").unwrap();

        let next = w.poll().unwrap();
        assert_eq!(next.added(), &[c]);
        assert_eq!(next.modified(), &[a]);
        assert_eq!(next.removed(), &[b]);
    }

    #[test]
    fn missing_root_is_an_error_not_a_mass_removal() {
        let root = unique_tmp_dir("missing");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.link"), "/src/a\n").unwrap();

        let mut w = PollingWatcher::new(root.clone(), is_pointer);
        assert_eq!(w.poll().unwrap().added().len(), 1);

        std::fs::remove_dir_all(&root).unwrap();
        assert!(w.poll().is_err());
    }
}
