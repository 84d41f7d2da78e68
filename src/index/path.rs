use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 索引中路径的存储形式与真实路径之间的转换（路径虚拟化）。
///
/// 存储形式是 UTF-8 文本（索引文件按行存储）。非 UTF-8 路径按
/// `to_string_lossy` 有损保存，读回后不等于原路径，此类条目会在
/// `cleanup_broken_files` 中被当作失效条目移除。
pub trait PathConverter: Send + Sync {
    fn to_stored(&self, path: &Path) -> String;
    fn to_path(&self, stored: &str) -> PathBuf;
}

/// 默认：原样存绝对路径；仅 UTF-8 路径可无损往返
#[derive(Clone, Copy, Debug, Default)]
pub struct AbsolutePaths;

impl PathConverter for AbsolutePaths {
    fn to_stored(&self, path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    fn to_path(&self, stored: &str) -> PathBuf {
        PathBuf::from(stored)
    }
}

type RootProvider = dyn Fn() -> Option<PathBuf> + Send + Sync;

/// 相对某个根目录存储路径。
///
/// 根目录由回调惰性提供：根未知时，相对路径保持原样，直到根可用才解析为绝对路径。
/// 不在根之下的路径照旧存绝对路径。
#[derive(Clone)]
pub struct ParentDirConverter {
    root: Arc<RootProvider>,
}

impl ParentDirConverter {
    pub fn new<F>(root: F) -> Self
    where
        F: Fn() -> Option<PathBuf> + Send + Sync + 'static,
    {
        Self {
            root: Arc::new(root),
        }
    }

    pub fn fixed(root: PathBuf) -> Self {
        Self::new(move || Some(root.clone()))
    }
}

impl std::fmt::Debug for ParentDirConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentDirConverter")
            .field("root", &(self.root)())
            .finish()
    }
}

impl PathConverter for ParentDirConverter {
    fn to_stored(&self, path: &Path) -> String {
        if let Some(root) = (self.root)() {
            if let Ok(rel) = path.strip_prefix(&root) {
                if !rel.as_os_str().is_empty() {
                    return rel.to_string_lossy().into_owned();
                }
            }
        }
        path.to_string_lossy().into_owned()
    }

    fn to_path(&self, stored: &str) -> PathBuf {
        let p = PathBuf::from(stored);
        if p.is_absolute() {
            return p;
        }
        match (self.root)() {
            Some(root) => root.join(p),
            None => p,
        }
    }
}
