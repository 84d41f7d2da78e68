use std::fs;
use std::path::Path;

/// 从 `start_dir` 向上逐级删除空目录，直到（不含）`root`。
///
/// - `start_dir` 不在 `root` 之下时什么都不做。
/// - 遇到非空目录或删除失败即停止。
///
/// 返回实际删除的目录数。
pub fn remove_empty_parents(start_dir: &Path, root: &Path) -> usize {
    if !start_dir.starts_with(root) {
        return 0;
    }

    let mut removed = 0usize;
    let mut current = Some(start_dir);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        match fs::read_dir(dir) {
            Ok(mut rd) => {
                if rd.next().is_some() {
                    break;
                }
            }
            Err(_) => break,
        }
        if let Err(e) = fs::remove_dir(dir) {
            tracing::debug!("Stop cleanup at {:?}: {}", dir, e);
            break;
        }
        removed += 1;
        current = dir.parent();
    }
    removed
}

/// 删除文件（不存在视为成功）后清理空父目录。
pub fn remove_file_and_empty_parents(file: &Path, root: &Path) -> std::io::Result<()> {
    match fs::remove_file(file) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = file.parent() {
        remove_empty_parents(parent, root);
    }
    Ok(())
}
