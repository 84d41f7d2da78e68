use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// 原子替换写入（write-to-temp then rename）
///
/// 落盘流程：
/// 1) 写 `<name>.tmp`
/// 2) fsync(tmpfile)
/// 3) rename(tmp, target)：POSIX 保证原子替换
/// 4) fsync(dir)：best-effort
///
/// 读者要么看到旧内容，要么看到完整的新内容；崩溃时最多残留一个 `.tmp` 文件。
/// 临时文件名不带原后缀，因此不会被按后缀过滤的 watcher 当成 pointer。
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = tmp_path_for(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return result;
    }

    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
