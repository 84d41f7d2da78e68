//! Pointer 文件协议
//!
//! 每个待做种的 artifact 在存储根下对应一个 `<artifact 名>.link` 文本文件：
//!
//! ```text
//! line 1: 源文件绝对路径
//! line 2: torrent 描述文件绝对路径（可选）
//! ```
//!
//! 行结束符固定为 `\n`，与平台无关；读取时兼容 `\r\n`。

use std::path::{Path, PathBuf};

use crate::error::{Result, SeedError};
use crate::storage::write_atomic;

pub const POINTER_SUFFIX: &str = ".link";

/// 一条 pointer 记录
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointerRecord {
    pub link_path: PathBuf,
    pub source_file: PathBuf,
    pub torrent_file: Option<PathBuf>,
}

impl PointerRecord {
    pub fn read(link_path: &Path) -> Result<Self> {
        let bytes = std::fs::read(link_path)
            .map_err(|e| SeedError::malformed(link_path, e.to_string()))?;
        let (source_file, torrent_file) = parse(&bytes)
            .ok_or_else(|| SeedError::malformed(link_path, "missing source file line"))?;
        Ok(Self {
            link_path: link_path.to_path_buf(),
            source_file,
            torrent_file,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = encode_path(&self.source_file);
        out.push(b'\n');
        if let Some(torrent) = &self.torrent_file {
            out.extend_from_slice(&encode_path(torrent));
            out.push(b'\n');
        }
        out
    }
}

/// 在 `storage_dir` 下创建 `<basename(source)>.link`，返回 pointer 路径。
pub fn create(source: &Path, torrent: Option<&Path>, storage_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| SeedError::malformed(source, "source path has no file name"))?;
    let mut link_name = name.to_os_string();
    link_name.push(POINTER_SUFFIX);

    let record = PointerRecord {
        link_path: storage_dir.join(link_name),
        source_file: absolutize(source)?,
        torrent_file: torrent.map(absolutize).transpose()?,
    };
    write_atomic(&record.link_path, &record.encode())?;
    Ok(record.link_path)
}

/// 纯后缀判断，不做 I/O
pub fn is_pointer(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.len() > POINTER_SUFFIX.len() && n.ends_with(POINTER_SUFFIX))
        .unwrap_or(false)
}

pub fn source_file(link_path: &Path) -> Result<PathBuf> {
    PointerRecord::read(link_path).map(|r| r.source_file)
}

/// 只有一行时返回 `None`（不是错误）
pub fn torrent_file(link_path: &Path) -> Result<Option<PathBuf>> {
    PointerRecord::read(link_path).map(|r| r.torrent_file)
}

fn parse(bytes: &[u8]) -> Option<(PathBuf, Option<PathBuf>)> {
    let mut lines = bytes.split(|b| *b == b'\n').map(strip_cr);
    let source = lines.next().filter(|l| !l.is_empty())?;
    let torrent = lines.next().filter(|l| !l.is_empty());
    Some((decode_path(source), torrent.map(decode_path)))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

#[cfg(unix)]
fn encode_path(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn decode_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn encode_path(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(not(unix))]
fn decode_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}
