use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::storage::write_atomic;
use crate::transport::TorrentFileFactory;

pub const TORRENT_SUFFIX: &str = ".torrent";
pub const DEFAULT_PIECE_LENGTH: u64 = 1024 * 1024;
const CREATED_BY: &str = concat!("artifact-seeder/", env!("CARGO_PKG_VERSION"));

/// 进程内使用的 torrent 描述文件（JSON）。
///
/// 只描述单文件的 piece 划分与校验值；BitTorrent 的 bencode 格式由外部传输层负责。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentDescriptor {
    pub name: String,
    pub length: u64,
    pub piece_length: u64,
    /// 每个 piece 的 xxh3-64（16 位十六进制）
    pub pieces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<String>,
    pub created_by: String,
}

impl TorrentDescriptor {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("read descriptor {:?}", path))?;
        let desc = serde_json::from_slice(&data)
            .with_context(|| format!("parse descriptor {:?}", path))?;
        Ok(desc)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data).with_context(|| format!("write descriptor {:?}", path))?;
        Ok(())
    }

    /// 名称与长度一致
    pub fn matches_source(&self, source: &Path) -> bool {
        let Ok(md) = std::fs::metadata(source) else {
            return false;
        };
        md.is_file()
            && md.len() == self.length
            && source.file_name().map(|n| n.to_string_lossy() == self.name.as_str()) == Some(true)
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

/// 在给定线程池上并行计算 piece 哈希
pub fn hash_pieces(
    source: &Path,
    piece_length: u64,
    pool: &rayon::ThreadPool,
) -> std::io::Result<Vec<String>> {
    let length = std::fs::metadata(source)?.len();
    let piece_length = piece_length.max(1);
    let count = length.div_ceil(piece_length);

    pool.install(|| {
        (0..count)
            .into_par_iter()
            .map(|i| -> std::io::Result<String> {
                let offset = i * piece_length;
                let size = piece_length.min(length - offset) as usize;
                let mut file = File::open(source)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; size];
                file.read_exact(&mut buf)?;
                Ok(format!("{:016x}", xxh3_64(&buf)))
            })
            .collect()
    })
}

/// 默认工厂：在独立的哈希线程池上生成描述文件，已存在且有效的描述文件直接复用。
pub struct DescriptorFactory {
    pool: Arc<rayon::ThreadPool>,
    piece_length: u64,
    announce: Option<String>,
}

impl DescriptorFactory {
    pub fn new(
        hashing_pool_size: usize,
        piece_length: u64,
        announce: Option<String>,
    ) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(hashing_pool_size.max(1))
            .thread_name(|i| format!("piece-hasher-{}", i))
            .build()
            .context("build piece hashing pool")?;
        Ok(Self {
            pool: Arc::new(pool),
            piece_length,
            announce,
        })
    }

    pub fn torrent_path_for(source: &Path, dest_dir: &Path) -> Option<PathBuf> {
        let mut name = source.file_name()?.to_os_string();
        name.push(TORRENT_SUFFIX);
        Some(dest_dir.join(name))
    }

    pub fn describe(&self, source: &Path) -> anyhow::Result<TorrentDescriptor> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("source {:?} has no file name", source))?;
        let length = std::fs::metadata(source)?.len();
        let pieces = hash_pieces(source, self.piece_length, &self.pool)
            .with_context(|| format!("hash pieces of {:?}", source))?;
        Ok(TorrentDescriptor {
            name,
            length,
            piece_length: self.piece_length.max(1),
            pieces,
            announce: self.announce.clone(),
            created_by: CREATED_BY.to_string(),
        })
    }
}

impl TorrentFileFactory for DescriptorFactory {
    fn create_torrent_file(&self, source: &Path, dest_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
        if !source.is_file() {
            return Ok(None);
        }
        let Some(target) = Self::torrent_path_for(source, dest_dir) else {
            return Ok(None);
        };
        if self.is_valid_torrent_file(&target, source) {
            tracing::debug!("Reusing torrent descriptor {:?}", target);
            return Ok(Some(target));
        }

        let started = std::time::Instant::now();
        let desc = self.describe(source)?;
        desc.save(&target)?;
        tracing::debug!(
            "Created torrent descriptor {:?}: {} pieces in {:?}",
            target,
            desc.piece_count(),
            started.elapsed()
        );
        Ok(Some(target))
    }

    fn is_valid_torrent_file(&self, torrent: &Path, source: &Path) -> bool {
        let Ok(desc) = TorrentDescriptor::load(torrent) else {
            return false;
        };
        if !desc.matches_source(source) {
            return false;
        }
        // 源文件在描述文件之后被改写过则视为过期
        match (
            std::fs::metadata(source).and_then(|m| m.modified()),
            std::fs::metadata(torrent).and_then(|m| m.modified()),
        ) {
            (Ok(src_m), Ok(tor_m)) => src_m <= tor_m,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("artifact-seeder-desc-{}-{}", tag, nanos))
    }

    #[test]
    fn creates_descriptor_with_expected_piece_count() {
        let dir = unique_tmp_dir("create");
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("payload.bin");
        std::fs::write(&src, vec![7u8; 2500]).unwrap();

        let factory = DescriptorFactory::new(2, 1000, Some("http://tracker/announce".into())).unwrap();
        let torrent = factory
            .create_torrent_file(&src, &dir.join("torrents"))
            .unwrap()
            .unwrap();
        assert_eq!(torrent, dir.join("torrents").join("payload.bin.torrent"));

        let desc = TorrentDescriptor::load(&torrent).unwrap();
        assert_eq!(desc.name, "payload.bin");
        assert_eq!(desc.length, 2500);
        assert_eq!(desc.piece_count(), 3);
        // 前两个 piece 内容相同
        assert_eq!(desc.pieces[0], desc.pieces[1]);
        assert_ne!(desc.pieces[1], desc.pieces[2]);
        assert!(factory.is_valid_torrent_file(&torrent, &src));
    }

    #[test]
    fn stale_descriptor_is_recreated() {
        let dir = unique_tmp_dir("stale");
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("a.bin");
        std::fs::write(&src, b"short").unwrap();

        let factory = DescriptorFactory::new(1, 4, None).unwrap();
        let torrent = factory.create_torrent_file(&src, &dir).unwrap().unwrap();

        std::fs::write(&src, b"a much longer payload").unwrap();
        assert!(!factory.is_valid_torrent_file(&torrent, &src));

        let again = factory.create_torrent_file(&src, &dir).unwrap().unwrap();
        assert_eq!(again, torrent);
        assert_eq!(TorrentDescriptor::load(&again).unwrap().length, 21);
    }

    #[test]
    fn missing_source_yields_none() {
        let dir = unique_tmp_dir("none");
        let factory = DescriptorFactory::new(1, DEFAULT_PIECE_LENGTH, None).unwrap();
        assert!(factory
            .create_torrent_file(&dir.join("nope.bin"), &dir)
            .unwrap()
            .is_none());
    }
}
