use std::path::{Component, Path, PathBuf};

use anyhow::bail;

use crate::pointer;
use crate::transport::TorrentFileFactory;

/// 为 artifact 生成描述文件与 pointer，放在 `storage_root/relative_dir` 下。
///
/// 小于 `threshold` 的文件不发布，返回 `Ok(None)`。
pub fn publish_artifact(
    factory: &dyn TorrentFileFactory,
    storage_root: &Path,
    artifact: &Path,
    relative_dir: &Path,
    threshold: u64,
) -> anyhow::Result<Option<PathBuf>> {
    if relative_dir
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("{:?} must be a relative path inside the storage root", relative_dir);
    }

    let md = std::fs::metadata(artifact)?;
    if !md.is_file() || md.len() < threshold {
        tracing::debug!(
            "Not publishing {:?}: {} bytes below threshold {}",
            artifact,
            md.len(),
            threshold
        );
        return Ok(None);
    }

    let dir = storage_root.join(relative_dir);
    let Some(torrent) = factory.create_torrent_file(artifact, &dir)? else {
        return Ok(None);
    };
    let link = pointer::create(artifact, Some(&torrent), &dir)?;
    tracing::info!("Published {:?} as {:?}", artifact, link);
    Ok(Some(link))
}
