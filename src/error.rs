use std::path::PathBuf;

/// 种子引擎错误
///
/// 单个 pointer 的错误只影响该 pointer，不会中断整个 reconciliation pass。
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// pointer 文件不可读或缺少首行（源文件路径）
    #[error("malformed pointer file {path:?}: {reason}")]
    MalformedPointer { path: PathBuf, reason: String },

    /// transport 未启动或拒绝注册（例如已达上限）
    #[error("torrent transport unavailable: {0}")]
    TransportUnavailable(String),

    /// 索引文件读写失败
    #[error("index persistence failed for {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SeedError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SeedError::MalformedPointer {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SeedError::Persistence {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SeedError>;
