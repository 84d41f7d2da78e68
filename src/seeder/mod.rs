//! 做种编排
//!
//! - [`SeedingReconciler`]：扫描存储根下的 pointer 文件，驱动 seed / unseed
//! - [`IndexedSeeder`]：调用方直接登记 (源文件, torrent)，由有界索引淘汰驱动 unseed

pub mod directory;
pub mod indexed;
pub mod publish;

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub use directory::{ReconcilerOptions, SeedingReconciler};
pub use indexed::IndexedSeeder;
pub use publish::publish_artifact;

/// 后台循环的句柄：通知退出并等待进行中的 pass 结束
pub(crate) struct LoopHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Arc<Notify>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(f(shutdown.clone()));
        Self { shutdown, join }
    }

    pub(crate) async fn shutdown(self) {
        // notify_one 会保存 permit：循环正忙于某个 pass 时也不会丢失
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            tracing::error!("Seeder loop terminated abnormally: {}", e);
        }
    }
}
