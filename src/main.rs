use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use artifact_seeder::config::{SeederConfig, WatcherKind};
use artifact_seeder::index::BoundedTorrentIndex;
use artifact_seeder::seeder::{publish_artifact, IndexedSeeder, SeedingReconciler};
use artifact_seeder::transport::{DescriptorFactory, LocalTransport};

#[derive(Parser, Debug)]
#[command(name = "artifact-seeder", version, about = "Seeds build artifacts described by pointer files")]
struct Cli {
    /// 配置文件（默认 <config_dir>/artifact-seeder/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 覆盖配置中的存储根
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// 扫描存储根下的 pointer 文件
    Directory,
    /// 只做种 torrents.db 中登记的条目
    Indexed,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动做种，直到 Ctrl-C
    Run {
        #[arg(long, value_enum, default_value = "directory")]
        mode: Mode,
        #[arg(long, value_enum)]
        watcher: Option<WatcherKind>,
    },
    /// 为 artifact 生成描述文件与 pointer
    Publish {
        file: PathBuf,
        /// 存储根下的相对目录
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// 忽略文件大小阈值
        #[arg(long)]
        force: bool,
    },
    /// 登记已有的 (源文件, torrent) 到索引
    Register { source: PathBuf, torrent: PathBuf },
    /// 打印持久化索引
    Index {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = SeederConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.storage_dir {
        cfg.storage_dir = dir;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run { mode, watcher } => {
            if let Some(kind) = watcher {
                cfg.watcher = kind;
            }
            match mode {
                Mode::Directory => run_directory(cfg).await,
                Mode::Indexed => run_indexed(cfg).await,
            }
        }
        Command::Publish { file, dir, force } => {
            let factory = DescriptorFactory::new(
                cfg.piece_hashing_pool_size,
                cfg.piece_length,
                cfg.announce_url.clone(),
            )?;
            let threshold = if force { 0 } else { cfg.file_size_threshold_bytes };
            match publish_artifact(&factory, &cfg.storage_dir, &file, &dir, threshold)? {
                Some(link) => println!("{}", link.display()),
                None => println!(
                    "{} is below the {} byte threshold, not published",
                    file.display(),
                    threshold
                ),
            }
            Ok(())
        }
        Command::Register { source, torrent } => {
            let index = BoundedTorrentIndex::open(cfg.index_file(), cfg.seed_limit(), None, None);
            index.add_file_and_torrent(&source, &torrent);
            index.flush()?;
            info!("Registered {:?} -> {:?}", source, torrent);
            Ok(())
        }
        Command::Index { file } => {
            let path = file.unwrap_or_else(|| cfg.index_file());
            let index = BoundedTorrentIndex::open(path, usize::MAX, None, None);
            for entry in index.entries() {
                println!(
                    "{}\t{}",
                    entry.source_file.display(),
                    entry.torrent_file.display()
                );
            }
            Ok(())
        }
    }
}

async fn run_directory(cfg: SeederConfig) -> anyhow::Result<()> {
    info!("Starting artifact-seeder on {:?}", cfg.storage_dir);

    let transport = Arc::new(LocalTransport::with_validation(cfg.worker_pool_size)?);
    let factory = Arc::new(DescriptorFactory::new(
        cfg.piece_hashing_pool_size,
        cfg.piece_length,
        cfg.announce_url.clone(),
    )?);
    let reconciler = Arc::new(
        SeedingReconciler::from_config(&cfg, transport, factory)
            .with_context(|| format!("open storage {:?}", cfg.storage_dir))?,
    );
    reconciler.start(&cfg.bind_addresses).await?;

    let reporter = {
        let reconciler = reconciler.clone();
        let period = cfg.report_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                info!("\n{}", reconciler.report());
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    reporter.abort();
    reconciler.stop().await;
    Ok(())
}

async fn run_indexed(cfg: SeederConfig) -> anyhow::Result<()> {
    info!("Starting indexed seeder on {:?}", cfg.storage_dir);
    std::fs::create_dir_all(&cfg.storage_dir)?;

    let transport = Arc::new(LocalTransport::with_validation(cfg.worker_pool_size)?);
    let seeder = Arc::new(IndexedSeeder::new(
        &cfg.storage_dir,
        cfg.seed_limit(),
        None,
        transport,
        &cfg,
    ));
    seeder.start(&cfg.bind_addresses).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    seeder.stop().await;
    Ok(())
}
