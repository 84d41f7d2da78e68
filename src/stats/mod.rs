use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 运行期计数器（无锁，跨线程共享）
#[derive(Debug, Default)]
pub struct SeederStats {
    passes: AtomicU64,
    seeded: AtomicU64,
    rejected_at_capacity: AtomicU64,
    seed_failures: AtomicU64,
    broken_removed: AtomicU64,
    unseeded: AtomicU64,
}

impl SeederStats {
    pub fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seeded(&self) {
        self.seeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_at_capacity.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seed_failure(&self) {
        self.seed_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broken(&self) {
        self.broken_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unseeded(&self) {
        self.unseeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self, active_seeds: usize, registered: usize) -> SeedingReport {
        SeedingReport {
            active_seeds,
            registered,
            passes: self.passes.load(Ordering::Relaxed),
            seeded: self.seeded.load(Ordering::Relaxed),
            rejected_at_capacity: self.rejected_at_capacity.load(Ordering::Relaxed),
            seed_failures: self.seed_failures.load(Ordering::Relaxed),
            broken_removed: self.broken_removed.load(Ordering::Relaxed),
            unseeded: self.unseeded.load(Ordering::Relaxed),
        }
    }
}

/// 某一时刻的快照
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeedingReport {
    /// transport 当前注册数
    pub active_seeds: usize,
    /// reconciler 持有的 pointer 注册数
    pub registered: usize,
    pub passes: u64,
    pub seeded: u64,
    /// 因达到上限被拒绝
    pub rejected_at_capacity: u64,
    pub seed_failures: u64,
    /// 源文件缺失而被删除的 pointer
    pub broken_removed: u64,
    pub unseeded: u64,
}

impl fmt::Display for SeedingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           artifact-seeder Report                 ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║   active seeds: {:>10}                       ║", self.active_seeds)?;
        writeln!(f, "║   registered:   {:>10}                       ║", self.registered)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║   passes:       {:>10}                       ║", self.passes)?;
        writeln!(f, "║   seeded:       {:>10}                       ║", self.seeded)?;
        writeln!(f, "║   at capacity:  {:>10}                       ║", self.rejected_at_capacity)?;
        writeln!(f, "║   failures:     {:>10}                       ║", self.seed_failures)?;
        writeln!(f, "║   broken:       {:>10}                       ║", self.broken_removed)?;
        writeln!(f, "║   unseeded:     {:>10}                       ║", self.unseeded)?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
