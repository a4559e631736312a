//! 驱动统计
//!
//! 计数器保存在本地, 供测试和网格策略读取; 每次更新同时写入 `metrics` 门面,
//! 由宿主进程安装的 recorder 收集。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};

#[derive(Debug, Default)]
pub struct DriverStatistics {
    nodes: AtomicUsize,
    idle_nodes: AtomicUsize,
    peers: AtomicUsize,
    queued_jobs: AtomicUsize,
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_resubmitted: AtomicU64,
    dispatch_expirations: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    execution_nanos: AtomicU64,
}

/// 计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub nodes: usize,
    pub idle_nodes: usize,
    pub peers: usize,
    pub queued_jobs: usize,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_resubmitted: u64,
    pub dispatch_expirations: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub execution_nanos: u64,
}

impl DriverStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_connected(&self, peer: bool) {
        let n = self.nodes.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("grid.nodes").set(n as f64);
        if peer {
            let p = self.peers.fetch_add(1, Ordering::Relaxed) + 1;
            gauge!("grid.peers").set(p as f64);
        }
    }

    pub fn node_disconnected(&self, peer: bool) {
        let n = saturating_dec(&self.nodes);
        gauge!("grid.nodes").set(n as f64);
        if peer {
            let p = saturating_dec(&self.peers);
            gauge!("grid.peers").set(p as f64);
        }
    }

    pub fn set_idle_nodes(&self, n: usize) {
        self.idle_nodes.store(n, Ordering::Relaxed);
        gauge!("grid.nodes.idle").set(n as f64);
    }

    pub fn set_queued_jobs(&self, n: usize) {
        self.queued_jobs.store(n, Ordering::Relaxed);
        gauge!("grid.jobs.queued").set(n as f64);
    }

    pub fn tasks_dispatched(&self, n: usize) {
        self.tasks_dispatched.fetch_add(n as u64, Ordering::Relaxed);
        counter!("grid.tasks.dispatched").increment(n as u64);
    }

    pub fn tasks_completed(&self, n: usize, elapsed: Duration) {
        self.tasks_completed.fetch_add(n as u64, Ordering::Relaxed);
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.execution_nanos.fetch_add(nanos, Ordering::Relaxed);
        counter!("grid.tasks.completed").increment(n as u64);
        histogram!("grid.dispatch.elapsed_ms").record(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn tasks_resubmitted(&self, n: usize) {
        self.tasks_resubmitted.fetch_add(n as u64, Ordering::Relaxed);
        counter!("grid.tasks.resubmitted").increment(n as u64);
    }

    pub fn dispatch_expired(&self) {
        self.dispatch_expirations.fetch_add(1, Ordering::Relaxed);
        counter!("grid.dispatch.expirations").increment(1);
    }

    pub fn bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        counter!("grid.traffic.in").increment(n as u64);
    }

    pub fn bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        counter!("grid.traffic.out").increment(n as u64);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    /// 已连接的非对等驱动节点数
    pub fn real_node_count(&self) -> usize {
        self.nodes
            .load(Ordering::Relaxed)
            .saturating_sub(self.peers.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            nodes: self.nodes.load(Ordering::Relaxed),
            idle_nodes: self.idle_nodes.load(Ordering::Relaxed),
            peers: self.peers.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_resubmitted: self.tasks_resubmitted.load(Ordering::Relaxed),
            dispatch_expirations: self.dispatch_expirations.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            execution_nanos: self.execution_nanos.load(Ordering::Relaxed),
        }
    }
}

fn saturating_dec(v: &AtomicUsize) -> usize {
    let mut cur = v.load(Ordering::Relaxed);
    loop {
        let next = cur.saturating_sub(1);
        match v.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => cur = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_counts_never_underflow() {
        let stats = DriverStatistics::new();
        stats.node_connected(true);
        stats.node_disconnected(true);
        stats.node_disconnected(true);
        let snap = stats.snapshot();
        assert_eq!(snap.nodes, 0);
        assert_eq!(snap.peers, 0);
    }

    #[test]
    fn task_counters_accumulate() {
        let stats = DriverStatistics::new();
        stats.tasks_dispatched(4);
        stats.tasks_completed(3, Duration::from_millis(2));
        stats.tasks_resubmitted(1);
        let snap = stats.snapshot();
        assert_eq!(snap.tasks_dispatched, 4);
        assert_eq!(snap.tasks_completed, 3);
        assert_eq!(snap.tasks_resubmitted, 1);
        assert_eq!(snap.execution_nanos, 2_000_000);
    }
}
