//! 驱动上下文
//!
//! 调度引擎的共享状态都在这里, 显式传给各个组件。
//! 通道只持有弱引用, 上下文释放后通道随之停止。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;

use mio::Waker;
use parking_lot::RwLock;
use tokio::runtime::Handle;

use crate::balancer::BundlerFactory;
use crate::config::DriverConfig;
use crate::job::{Job, JobQueue, QueueEvent, ReturnReason};
use crate::management::ManagementConnector;
use crate::queen::channel::NodeChannel;
use crate::queen::dispatcher::DispatcherSignal;
use crate::queen::distance::{ConfigDistance, PropertyDistance};
use crate::queen::idle::IdleSet;
use crate::queen::reservation::NodeReservationHandler;
use crate::schedule::ScheduleHandler;
use crate::stats::DriverStatistics;
use crate::system_info::{keys, SystemInfo};
use crate::Result;

pub struct DriverContext {
    config: DriverConfig,
    uuid: String,
    local_addr: OnceLock<SocketAddr>,
    queue: JobQueue,
    reservations: NodeReservationHandler,
    bundler_factory: BundlerFactory,
    stats: DriverStatistics,
    idle: IdleSet,
    runtime: Handle,
    dispatch_expirations: ScheduleHandler,
    job_schedules: ScheduleHandler,
    connector: Arc<dyn ManagementConnector>,
    distance: Box<dyn ConfigDistance>,
    connections: RwLock<HashMap<usize, Arc<NodeChannel>>>,
    /// Token 0 和 1 分别属于监听器和 waker
    next_channel_id: AtomicUsize,
    signal: DispatcherSignal,
    stopped: AtomicBool,
    waker: OnceLock<Arc<Waker>>,
    local_info: SystemInfo,
}

impl DriverContext {
    /// 创建上下文并启动空闲集合 actor, 定时器和管理调用运行在 `runtime` 上
    pub fn new(
        config: DriverConfig,
        connector: Arc<dyn ManagementConnector>,
        runtime: Handle,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        Self::with_distance(config, connector, runtime, Box::new(PropertyDistance))
    }

    pub fn with_distance(
        config: DriverConfig,
        connector: Arc<dyn ManagementConnector>,
        runtime: Handle,
        distance: Box<dyn ConfigDistance>,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let uuid = config
            .driver_uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let bundler_factory = BundlerFactory::new(config.load_balancing.clone());
        let cell: Arc<OnceLock<Weak<DriverContext>>> = Arc::new(OnceLock::new());
        let on_idle_cell = Arc::clone(&cell);
        let (idle, idle_thread) = IdleSet::start(Box::new(move |n| {
            if let Some(ctx) = on_idle_cell.get().and_then(Weak::upgrade) {
                ctx.stats.set_idle_nodes(n);
                ctx.signal.wake();
            }
        }))?;
        let ctx = Arc::new(Self {
            dispatch_expirations: ScheduleHandler::new("dispatch-expiration", runtime.clone()),
            job_schedules: ScheduleHandler::new("job-schedule", runtime.clone()),
            config,
            uuid,
            local_addr: OnceLock::new(),
            queue: JobQueue::new(),
            reservations: NodeReservationHandler::new(),
            bundler_factory,
            stats: DriverStatistics::new(),
            idle,
            runtime,
            connector,
            distance,
            connections: RwLock::new(HashMap::new()),
            next_channel_id: AtomicUsize::new(2),
            signal: DispatcherSignal::new(),
            stopped: AtomicBool::new(false),
            waker: OnceLock::new(),
            local_info: SystemInfo::collect_local(),
        });
        let _ = cell.set(Arc::downgrade(&ctx));

        let weak = Arc::downgrade(&ctx);
        ctx.queue.add_listener(move |event| {
            let Some(ctx) = weak.upgrade() else { return };
            if let QueueEvent::JobRemoved(uuid) = event {
                ctx.reservations.remove_job_reservations(uuid);
                ctx.job_schedules.cancel_action(&start_key(uuid));
                ctx.job_schedules.cancel_action(&expiration_key(uuid));
            }
            ctx.stats.set_queued_jobs(ctx.queue.len());
            ctx.signal.wake();
        });
        log::info!("driver {} context ready", ctx.uuid);
        Ok((ctx, idle_thread))
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        let _ = self.local_addr.set(addr);
    }

    pub(crate) fn set_waker(&self, waker: Arc<Waker>) {
        let _ = self.waker.set(waker);
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn reservations(&self) -> &NodeReservationHandler {
        &self.reservations
    }

    pub fn bundler_factory(&self) -> &BundlerFactory {
        &self.bundler_factory
    }

    pub fn stats(&self) -> &DriverStatistics {
        &self.stats
    }

    pub fn idle(&self) -> &IdleSet {
        &self.idle
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn dispatch_expirations(&self) -> &ScheduleHandler {
        &self.dispatch_expirations
    }

    pub fn connector(&self) -> Arc<dyn ManagementConnector> {
        Arc::clone(&self.connector)
    }

    pub fn distance(&self) -> &dyn ConfigDistance {
        self.distance.as_ref()
    }

    pub(crate) fn signal(&self) -> &DispatcherSignal {
        &self.signal
    }

    pub fn wake_dispatcher(&self) {
        self.signal.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 通知 reactor 和调度线程在下一次检查时退出
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.signal.wake();
        if let Some(waker) = self.waker.get() {
            if let Err(e) = waker.wake() {
                log::warn!("waking the reactor failed: {}", e);
            }
        }
        self.dispatch_expirations.clear();
        self.job_schedules.clear();
        self.idle.shutdown();
    }

    pub(crate) fn next_channel_id(&self) -> usize {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_connection(&self, channel: Arc<NodeChannel>) {
        self.connections.write().insert(channel.id(), channel);
    }

    pub(crate) fn remove_connection(&self, id: usize) {
        if self.connections.write().remove(&id).is_some() {
            log::trace!("connection {} removed", id);
        }
    }

    pub fn connection(&self, id: usize) -> Option<Arc<NodeChannel>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn connections_snapshot(&self) -> Vec<Arc<NodeChannel>> {
        self.connections.read().values().cloned().collect()
    }

    /// 网格策略看到的网格状态
    pub fn driver_info(&self, idle_count: usize) -> SystemInfo {
        self.local_info
            .clone()
            .with(keys::DRIVER_UUID, &self.uuid)
            .with(keys::GRID_TOTAL_NODES, self.stats.node_count())
            .with(keys::GRID_IDLE_NODES, idle_count)
            .with(keys::GRID_QUEUED_JOBS, self.queue.len())
    }

    /// 作业入队, 同时登记启动和过期定时器
    pub fn submit_job(self: &Arc<Self>, job: Arc<Job>) {
        let sla = job.sla();
        let uuid = job.uuid().to_string();
        if let Some(start) = &sla.start_schedule {
            job.set_pending(true);
            let weak = Arc::downgrade(self);
            let pending = Arc::clone(&job);
            self.job_schedules.schedule_action(start_key(&uuid), start, move || {
                pending.set_pending(false);
                if let Some(ctx) = weak.upgrade() {
                    log::debug!("job {} reached its start date", pending.uuid());
                    ctx.queue.touch(pending.uuid());
                }
            });
        }
        if let Some(expiration) = &sla.expiration_schedule {
            let weak = Arc::downgrade(self);
            let expiring = uuid.clone();
            self.job_schedules
                .schedule_action(expiration_key(&uuid), expiration, move || {
                    if let Some(ctx) = weak.upgrade() {
                        log::info!("job {} expired", expiring);
                        ctx.end_job(&expiring, ReturnReason::JobExpired);
                    }
                });
        }
        self.queue.add_job(job);
    }

    /// 取消作业, 包括进行中的分发和节点预留
    pub fn cancel_job(&self, uuid: &str) -> bool {
        self.end_job(uuid, ReturnReason::Cancelled)
    }

    fn end_job(&self, uuid: &str, reason: ReturnReason) -> bool {
        let Some(job) = self.queue.cancel_job(uuid, reason) else {
            return false;
        };
        self.reservations.remove_job_reservations(uuid);
        for channel in self.connections_snapshot() {
            channel.cancel_job(job.uuid(), reason);
        }
        true
    }
}

fn start_key(job_uuid: &str) -> String {
    format!("{}:start", job_uuid)
}

fn expiration_key(job_uuid: &str) -> String {
    format!("{}:expiration", job_uuid)
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("uuid", &self.uuid)
            .field("local_addr", &self.local_addr.get())
            .field("connections", &self.connections.read().len())
            .field("queue", &self.queue)
            .finish()
    }
}

/// 使用独立运行时的上下文, 不启动 reactor 和调度线程
#[cfg(test)]
pub(crate) fn test_context() -> (tokio::runtime::Runtime, Arc<DriverContext>) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .unwrap();
    let config = DriverConfig::default().with_driver_uuid("test-driver");
    let (ctx, _idle) = DriverContext::new(
        config,
        Arc::new(crate::management::NoManagement),
        rt.handle().clone(),
    )
    .unwrap();
    (rt, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskOutcome;
    use crate::queen::dispatcher::JobDispatcher;
    use crate::queen::kind::ChannelKind;

    #[test]
    fn driver_info_reflects_the_grid() {
        let (_rt, ctx) = test_context();
        let _n = NodeChannel::detached(&ctx, "n1", ChannelKind::Remote, SystemInfo::new());
        let info = ctx.driver_info(1);
        assert_eq!(info.get(keys::DRIVER_UUID), Some("test-driver"));
        assert_eq!(info.get_i64(keys::GRID_TOTAL_NODES), Some(1));
        assert_eq!(info.get_i64(keys::GRID_IDLE_NODES), Some(1));
    }

    #[test]
    fn cancelling_releases_reservations() {
        let (_rt, ctx) = test_context();
        let job = Job::builder("c").task(vec![0]).build();
        ctx.submit_job(Arc::clone(&job));
        ctx.reservations().reserve_pending("n1", job.uuid());
        ctx.reservations().mark_ready("n2", job.uuid());
        assert!(ctx.cancel_job(job.uuid()));
        assert!(ctx.reservations().reservations().is_empty());
        assert!(job.is_complete());
        assert!(!ctx.cancel_job(job.uuid()));
    }

    #[test]
    fn expiration_reaches_tasks_in_flight() {
        let (_rt, ctx) = test_context();
        let node = NodeChannel::detached(&ctx, "n1", ChannelKind::Remote, SystemInfo::new());
        ctx.idle().add(Arc::clone(&node));
        let job = Job::builder("expiring").task(vec![0]).task(vec![1]).build();
        ctx.submit_job(Arc::clone(&job));
        assert!(JobDispatcher::new(Arc::clone(&ctx)).dispatch_once());
        node.flush_detached().unwrap();

        assert!(ctx.end_job(job.uuid(), ReturnReason::JobExpired));
        assert!(job.is_complete());
        assert_eq!(job.results().len(), 2);
        assert!(job
            .results()
            .values()
            .all(|o| *o == TaskOutcome::failed(ReturnReason::JobExpired, "job expired")));
    }
}
