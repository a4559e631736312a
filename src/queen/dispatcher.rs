//! 作业调度器
//!
//! 专用线程把排队的作业分配给空闲节点, 每轮最多分发一个 bundle。
//! 一轮无事可做时等待唤醒(新的空闲节点或队列事件), 最长等待队列检查间隔。

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::channel::{ChannelView, ExecutionStatus, NodeChannel};
use super::kind::ChannelKind;
use super::state::NodeState;
use crate::context::DriverContext;
use crate::job::broadcast::{self, BroadcastCandidate};
use crate::job::{Job, JobSla};
use crate::policy::PolicyContext;
use crate::system_info::{keys, SystemInfo};
use crate::Result;

/// 唤醒标志, 所有可能给调度器带来工作的组件共享
#[derive(Debug, Default)]
pub struct DispatcherSignal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl DispatcherSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        *self.pending.lock() = true;
        self.cv.notify_one();
    }

    /// 等待唤醒, 被唤醒返回 true, 超时返回 false
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cv.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

pub struct JobDispatcher {
    ctx: Arc<DriverContext>,
}

impl JobDispatcher {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    pub fn run(&self) {
        log::info!("job dispatcher started");
        let interval = self.ctx.config().queue_check_interval();
        while !self.ctx.is_stopped() {
            if !self.dispatch_once() {
                self.ctx.signal().wait(interval);
            }
        }
        log::info!("job dispatcher stopped");
    }

    /// 执行一轮调度, 错误不会向外传播
    pub fn dispatch_once(&self) -> bool {
        match self.try_dispatch() {
            Ok(dispatched) => dispatched,
            Err(e) => {
                log::error!("dispatch pass failed: {}", e);
                false
            }
        }
    }

    fn try_dispatch(&self) -> Result<bool> {
        let ctx = &self.ctx;
        let queue = ctx.queue();
        if queue.has_pending_broadcasts() {
            let candidates = self.broadcast_candidates();
            if !candidates.is_empty() {
                let copies = broadcast::expand_broadcasts(queue, &candidates);
                log::debug!("{} broadcast copies queued", copies);
            }
        }
        if queue.is_empty() {
            return Ok(false);
        }

        let _scan = queue.scan_lock();
        let mut idle = ctx.idle().snapshot();
        if idle.is_empty() {
            return Ok(false);
        }
        let driver_info = ctx.driver_info(idle.len());
        let jobs = queue.jobs_by_priority();
        log::debug!("{} idle channels, {} jobs in the queue", idle.len(), jobs.len());

        for job in jobs {
            if idle.is_empty() {
                break;
            }
            if !self.job_checks(&job, &driver_info) {
                continue;
            }
            let Some(channel) = self.find_idle_channel(&job, &idle) else {
                continue;
            };
            let sla = job.sla();
            if sla.desired_node_configuration.is_some() {
                let node = channel.uuid().unwrap_or_default();
                let reservations = ctx.reservations();
                if reservations.pending_job(&node).is_none()
                    && reservations.ready_job(&node).as_deref() != Some(job.uuid())
                {
                    log::debug!("reserving node {} for job {}", node, job.uuid());
                    reservations.do_reservation(ctx, &job, &channel);
                    idle.retain(|c| c.id() != channel.id());
                    continue;
                }
            }
            return Ok(self.dispatch(&job, &channel, &sla));
        }
        Ok(false)
    }

    fn broadcast_candidates(&self) -> Vec<BroadcastCandidate> {
        self.ctx
            .connections_snapshot()
            .into_iter()
            .map(|c| c.view())
            .filter(|v| {
                !v.closed
                    && v.kind != ChannelKind::Peer
                    && matches!(v.status, ExecutionStatus::Active | ExecutionStatus::Executing)
            })
            .filter_map(|v| {
                v.uuid.map(|node_uuid| BroadcastCandidate {
                    node_uuid,
                    info: v.system_info,
                })
            })
            .collect()
    }

    /// `job` 当前是否允许分发
    fn job_checks(&self, job: &Job, driver_info: &SystemInfo) -> bool {
        let sla = job.sla();
        if job.is_cancelled() || job.is_suspended() || job.is_pending() || job.is_expired() {
            return false;
        }
        if !job.has_pending_tasks() || job.dispatch_count() >= sla.max_nodes {
            return false;
        }
        if sla.desired_node_configuration.is_some() {
            let reservations = self.ctx.reservations();
            if reservations.nb_reserved_nodes(job.uuid()) >= sla.max_nodes
                && !reservations.has_ready_node(job.uuid())
            {
                return false;
            }
        }
        if let Some(policy) = &sla.grid_policy {
            match policy.evaluate(driver_info, &policy_context(job)) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("grid policy of job {} not satisfied", job.uuid());
                    return false;
                }
                Err(e) => {
                    log::warn!("grid policy of job {} failed: {}", job.uuid(), e);
                    return false;
                }
            }
        }
        true
    }

    /// 从 `idle` 中为 `job` 挑选节点
    fn find_idle_channel(&self, job: &Arc<Job>, idle: &[Arc<NodeChannel>]) -> Option<Arc<NodeChannel>> {
        let ctx = &self.ctx;
        let config = ctx.config();
        let sla = job.sla();
        let desired = sla.desired_node_configuration.as_ref();
        let reservations = ctx.reservations();
        let nb_reserved = reservations.nb_reserved_nodes(job.uuid());
        let ready: HashSet<String> = reservations.ready_nodes(job.uuid());
        let policy_ctx = policy_context(job);
        let real_nodes = ctx.stats().real_node_count();

        let mut accepted: Vec<(Arc<NodeChannel>, ChannelView)> = Vec::new();
        for channel in idle {
            let view = channel.view();
            if view.closed
                || !view.enabled
                || view.status != ExecutionStatus::Active
                || view.state != NodeState::Idle
            {
                continue;
            }
            let Some(node_uuid) = view.uuid.as_deref() else {
                continue;
            };
            if !view.accepting_new_jobs {
                log::debug!("node {} does not accept new jobs", node_uuid);
                continue;
            }
            let caps = view.kind.capabilities();
            if caps.peer_limits && real_nodes >= config.peer_load_balance_threshold {
                continue;
            }
            if job.uuid_path().iter().any(|u| u == node_uuid) {
                log::debug!("job {} already went through node {}", job.uuid(), node_uuid);
                continue;
            }
            if caps.peer_limits && job.uuid_path().len() >= sla.max_driver_depth {
                continue;
            }
            if job.broadcast_target().is_some_and(|target| target != node_uuid) {
                continue;
            }
            if caps.peer_limits
                && view.system_info.get_i64(keys::PEER_TOTAL_NODES).unwrap_or(0) <= 0
                && !config.dispatch_to_peers_without_node
            {
                continue;
            }
            if let Some(policy) = &sla.execution_policy {
                match policy.evaluate(&view.system_info, &policy_ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::debug!("node {} rejected by the policy of job {}", node_uuid, job.uuid());
                        continue;
                    }
                    Err(e) => {
                        log::warn!(
                            "policy of job {} failed on node {}: {}",
                            job.uuid(),
                            node_uuid,
                            e
                        );
                        continue;
                    }
                }
            }
            if !job.accepts_node_group(view.node_group().as_deref()) {
                continue;
            }
            if desired.is_some() {
                if reservations.pending_job(node_uuid).is_some() {
                    continue;
                }
                let is_ready = ready.contains(node_uuid);
                if !is_ready && reservations.ready_job(node_uuid).is_some() {
                    // 已为其他作业就绪
                    continue;
                }
                if !is_ready && nb_reserved >= sla.max_nodes {
                    continue;
                }
            }
            if config.local_node_bias && caps.local_bias {
                if desired.is_none() {
                    return Some(Arc::clone(channel));
                }
                continue;
            }
            accepted.push((Arc::clone(channel), view));
        }

        if job.is_cancelled() {
            return None;
        }
        if let Some(spec) = desired {
            accepted = self.filter_lowest_distances(job, &spec.configuration, accepted);
        }
        if accepted.is_empty() {
            return None;
        }
        let pick = rand::random_range(0..accepted.len());
        Some(accepted.swap_remove(pick).0)
    }

    /// 保留与期望配置距离最近的可预留候选节点
    fn filter_lowest_distances(
        &self,
        job: &Job,
        desired: &BTreeMap<String, String>,
        candidates: Vec<(Arc<NodeChannel>, ChannelView)>,
    ) -> Vec<(Arc<NodeChannel>, ChannelView)> {
        let reservations = self.ctx.reservations();
        let mut best = u32::MAX;
        let mut kept = Vec::new();
        for (channel, view) in candidates {
            if !view.kind.capabilities().reservable {
                continue;
            }
            let node = view.uuid.as_deref().unwrap_or_default();
            if reservations.pending_job(node).as_deref() == Some(job.uuid()) {
                continue;
            }
            let score = self.ctx.distance().distance(desired, &view.system_info);
            channel.set_reservation_score(score);
            match score.cmp(&best) {
                CmpOrdering::Less => {
                    best = score;
                    kept.clear();
                    kept.push((channel, view));
                }
                CmpOrdering::Equal => kept.push((channel, view)),
                CmpOrdering::Greater => {}
            }
        }
        kept
    }

    /// 占用通道, 切分 bundle 并开始发送
    fn dispatch(&self, job: &Arc<Job>, channel: &Arc<NodeChannel>, sla: &JobSla) -> bool {
        let ctx = &self.ctx;
        if !ctx.idle().take(channel.id()) {
            log::debug!("channel {} is no longer idle", channel.id());
            return false;
        }
        let size = match channel.check_bundler(ctx.bundler_factory(), job) {
            Ok(size) => size,
            Err(e) => {
                log::error!(
                    "bundler of channel {} failed, using the fallback: {}",
                    channel.id(),
                    e
                );
                ctx.bundler_factory().fallback_bundler().bundle_size()
            }
        };
        let size = size.min(sla.max_dispatch_size).max(1);
        if job.is_cancelled() {
            ctx.idle().add(Arc::clone(channel));
            return false;
        }
        let view = channel.view();
        let node_uuid = view.uuid.clone().unwrap_or_default();
        let Some(bundle) = ctx.queue().next_bundle(job, size, &node_uuid) else {
            ctx.idle().add(Arc::clone(channel));
            return false;
        };
        let bundle = Arc::new(bundle);
        job.register_dispatch(&bundle, view.node_group());
        let count = bundle.task_count();
        match channel.submit(Arc::clone(&bundle)) {
            Ok(true) => {
                ctx.stats().tasks_dispatched(count);
                log::debug!(
                    "dispatched {} tasks of job {} to node {}",
                    count,
                    job.uuid(),
                    node_uuid
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::error!(
                    "dispatch of job {} to channel {} failed: {}",
                    job.uuid(),
                    channel.id(),
                    e
                );
                ctx.queue().rollback_bundle(&bundle);
                channel.handle_exception(&e.to_string());
                false
            }
        }
    }
}

fn policy_context(job: &Job) -> PolicyContext {
    PolicyContext {
        job_uuid: job.uuid().to_string(),
        job_name: job.name().to_string(),
        job_channels: job.dispatch_count(),
        task_count: job.task_count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::job::{NodeConfigSpec, TaskOutcome};
    use crate::config::LoadBalancingConfig;
    use crate::policy::ExecutionPolicy;
    use crate::proto::{BundleHeader, GridMessage};
    use crate::schedule::Schedule;
    use bytes::Bytes;

    fn idle_node(ctx: &Arc<DriverContext>, uuid: &str, info: SystemInfo) -> Arc<NodeChannel> {
        let channel = NodeChannel::detached(ctx, uuid, ChannelKind::Remote, info);
        ctx.idle().add(Arc::clone(&channel));
        channel
    }

    fn results_for(channel: &NodeChannel) -> GridMessage {
        let positions = channel.current_bundle().unwrap().positions();
        let blobs = positions
            .iter()
            .map(|p| Bytes::from(format!("result-{}", p)))
            .collect();
        let header = BundleHeader {
            task_positions: positions,
            ..Default::default()
        };
        GridMessage::new(header, blobs)
    }

    #[test]
    fn whole_job_goes_to_the_idle_node() {
        let (_rt, ctx) = test_context();
        let node = idle_node(&ctx, "n1", SystemInfo::new());
        let job = Job::builder("basic").task(vec![1]).task(vec![2]).build();
        ctx.queue().add_job(Arc::clone(&job));

        let dispatcher = JobDispatcher::new(Arc::clone(&ctx));
        assert!(dispatcher.dispatch_once());
        assert_eq!(node.state(), NodeState::SendingBatch);
        assert_eq!(node.current_bundle().unwrap().task_count(), 2);

        node.flush_detached().unwrap();
        assert_eq!(node.state(), NodeState::WaitingResults);
        node.message_received(results_for(&node));
        assert!(job.is_complete());
        assert_eq!(node.state(), NodeState::Idle);
        assert!(job.results().values().all(TaskOutcome::is_success));
        assert_eq!(ctx.idle().len(), 1);
    }

    #[test]
    fn policy_selects_the_tagged_node() {
        let (_rt, ctx) = test_context();
        let plain = idle_node(&ctx, "plain", SystemInfo::new());
        let gpu = idle_node(&ctx, "gpu", SystemInfo::new().with("tag", "gpu"));
        let job = Job::builder("p")
            .policy(ExecutionPolicy::equal("tag", "gpu"))
            .task(vec![0])
            .build();
        ctx.queue().add_job(Arc::clone(&job));
        assert!(JobDispatcher::new(Arc::clone(&ctx)).dispatch_once());
        assert!(gpu.current_bundle().is_some());
        assert!(plain.current_bundle().is_none());
        assert_eq!(plain.state(), NodeState::Idle);
    }

    #[test]
    fn routing_cycle_is_skipped() {
        let (_rt, ctx) = test_context();
        let node = idle_node(&ctx, "n1", SystemInfo::new());
        let job = Job::builder("cycle")
            .uuid_path(vec!["other-driver".into(), "n1".into()])
            .task(vec![0])
            .build();
        ctx.queue().add_job(Arc::clone(&job));
        assert!(!JobDispatcher::new(Arc::clone(&ctx)).dispatch_once());
        assert!(node.current_bundle().is_none());
        assert_eq!(job.pending_task_count(), 1);
    }

    #[test]
    fn claimed_node_is_not_offered_twice() {
        let (_rt, ctx) = test_context();
        let node = idle_node(&ctx, "n1", SystemInfo::new());
        let a = Job::builder("a").task(vec![0]).build();
        let b = Job::builder("b").task(vec![0]).build();
        ctx.queue().add_job(Arc::clone(&a));
        ctx.queue().add_job(Arc::clone(&b));
        let dispatcher = JobDispatcher::new(Arc::clone(&ctx));
        assert!(dispatcher.dispatch_once());
        assert!(!dispatcher.dispatch_once());
        assert_eq!(node.current_bundle().unwrap().job().uuid(), a.uuid());
        assert_eq!(b.pending_task_count(), 1);
    }

    #[test]
    fn desired_configuration_reserves_instead_of_dispatching() {
        let (_rt, ctx) = test_context();
        let node = idle_node(&ctx, "n1", SystemInfo::new().with("jvm", "8"));
        let mut configuration = BTreeMap::new();
        configuration.insert("jvm".to_string(), "17".to_string());
        let job = Job::builder("r")
            .sla(JobSla {
                desired_node_configuration: Some(NodeConfigSpec {
                    configuration,
                    force_restart: false,
                }),
                ..Default::default()
            })
            .task(vec![0])
            .build();
        ctx.queue().add_job(Arc::clone(&job));
        assert!(!JobDispatcher::new(Arc::clone(&ctx)).dispatch_once());
        assert_eq!(ctx.reservations().pending_job("n1").as_deref(), Some(job.uuid()));
        assert_eq!(node.reservation_score(), 1);
        assert!(node.current_bundle().is_none());
    }

    #[test]
    fn unknown_algorithm_falls_back_to_single_tasks() {
        let (_rt, ctx) = test_context();
        let node = idle_node(&ctx, "n1", SystemInfo::new());
        ctx.bundler_factory().set_configuration(LoadBalancingConfig {
            algorithm: "quantum".into(),
            size: 50,
            ..Default::default()
        });
        let job = Job::builder("f").task(vec![0]).task(vec![1]).task(vec![2]).build();
        ctx.queue().add_job(Arc::clone(&job));
        assert!(JobDispatcher::new(Arc::clone(&ctx)).dispatch_once());
        assert_eq!(node.current_bundle().unwrap().task_count(), 1);
        assert_eq!(job.pending_task_count(), 2);
    }

    #[test]
    fn failing_policy_skips_only_that_node() {
        let (_rt, ctx) = test_context();
        let odd = idle_node(&ctx, "odd", SystemInfo::new().with("mem", "plenty"));
        let big = idle_node(&ctx, "big", SystemInfo::new().with("mem", "16"));
        let job = Job::builder("m")
            .policy(ExecutionPolicy::at_least("mem", 4.0))
            .task(vec![0])
            .build();
        ctx.queue().add_job(Arc::clone(&job));
        assert!(JobDispatcher::new(Arc::clone(&ctx)).dispatch_once());
        assert!(big.current_bundle().is_some());
        assert!(odd.current_bundle().is_none());
        assert_eq!(odd.state(), NodeState::Idle);
    }

    #[test]
    fn resumed_broadcast_reaches_the_node() {
        let (_rt, ctx) = test_context();
        let node = idle_node(&ctx, "n1", SystemInfo::new());
        let job = Job::builder("b")
            .sla(JobSla {
                broadcast: true,
                suspended: true,
                ..Default::default()
            })
            .task(vec![0])
            .build();
        ctx.submit_job(Arc::clone(&job));
        let dispatcher = JobDispatcher::new(Arc::clone(&ctx));
        assert!(!dispatcher.dispatch_once());
        assert!(node.current_bundle().is_none());

        assert!(ctx.queue().resume_job(job.uuid()));
        assert!(dispatcher.dispatch_once());
        let bundle = node.current_bundle().unwrap();
        assert_eq!(bundle.job().parent().map(|p| p.uuid()), Some(job.uuid()));
        assert!(!bundle.job().is_suspended());
    }

    #[test]
    fn delayed_broadcast_waits_for_its_start() {
        let (_rt, ctx) = test_context();
        let node = idle_node(&ctx, "n1", SystemInfo::new());
        let job = Job::builder("later")
            .sla(JobSla {
                broadcast: true,
                start_schedule: Some(Schedule::After(Duration::from_secs(60))),
                ..Default::default()
            })
            .task(vec![0])
            .build();
        ctx.submit_job(Arc::clone(&job));
        let dispatcher = JobDispatcher::new(Arc::clone(&ctx));
        assert!(job.is_pending());
        assert!(!dispatcher.dispatch_once());
        assert!(node.current_bundle().is_none());

        job.set_pending(false);
        assert!(dispatcher.dispatch_once());
        assert!(node.current_bundle().is_some());
    }

    #[test]
    fn signal_reports_wake_ups() {
        let signal = DispatcherSignal::new();
        assert!(!signal.wait(Duration::from_millis(5)));
        signal.wake();
        assert!(signal.wait(Duration::from_millis(5)));
        assert!(!signal.wait(Duration::from_millis(5)));
    }
}
