//! 作业, 任务及其服务级别约定(SLA)
//!
//! [`Job`] 持有自己的任务, 直到任务被切分进发往某个节点的 [`NodeBundle`]。
//! 每个任务最终恰好得到一个 [`TaskOutcome`]; 没有待分发任务, 没有进行中的分发,
//! 且每个位置都有结果时作业完成。

pub mod broadcast;
pub mod bundle;
pub mod queue;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};

pub use bundle::NodeBundle;
pub use queue::{JobQueue, QueueEvent};

use crate::policy::ExecutionPolicy;
use crate::schedule::Schedule;

/// 任务序列化数据的存放位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLocation {
    Memory(Bytes),
    File(PathBuf),
}

impl DataLocation {
    pub fn load(&self) -> io::Result<Bytes> {
        match self {
            DataLocation::Memory(b) => Ok(b.clone()),
            DataLocation::File(path) => std::fs::read(path).map(Bytes::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub position: u32,
    pub data: DataLocation,
    pub resubmit_count: u32,
    pub expiration_count: u32,
    /// 覆盖作业级别的重提交上限
    pub max_resubmits: Option<u32>,
}

impl Task {
    pub fn new(position: u32, data: DataLocation) -> Self {
        Self {
            position,
            data,
            resubmit_count: 0,
            expiration_count: 0,
            max_resubmits: None,
        }
    }
}

/// 作业期望节点使用的配置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConfigSpec {
    pub configuration: BTreeMap<String, String>,
    /// 配置已匹配时也重启节点
    pub force_restart: bool,
}

#[derive(Debug, Clone)]
pub struct JobSla {
    /// 值越大越先执行
    pub priority: i32,
    pub max_nodes: usize,
    pub max_node_groups: usize,
    pub suspended: bool,
    pub broadcast: bool,
    pub execution_policy: Option<ExecutionPolicy>,
    /// 针对驱动自身看到的网格状态求值
    pub grid_policy: Option<ExecutionPolicy>,
    pub desired_node_configuration: Option<NodeConfigSpec>,
    pub dispatch_expiration: Option<Duration>,
    pub max_dispatch_expirations: u32,
    pub max_task_resubmits: u32,
    pub apply_max_resubmits_upon_node_error: bool,
    pub max_dispatch_size: usize,
    pub max_driver_depth: usize,
    pub start_schedule: Option<Schedule>,
    pub expiration_schedule: Option<Schedule>,
}

impl Default for JobSla {
    fn default() -> Self {
        Self {
            priority: 0,
            max_nodes: usize::MAX,
            max_node_groups: usize::MAX,
            suspended: false,
            broadcast: false,
            execution_policy: None,
            grid_policy: None,
            desired_node_configuration: None,
            dispatch_expiration: None,
            max_dispatch_expirations: 0,
            max_task_resubmits: 1,
            apply_max_resubmits_upon_node_error: false,
            max_dispatch_size: usize::MAX,
            max_driver_depth: usize::MAX,
            start_schedule: None,
            expiration_schedule: None,
        }
    }
}

/// 任务从分发中返回的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnReason {
    ResultsReceived,
    NodeChannelError,
    DispatchTimeout,
    Cancelled,
    JobExpired,
    NodeProcessingError,
    DriverProcessingError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(Bytes),
    Failed { reason: ReturnReason, message: String },
}

impl TaskOutcome {
    pub fn failed(reason: ReturnReason, message: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            reason,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    pub fn reason(&self) -> ReturnReason {
        match self {
            TaskOutcome::Success(_) => ReturnReason::ResultsReceived,
            TaskOutcome::Failed { reason, .. } => *reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// 等待启动时间
    Pending,
    Queued,
    Executing,
    Complete,
    Cancelled,
}

/// 作业生命周期回调, 所有方法默认为空实现
pub trait JobListener: Send + Sync {
    fn job_dispatched(&self, _job: &Job, _node_uuid: &str, _positions: &[u32]) {}
    fn job_returned(&self, _job: &Job, _reason: ReturnReason, _positions: &[u32]) {}
    fn job_ended(&self, _job: &Job) {}
}

#[derive(Debug, Clone)]
struct DispatchRecord {
    node_uuid: String,
    group: Option<String>,
}

#[derive(Debug, Default)]
struct JobState {
    /// 未分发的任务, 按位置索引
    pending: BTreeMap<u32, Task>,
    outcomes: BTreeMap<u32, TaskOutcome>,
    dispatches: HashMap<u64, DispatchRecord>,
    children_remaining: usize,
    completed: bool,
}

pub struct Job {
    uuid: String,
    name: String,
    sla: RwLock<JobSla>,
    metadata: BTreeMap<String, String>,
    data_provider: Option<Bytes>,
    uuid_path: Vec<String>,
    broadcast_target: Option<String>,
    parent: Option<Arc<Job>>,
    task_count: usize,
    sequence: AtomicU64,
    created: Instant,
    cancelled: AtomicBool,
    expired: AtomicBool,
    pending_start: AtomicBool,
    state: Mutex<JobState>,
    done: Condvar,
    listeners: RwLock<Vec<Arc<dyn JobListener>>>,
}

impl Job {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sla(&self) -> JobSla {
        self.sla.read().clone()
    }

    pub fn priority(&self) -> i32 {
        self.sla.read().priority
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.sla.write().priority = priority;
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.sla.write().suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.sla.read().suspended
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn data_provider(&self) -> Option<&Bytes> {
        self.data_provider.as_ref()
    }

    /// 作业已经经过的驱动 uuid
    pub fn uuid_path(&self) -> &[String] {
        &self.uuid_path
    }

    /// 仅广播作业的节点副本设置
    pub fn broadcast_target(&self) -> Option<&str> {
        self.broadcast_target.as_deref()
    }

    pub fn parent(&self) -> Option<&Arc<Job>> {
        self.parent.as_ref()
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sequence(&self, seq: u64) {
        self.sequence.store(seq, Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// 已取消作业的任务记录的原因
    pub(crate) fn stop_reason(&self) -> ReturnReason {
        if self.is_expired() {
            ReturnReason::JobExpired
        } else {
            ReturnReason::Cancelled
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_start.load(Ordering::Acquire)
    }

    pub(crate) fn set_pending(&self, pending: bool) {
        self.pending_start.store(pending, Ordering::Release);
    }

    pub fn add_listener(&self, listener: Arc<dyn JobListener>) {
        self.listeners.write().push(listener);
    }

    pub fn status(&self) -> JobStatus {
        let state = self.state.lock();
        if state.completed {
            if self.is_cancelled() {
                JobStatus::Cancelled
            } else {
                JobStatus::Complete
            }
        } else if self.is_pending() {
            JobStatus::Pending
        } else if state.dispatches.is_empty() {
            JobStatus::Queued
        } else {
            JobStatus::Executing
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().completed
    }

    pub fn pending_task_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// 作业当前分发到的节点数
    pub fn dispatch_count(&self) -> usize {
        self.state.lock().dispatches.len()
    }

    pub fn dispatched_nodes(&self) -> Vec<String> {
        self.state
            .lock()
            .dispatches
            .values()
            .map(|d| d.node_uuid.clone())
            .collect()
    }

    /// 再向 `group` 中的节点分发一次是否仍在 `max_node_groups` 之内
    /// 上限为 0 表示不限制
    pub fn accepts_node_group(&self, group: Option<&str>) -> bool {
        let max = self.sla.read().max_node_groups;
        let Some(group) = group else { return true };
        if max == 0 {
            return true;
        }
        let state = self.state.lock();
        let mut groups: Vec<&str> = state
            .dispatches
            .values()
            .filter_map(|d| d.group.as_deref())
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups.contains(&group) || groups.len() < max
    }

    pub fn results(&self) -> BTreeMap<u32, TaskOutcome> {
        self.state.lock().outcomes.clone()
    }

    /// 阻塞直到作业完成, 超时返回 false
    pub fn await_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.completed {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                return state.completed;
            }
        }
        true
    }

    /// 取出最多 `size` 个未分发任务, 位置小的优先
    pub(crate) fn take_tasks(&self, size: usize) -> Vec<Task> {
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(size.min(state.pending.len()));
        while out.len() < size {
            match state.pending.pop_first() {
                Some((_, task)) => out.push(task),
                None => break,
            }
        }
        out
    }

    pub(crate) fn register_dispatch(&self, bundle: &NodeBundle, group: Option<String>) {
        self.state.lock().dispatches.insert(
            bundle.id(),
            DispatchRecord {
                node_uuid: bundle.node_uuid().to_string(),
                group,
            },
        );
        let positions = bundle.positions();
        for l in self.listeners.read().iter() {
            l.job_dispatched(self, bundle.node_uuid(), &positions);
        }
    }

    /// 放回任务, 不动分发记录(分发登记之前的回滚)
    pub(crate) fn restore_tasks(&self, tasks: Vec<Task>) {
        let mut state = self.state.lock();
        for task in tasks {
            state.pending.insert(task.position, task);
        }
    }

    /// 结束分发 `bundle_id`: 记录结果, 任务重新入队, 没有剩余时完成作业。
    /// 本次调用完成了作业时返回 true
    pub(crate) fn dispatch_returned(
        &self,
        bundle_id: u64,
        reason: ReturnReason,
        outcomes: Vec<(u32, TaskOutcome)>,
        requeue: Vec<Task>,
    ) -> bool {
        let positions: Vec<u32> = outcomes
            .iter()
            .map(|(p, _)| *p)
            .chain(requeue.iter().map(|t| t.position))
            .collect();
        let completed = {
            let mut state = self.state.lock();
            state.dispatches.remove(&bundle_id);
            let cancelled = self.is_cancelled();
            for (pos, outcome) in outcomes {
                state.outcomes.insert(pos, outcome);
            }
            for task in requeue {
                if cancelled {
                    state
                        .outcomes
                        .insert(task.position, stopped_outcome(self.stop_reason()));
                } else {
                    state.pending.insert(task.position, task);
                }
            }
            self.try_complete(&mut state)
        };
        for l in self.listeners.read().iter() {
            l.job_returned(self, reason, &positions);
        }
        if completed {
            self.fire_ended();
        }
        completed
    }

    /// 标记作业已取消, 未分发的任务直接失败
    /// 作业因此完成时返回 true
    pub(crate) fn cancel(&self, reason: ReturnReason) -> bool {
        if reason == ReturnReason::JobExpired {
            self.expired.store(true, Ordering::Release);
        }
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let completed = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            for pos in pending.into_keys() {
                state.outcomes.insert(pos, stopped_outcome(reason));
            }
            self.try_complete(&mut state)
        };
        if completed {
            self.fire_ended();
        }
        completed
    }

    pub(crate) fn set_children(&self, n: usize) {
        self.state.lock().children_remaining = n;
    }

    /// 广播副本完成, 合并其结果, 成功结果优先
    pub(crate) fn child_completed(&self, child: &Job) -> bool {
        let child_outcomes = child.results();
        let completed = {
            let mut state = self.state.lock();
            state.pending.clear();
            for (pos, outcome) in child_outcomes {
                let keep = matches!(state.outcomes.get(&pos), Some(TaskOutcome::Success(_)));
                if !keep {
                    state.outcomes.insert(pos, outcome);
                }
            }
            state.children_remaining = state.children_remaining.saturating_sub(1);
            self.try_complete(&mut state)
        };
        if completed {
            self.fire_ended();
        }
        completed
    }

    /// 结束无处可运行的作业, 所有任务以未执行返回
    pub(crate) fn end_unexecuted(&self, message: &str) -> bool {
        let completed = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            for pos in pending.into_keys() {
                state
                    .outcomes
                    .insert(pos, TaskOutcome::failed(ReturnReason::Cancelled, message));
            }
            state.children_remaining = 0;
            self.try_complete(&mut state)
        };
        if completed {
            self.fire_ended();
        }
        completed
    }

    fn try_complete(&self, state: &mut JobState) -> bool {
        if state.completed
            || !state.pending.is_empty()
            || !state.dispatches.is_empty()
            || state.children_remaining > 0
            || state.outcomes.len() < self.task_count
        {
            return false;
        }
        state.completed = true;
        self.done.notify_all();
        true
    }

    fn fire_ended(&self) {
        log::debug!("job '{}' ({}) ended", self.name, self.uuid);
        for l in self.listeners.read().iter() {
            l.job_ended(self);
        }
    }

    /// 广播作业的单节点副本
    pub(crate) fn broadcast_copy(self: &Arc<Self>, node_uuid: &str) -> Arc<Job> {
        let mut sla = self.sla();
        sla.broadcast = false;
        sla.max_nodes = 1;
        let tasks: Vec<Task> = self.state.lock().pending.values().cloned().collect();
        Arc::new(Job::assemble(
            uuid::Uuid::new_v4().to_string(),
            self.name.clone(),
            sla,
            self.metadata.clone(),
            self.data_provider.clone(),
            self.uuid_path.clone(),
            Some(node_uuid.to_string()),
            Some(Arc::clone(self)),
            tasks,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        uuid: String,
        name: String,
        sla: JobSla,
        metadata: BTreeMap<String, String>,
        data_provider: Option<Bytes>,
        uuid_path: Vec<String>,
        broadcast_target: Option<String>,
        parent: Option<Arc<Job>>,
        tasks: Vec<Task>,
    ) -> Job {
        let task_count = tasks.len();
        let pending = tasks.into_iter().map(|t| (t.position, t)).collect();
        Job {
            uuid,
            name,
            sla: RwLock::new(sla),
            metadata,
            data_provider,
            uuid_path,
            broadcast_target,
            parent,
            task_count,
            sequence: AtomicU64::new(0),
            created: Instant::now(),
            cancelled: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            pending_start: AtomicBool::new(false),
            state: Mutex::new(JobState {
                pending,
                ..Default::default()
            }),
            done: Condvar::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("priority", &self.priority())
            .field("task_count", &self.task_count)
            .finish()
    }
}

pub struct JobBuilder {
    uuid: Option<String>,
    name: String,
    sla: JobSla,
    metadata: BTreeMap<String, String>,
    data_provider: Option<Bytes>,
    uuid_path: Vec<String>,
    tasks: Vec<Task>,
    listeners: Vec<Arc<dyn JobListener>>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: None,
            name: name.into(),
            sla: JobSla::default(),
            metadata: BTreeMap::new(),
            data_provider: None,
            uuid_path: Vec::new(),
            tasks: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn sla(mut self, sla: JobSla) -> Self {
        self.sla = sla;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.sla.priority = priority;
        self
    }

    pub fn policy(mut self, policy: ExecutionPolicy) -> Self {
        self.sla.execution_policy = Some(policy);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn data_provider(mut self, data: impl Into<Bytes>) -> Self {
        self.data_provider = Some(data.into());
        self
    }

    pub fn uuid_path(mut self, path: Vec<String>) -> Self {
        self.uuid_path = path;
        self
    }

    pub fn task(mut self, data: impl Into<Bytes>) -> Self {
        let pos = self.tasks.len() as u32;
        self.tasks
            .push(Task::new(pos, DataLocation::Memory(data.into())));
        self
    }

    pub fn task_file(mut self, path: impl Into<PathBuf>) -> Self {
        let pos = self.tasks.len() as u32;
        self.tasks.push(Task::new(pos, DataLocation::File(path.into())));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Arc<Job> {
        let job = Job::assemble(
            self.uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            self.name,
            self.sla,
            self.metadata,
            self.data_provider,
            self.uuid_path,
            None,
            None,
            self.tasks,
        );
        *job.listeners.write() = self.listeners;
        Arc::new(job)
    }
}

/// 把失败任务分成重提交和最终失败两部分
///
/// 不计重提交次数时全部重新入队; 计数时每个任务的计数加一,
/// 超过上限的任务以 `reason` 失败
pub(crate) fn stopped_outcome(reason: ReturnReason) -> TaskOutcome {
    let message = match reason {
        ReturnReason::JobExpired => "job expired",
        _ => "job cancelled",
    };
    TaskOutcome::failed(reason, message)
}

pub(crate) fn resubmit_or_fail(
    sla: &JobSla,
    tasks: Vec<Task>,
    reason: ReturnReason,
    message: &str,
    count_resubmits: bool,
) -> (Vec<Task>, Vec<(u32, TaskOutcome)>) {
    if !count_resubmits {
        return (tasks, Vec::new());
    }
    let mut requeue = Vec::new();
    let mut failed = Vec::new();
    for mut task in tasks {
        task.resubmit_count += 1;
        let max = task.max_resubmits.unwrap_or(sla.max_task_resubmits);
        if task.resubmit_count > max {
            failed.push((task.position, TaskOutcome::failed(reason, message)));
        } else {
            requeue.push(task);
        }
    }
    (requeue, failed)
}

/// 分发超时: 过期计数加一, 超过 `max_dispatch_expirations` 的任务失败
pub(crate) fn expire_or_fail(sla: &JobSla, tasks: Vec<Task>) -> (Vec<Task>, Vec<(u32, TaskOutcome)>) {
    let mut requeue = Vec::new();
    let mut failed = Vec::new();
    for mut task in tasks {
        task.expiration_count += 1;
        if task.expiration_count > sla.max_dispatch_expirations {
            failed.push((
                task.position,
                TaskOutcome::failed(ReturnReason::DispatchTimeout, "dispatch expired"),
            ));
        } else {
            requeue.push(task);
        }
    }
    (requeue, failed)
}
