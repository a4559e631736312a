//! 节点通道
//!
//! 每个节点连接对应一个通道。reactor 驱动读写, 调度线程通过 [`NodeChannel::submit`]
//! 交给它 bundle。状态变化在通道锁内经过状态转换表;
//! 涉及队列, 空闲集合和预留处理器的操作都在释放锁之后执行。

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

use super::handler::{self, NodeIdentity};
use super::kind::ChannelKind;
use super::state::{transition, NodeAction, NodeEvent, NodeState};
use crate::balancer::{Bundler, BundlerFactory, JobContext};
use crate::context::DriverContext;
use crate::job::{self, Job, NodeBundle, ReturnReason};
use crate::management::{ManagementConnection, ManagementInfo};
use crate::proto::{GridMessage, MessageReader, MessageWriter};
use crate::system_info::SystemInfo;
use crate::{GridError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Active,
    Executing,
    Failed,
    Disabled,
}

/// 通道关闭时节点预留的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReservationTransition {
    /// 随通道一起删除
    Remove = 0,
    /// 保留: 节点正在重启以应用预留的配置
    Keep = 1,
}

impl ReservationTransition {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReservationTransition::Keep,
            _ => ReservationTransition::Remove,
        }
    }
}

/// 调度线程判断通道所需信息的副本
#[derive(Debug, Clone)]
pub struct ChannelView {
    pub id: usize,
    pub uuid: Option<String>,
    pub kind: ChannelKind,
    pub state: NodeState,
    pub status: ExecutionStatus,
    pub closed: bool,
    pub enabled: bool,
    pub accepting_new_jobs: bool,
    pub system_info: SystemInfo,
    pub node_identifier: Option<String>,
}

impl ChannelView {
    /// 节点所属的 provisioning 分组
    pub fn node_group(&self) -> Option<String> {
        self.system_info.master_uuid().map(str::to_string)
    }
}

struct ChannelInner {
    state: NodeState,
    token: Token,
    stream: Option<TcpStream>,
    registry: Option<Registry>,
    reader: MessageReader,
    /// 传输中的消息, 为 `None` 时才能开始新消息
    writer: Option<MessageWriter>,
    bundle: Option<Arc<NodeBundle>>,
    bundler: Option<Box<dyn Bundler>>,
    algorithm: Option<String>,
    uuid: Option<String>,
    kind: ChannelKind,
    system_info: SystemInfo,
    management_info: Option<ManagementInfo>,
    management: Option<Arc<dyn ManagementConnection>>,
    status: ExecutionStatus,
    node_identifier: Option<String>,
    handshaken: bool,
}

/// 释放通道锁之后要做的工作
#[derive(Default)]
struct Effects {
    actions: Vec<NodeAction>,
    bundle: Option<Arc<NodeBundle>>,
    results: Option<GridMessage>,
    connected: bool,
    /// 通道关闭时设置
    cause: Option<String>,
    was_connected: bool,
    peer: bool,
    node_uuid: Option<String>,
}

impl ChannelInner {
    fn step(&mut self, event: NodeEvent, fx: &mut Effects) -> Result<()> {
        let t = transition(self.state, event)?;
        log::trace!("{:?} --{:?}--> {:?}", self.state, event, t.next);
        self.state = t.next;
        for action in t.actions {
            match action {
                NodeAction::WatchRead => self.watch(Interest::READABLE)?,
                NodeAction::WatchWrite => self.watch(Interest::WRITABLE)?,
                NodeAction::Deregister => {
                    self.deregister();
                    fx.actions.push(*action);
                }
                NodeAction::ReleaseResources => {
                    if let Some(mut bundler) = self.bundler.take() {
                        bundler.dispose();
                    }
                    self.management = None;
                    fx.actions.push(*action);
                }
                other => fx.actions.push(*other),
            }
        }
        Ok(())
    }

    fn watch(&mut self, interest: Interest) -> Result<()> {
        if let (Some(stream), Some(registry)) = (self.stream.as_mut(), self.registry.as_ref()) {
            registry.reregister(stream, self.token, interest)?;
        }
        Ok(())
    }

    fn deregister(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Some(registry) = self.registry.as_ref() {
                if let Err(e) = registry.deregister(&mut stream) {
                    log::debug!("deregistering {:?}: {}", self.token, e);
                }
            }
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn apply_identity(&mut self, identity: NodeIdentity) {
        self.uuid = Some(identity.uuid);
        self.kind = identity.kind;
        self.system_info = identity.info;
        self.management_info = identity.management;
        self.node_identifier = Some(identity.node_identifier);
    }
}

pub struct NodeChannel {
    id: usize,
    peer_addr: Option<SocketAddr>,
    ctx: Weak<DriverContext>,
    inner: Mutex<ChannelInner>,
    closed: AtomicBool,
    enabled: AtomicBool,
    accepting_new_jobs: AtomicBool,
    reservation_transition: AtomicU8,
    reservation_score: AtomicU32,
}

impl NodeChannel {
    fn with_inner(ctx: &Arc<DriverContext>, id: usize, peer_addr: Option<SocketAddr>, inner: ChannelInner) -> Self {
        Self {
            id,
            peer_addr,
            ctx: Arc::downgrade(ctx),
            inner: Mutex::new(inner),
            closed: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            accepting_new_jobs: AtomicBool::new(true),
            reservation_transition: AtomicU8::new(ReservationTransition::Remove as u8),
            reservation_score: AtomicU32::new(0),
        }
    }

    /// 登记新接入的连接, 并排队发送驱动握手
    pub(crate) fn open(
        ctx: &Arc<DriverContext>,
        id: usize,
        mut stream: TcpStream,
        registry: Registry,
        peer_addr: SocketAddr,
    ) -> Result<Arc<Self>> {
        let token = Token(id);
        registry.register(&mut stream, token, Interest::WRITABLE)?;
        let handshake = handler::handshake_message(ctx).encode();
        let inner = ChannelInner {
            state: NodeState::SendInitialHandshake,
            token,
            stream: Some(stream),
            registry: Some(registry),
            reader: MessageReader::new(ctx.config().max_blob_size),
            writer: Some(MessageWriter::new(handshake)),
            bundle: None,
            bundler: None,
            algorithm: None,
            uuid: None,
            kind: ChannelKind::Remote,
            system_info: SystemInfo::new(),
            management_info: None,
            management: None,
            status: ExecutionStatus::Active,
            node_identifier: None,
            handshaken: false,
        };
        Ok(Arc::new(Self::with_inner(ctx, id, Some(peer_addr), inner)))
    }

    /// 没有 socket 且已完成握手的通道, 写入直接丢弃
    #[cfg(test)]
    pub(crate) fn detached(
        ctx: &Arc<DriverContext>,
        uuid: &str,
        kind: ChannelKind,
        info: SystemInfo,
    ) -> Arc<Self> {
        use crate::system_info::keys;

        let id = ctx.next_channel_id();
        let inner = ChannelInner {
            state: NodeState::Idle,
            token: Token(id),
            stream: None,
            registry: None,
            reader: MessageReader::new(ctx.config().max_blob_size),
            writer: None,
            bundle: None,
            bundler: None,
            algorithm: None,
            uuid: Some(uuid.to_string()),
            kind,
            system_info: info.with(keys::UUID, uuid),
            management_info: None,
            management: None,
            status: ExecutionStatus::Active,
            node_identifier: Some(format!("detached:{}", uuid)),
            handshaken: true,
        };
        let channel = Arc::new(Self::with_inner(ctx, id, None, inner));
        ctx.stats().node_connected(kind == ChannelKind::Peer);
        ctx.add_connection(Arc::clone(&channel));
        channel
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn uuid(&self) -> Option<String> {
        self.inner.lock().uuid.clone()
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.lock().kind
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        self.inner.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// 禁用的通道保持连接, 但不再分配新工作
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        let mut inner = self.inner.lock();
        if !enabled && inner.status == ExecutionStatus::Active {
            inner.status = ExecutionStatus::Disabled;
        } else if enabled && inner.status == ExecutionStatus::Disabled {
            inner.status = ExecutionStatus::Active;
        }
    }

    pub fn is_accepting_new_jobs(&self) -> bool {
        self.accepting_new_jobs.load(Ordering::Acquire)
    }

    pub(crate) fn set_accepting_new_jobs(&self, accepting: bool) {
        self.accepting_new_jobs.store(accepting, Ordering::Release);
    }

    pub fn reservation_transition(&self) -> ReservationTransition {
        ReservationTransition::from_u8(self.reservation_transition.load(Ordering::Acquire))
    }

    pub(crate) fn set_reservation_transition(&self, t: ReservationTransition) {
        self.reservation_transition.store(t as u8, Ordering::Release);
    }

    /// 与最近一次评分作业的期望配置之间的距离
    pub fn reservation_score(&self) -> u32 {
        self.reservation_score.load(Ordering::Acquire)
    }

    pub(crate) fn set_reservation_score(&self, score: u32) {
        self.reservation_score.store(score, Ordering::Release);
    }

    pub fn system_info(&self) -> SystemInfo {
        self.inner.lock().system_info.clone()
    }

    pub(crate) fn merge_system_info(&self, props: &BTreeMap<String, String>) {
        let mut inner = self.inner.lock();
        inner.system_info.merge(props);
        let ChannelInner {
            bundler,
            system_info,
            ..
        } = &mut *inner;
        if let Some(bundler) = bundler.as_mut() {
            bundler.set_channel_configuration(system_info);
        }
    }

    pub(crate) fn set_property(&self, key: &str, value: impl ToString) {
        self.inner.lock().system_info.set(key, value);
    }

    pub fn management_info(&self) -> Option<ManagementInfo> {
        self.inner.lock().management_info.clone()
    }

    pub fn management(&self) -> Option<Arc<dyn ManagementConnection>> {
        self.inner.lock().management.clone()
    }

    pub(crate) fn set_management(&self, connection: Arc<dyn ManagementConnection>) {
        self.inner.lock().management = Some(connection);
    }

    pub fn node_identifier(&self) -> Option<String> {
        self.inner.lock().node_identifier.clone()
    }

    pub fn current_bundle(&self) -> Option<Arc<NodeBundle>> {
        self.inner.lock().bundle.clone()
    }

    pub fn bundler_algorithm(&self) -> Option<String> {
        self.inner.lock().algorithm.clone()
    }

    pub fn view(&self) -> ChannelView {
        let inner = self.inner.lock();
        ChannelView {
            id: self.id,
            uuid: inner.uuid.clone(),
            kind: inner.kind,
            state: inner.state,
            status: inner.status,
            closed: self.is_closed(),
            enabled: self.is_enabled(),
            accepting_new_jobs: self.is_accepting_new_jobs(),
            system_info: inner.system_info.clone(),
            node_identifier: inner.node_identifier.clone(),
        }
    }

    fn label(&self) -> String {
        match self.inner.try_lock().and_then(|inner| inner.uuid.clone()) {
            Some(uuid) => format!("{}[{}]", self.id, uuid),
            None => self.id.to_string(),
        }
    }

    fn ctx(&self) -> Result<Arc<DriverContext>> {
        self.ctx.upgrade().ok_or(GridError::Shutdown)
    }

    /// 工厂配置在 bundler 创建后变化时重建 bundler, 然后取得下一个 bundle 的大小
    pub(crate) fn check_bundler(&self, factory: &BundlerFactory, job: &Job) -> Result<usize> {
        let mut inner = self.inner.lock();
        let stale = inner
            .bundler
            .as_ref()
            .map_or(true, |b| b.timestamp() < factory.last_update_time());
        if stale {
            if let Some(mut old) = inner.bundler.take() {
                old.dispose();
            }
            let identifier = inner
                .node_identifier
                .clone()
                .unwrap_or_else(|| format!("channel-{}", self.id));
            let (algorithm, mut bundler) = factory.load_bundler(&identifier)?;
            bundler.set_channel_configuration(&inner.system_info);
            log::debug!("channel {} now uses the '{}' bundler", self.id, algorithm);
            inner.algorithm = Some(algorithm);
            inner.bundler = Some(bundler);
        }
        let bundler = inner
            .bundler
            .as_mut()
            .ok_or_else(|| GridError::Bundler("no bundler after reload".into()))?;
        bundler.set_job_context(&JobContext {
            job_uuid: job.uuid().to_string(),
            job_name: job.name().to_string(),
            task_count: job.task_count(),
        });
        Ok(bundler.bundle_size())
    }

    /// 把完成的分发反馈给 bundler, 并为该节点保存状态
    pub(crate) fn results_feedback(
        &self,
        factory: &BundlerFactory,
        task_count: usize,
        elapsed: Duration,
        node_info: &std::collections::HashMap<String, String>,
    ) {
        let mut inner = self.inner.lock();
        let ChannelInner {
            bundler,
            system_info,
            node_identifier,
            ..
        } = &mut *inner;
        if !node_info.is_empty() {
            for (k, v) in node_info {
                system_info.set(k.as_str(), v);
            }
        }
        if let Some(bundler) = bundler.as_mut() {
            bundler.feedback(task_count, elapsed);
            if !node_info.is_empty() {
                bundler.set_channel_configuration(system_info);
            }
            if let Some(identifier) = node_identifier.as_deref() {
                factory.store_bundler(identifier, bundler.as_ref());
            }
        }
    }

    /// 开始发送 `bundle`。作业已经过该节点时返回 `Ok(false)`,
    /// 此时 bundle 重新入队, 通道回到空闲
    pub fn submit(self: &Arc<Self>, bundle: Arc<NodeBundle>) -> Result<bool> {
        let ctx = self.ctx()?;
        let (fx, accepted) = {
            let mut inner = self.inner.lock();
            if self.is_closed() {
                return Err(GridError::ChannelClosed(self.id.to_string()));
            }
            if inner.bundle.is_some() || inner.writer.is_some() {
                return Err(GridError::ChannelBusy(self.id.to_string()));
            }
            let node_uuid = inner.uuid.clone().unwrap_or_default();
            let mut fx = Effects::default();
            inner.step(NodeEvent::DispatchRequested, &mut fx)?;
            inner.bundle = Some(Arc::clone(&bundle));
            inner.status = ExecutionStatus::Executing;
            if bundle.job().uuid_path().iter().any(|u| *u == node_uuid) {
                log::warn!(
                    "job {} already went through node {}, sending it back",
                    bundle.job().uuid(),
                    node_uuid
                );
                inner.step(NodeEvent::BatchRejected, &mut fx)?;
                inner.status = ExecutionStatus::Active;
                fx.bundle = inner.bundle.take();
                (fx, false)
            } else {
                let msg = handler::dispatch_message(&ctx, inner.kind, &node_uuid, &bundle);
                inner.writer = Some(MessageWriter::new(msg.encode()));
                log::debug!(
                    "sending bundle {} ({} tasks of job {}) to node {}",
                    bundle.id(),
                    bundle.task_count(),
                    bundle.job().uuid(),
                    node_uuid
                );
                (fx, true)
            }
        };
        self.apply(&ctx, fx);
        Ok(accepted)
    }

    /// socket 可读: 在不阻塞的前提下尽量读取
    pub(crate) fn on_readable(self: &Arc<Self>) {
        let read = {
            let mut inner = self.inner.lock();
            if self.is_closed() {
                return;
            }
            let ChannelInner { stream, reader, .. } = &mut *inner;
            match stream.as_mut() {
                Some(stream) => reader.read_from(stream),
                None => return,
            }
        };
        match read {
            Ok(Some(frames)) => {
                let size = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
                if let Ok(ctx) = self.ctx() {
                    ctx.stats().bytes_in(size);
                }
                match GridMessage::from_frames(frames) {
                    Ok(msg) => self.message_received(msg),
                    Err(e) => self.handle_exception(&e.to_string()),
                }
            }
            Ok(None) => {}
            Err(e) => self.handle_exception(&e.to_string()),
        }
    }

    /// socket 可写: 继续写出传输中的消息
    pub(crate) fn on_writable(self: &Arc<Self>) {
        let ctx = match self.ctx() {
            Ok(ctx) => ctx,
            Err(_) => return,
        };
        let flushed = {
            let mut inner = self.inner.lock();
            if self.is_closed() {
                return;
            }
            self.flush(&ctx, &mut inner)
        };
        match flushed {
            Ok(Some(fx)) => self.apply(&ctx, fx),
            Ok(None) => {}
            Err(e) => self.handle_exception(&e.to_string()),
        }
    }

    fn flush(&self, ctx: &DriverContext, inner: &mut ChannelInner) -> Result<Option<Effects>> {
        let ChannelInner { stream, writer, .. } = &mut *inner;
        let (Some(stream), Some(writer)) = (stream.as_mut(), writer.as_mut()) else {
            return Ok(None);
        };
        let (written, done) = writer.write_to(stream)?;
        ctx.stats().bytes_out(written);
        if !done {
            return Ok(None);
        }
        inner.writer = None;
        self.message_sent(inner).map(Some)
    }

    fn message_sent(&self, inner: &mut ChannelInner) -> Result<Effects> {
        let mut fx = Effects::default();
        match inner.state {
            NodeState::SendInitialHandshake => inner.step(NodeEvent::HandshakeSent, &mut fx)?,
            NodeState::SendingBatch => {
                inner.step(NodeEvent::BatchSent, &mut fx)?;
                fx.bundle = inner.bundle.clone();
            }
            state => {
                return Err(GridError::Protocol(format!(
                    "message flushed in state {:?}",
                    state
                )))
            }
        }
        Ok(fx)
    }

    /// 用节点发来的完整消息驱动通道
    pub(crate) fn message_received(self: &Arc<Self>, msg: GridMessage) {
        let ctx = match self.ctx() {
            Ok(ctx) => ctx,
            Err(_) => return,
        };
        let handled = {
            let mut inner = self.inner.lock();
            let mut fx = Effects::default();
            match inner.state {
                NodeState::WaitInitialHandshake => {
                    handler::read_handshake(&ctx, &msg.header, self.peer_addr).and_then(|identity| {
                        inner.apply_identity(identity);
                        inner.status = ExecutionStatus::Active;
                        inner.handshaken = true;
                        self.set_accepting_new_jobs(msg.header.accepts_new_jobs.unwrap_or(true));
                        inner.step(NodeEvent::HandshakeReceived, &mut fx)?;
                        fx.connected = true;
                        Ok(fx)
                    })
                }
                NodeState::WaitingResults => inner.step(NodeEvent::ResultsReceived, &mut fx).map(|_| {
                    inner.status = ExecutionStatus::Active;
                    fx.bundle = inner.bundle.take();
                    fx.results = Some(msg);
                    fx
                }),
                state => Err(GridError::Protocol(format!(
                    "unexpected message from node in state {:?}",
                    state
                ))),
            }
        };
        match handled {
            Ok(fx) => self.apply(&ctx, fx),
            Err(e) => self.handle_exception(&e.to_string()),
        }
    }

    /// 进行中的分发属于 `job_uuid`(或其广播副本)时取消它。
    /// 任务立即以 `reason` 失败返回, 迟到的应答被丢弃
    pub(crate) fn cancel_job(self: &Arc<Self>, job_uuid: &str, reason: ReturnReason) -> bool {
        let (bundle, management) = {
            let inner = self.inner.lock();
            match &inner.bundle {
                Some(b) if belongs_to(b.job(), job_uuid) => (Arc::clone(b), inner.management.clone()),
                _ => return false,
            }
        };
        let ctx = match self.ctx() {
            Ok(ctx) => ctx,
            Err(_) => return false,
        };
        bundle.mark_cancelled();
        ctx.dispatch_expirations().cancel_action(&bundle.key());
        if let Some(conn) = management {
            let uuid = bundle.job().uuid().to_string();
            ctx.runtime().spawn_blocking(move || {
                if let Err(e) = conn.cancel_job(&uuid, false) {
                    log::warn!("remote cancel of job {} failed: {}", uuid, e);
                }
            });
        }
        if let Some(mut finished) = bundle.finish() {
            let mut outcomes = finished.excluded_outcomes();
            let stopped = job::stopped_outcome(reason);
            outcomes.extend(finished.tasks.iter().map(|t| (t.position, stopped.clone())));
            ctx.queue().bundle_returned(&bundle, reason, outcomes, Vec::new());
        }
        true
    }

    /// 出错关闭, 可在任意线程重复调用
    pub fn handle_exception(self: &Arc<Self>, cause: &str) {
        self.close_with(NodeEvent::IoError, cause);
    }

    /// 驱动关闭时关闭通道
    pub fn close(self: &Arc<Self>) {
        self.close_with(NodeEvent::Shutdown, "driver shutdown");
    }

    fn close_with(self: &Arc<Self>, event: NodeEvent, cause: &str) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let fx = {
            let mut inner = self.inner.lock();
            let mut fx = Effects {
                cause: Some(cause.to_string()),
                was_connected: inner.handshaken,
                peer: inner.kind == ChannelKind::Peer,
                node_uuid: inner.uuid.clone(),
                ..Default::default()
            };
            fx.bundle = inner.bundle.take();
            inner.writer = None;
            inner.status = ExecutionStatus::Failed;
            if let Err(e) = inner.step(event, &mut fx) {
                log::error!("closing channel {}: {}", self.id, e);
            }
            fx
        };
        match event {
            NodeEvent::Shutdown => log::debug!("channel {} closed: {}", self.label(), cause),
            _ => log::warn!("channel {} closed: {}", self.label(), cause),
        }
        if let Ok(ctx) = self.ctx() {
            self.apply(&ctx, fx);
        }
    }

    fn apply(self: &Arc<Self>, ctx: &Arc<DriverContext>, mut fx: Effects) {
        if fx.connected {
            handler::node_connected(ctx, self);
        }
        for action in std::mem::take(&mut fx.actions) {
            match action {
                NodeAction::AddIdle => {
                    ctx.reservations().retry_pending(ctx, self);
                    ctx.idle().add(Arc::clone(self));
                }
                NodeAction::RemoveIdle => ctx.idle().remove(self.id),
                NodeAction::ScheduleExpiration => {
                    if let Some(bundle) = &fx.bundle {
                        super::expiration::schedule(ctx, self, bundle);
                    }
                }
                NodeAction::CancelExpiration => {
                    if let Some(bundle) = &fx.bundle {
                        ctx.dispatch_expirations().cancel_action(&bundle.key());
                    }
                }
                NodeAction::ProcessResults => {
                    if let (Some(bundle), Some(msg)) = (&fx.bundle, fx.results.take()) {
                        handler::results_received(ctx, self, bundle, msg);
                    }
                }
                NodeAction::ResubmitBundle => {
                    if let Some(bundle) = &fx.bundle {
                        resubmit(ctx, bundle, fx.cause.as_deref());
                    }
                }
                NodeAction::ReleaseResources => {
                    if let Some(uuid) = fx.node_uuid.as_deref() {
                        ctx.reservations()
                            .channel_closed(uuid, self.reservation_transition());
                    }
                    if fx.was_connected {
                        ctx.stats().node_disconnected(fx.peer);
                    }
                }
                NodeAction::Deregister => ctx.remove_connection(self.id),
                NodeAction::WatchRead | NodeAction::WatchWrite => {}
            }
        }
    }

    /// 假装传输中的 bundle 已全部写出
    #[cfg(test)]
    pub(crate) fn flush_detached(self: &Arc<Self>) -> Result<()> {
        let ctx = self.ctx()?;
        let fx = {
            let mut inner = self.inner.lock();
            inner.writer = None;
            self.message_sent(&mut inner)?
        };
        self.apply(&ctx, fx);
        Ok(())
    }
}

impl std::fmt::Debug for NodeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeChannel")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn belongs_to(job: &Job, job_uuid: &str) -> bool {
    job.uuid() == job_uuid || job.parent().is_some_and(|p| p.uuid() == job_uuid)
}

/// 把未完成 bundle 的任务送回队列
///
/// 没有原因时(环路拒绝)任务原样重新入队; 通道故障时,
/// 若作业开启了计数则应用重提交上限
fn resubmit(ctx: &DriverContext, bundle: &NodeBundle, cause: Option<&str>) {
    let Some(mut finished) = bundle.finish() else {
        return;
    };
    let mut outcomes = finished.excluded_outcomes();
    let (requeue, failed) = match cause {
        None => (finished.tasks, Vec::new()),
        Some(message) => {
            let sla = bundle.job().sla();
            job::resubmit_or_fail(
                &sla,
                finished.tasks,
                ReturnReason::NodeChannelError,
                message,
                sla.apply_max_resubmits_upon_node_error,
            )
        }
    };
    outcomes.extend(failed);
    if !requeue.is_empty() {
        log::info!(
            "resubmitting {} tasks of job {}",
            requeue.len(),
            bundle.job().uuid()
        );
        ctx.stats().tasks_resubmitted(requeue.len());
    }
    ctx.queue()
        .bundle_returned(bundle, ReturnReason::NodeChannelError, outcomes, requeue);
}
