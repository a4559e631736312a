//! 消息处理: 握手, 分发消息和结果
//!
//! 这里的函数不持有通道锁运行, 只有通道在锁内调用的纯构造函数例外:
//! [`handshake_message`], [`read_handshake`] 和 [`dispatch_message`]。

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use super::channel::NodeChannel;
use super::kind::ChannelKind;
use crate::context::DriverContext;
use crate::job::{self, JobSla, NodeBundle, ReturnReason, TaskOutcome};
use crate::management::{ManagementConnection, ManagementInfo};
use crate::proto::{BundleHeader, GridMessage};
use crate::system_info::{keys, SystemInfo};
use crate::{GridError, Result};

/// 节点在握手中提供的自身信息
#[derive(Debug, Clone)]
pub(crate) struct NodeIdentity {
    pub uuid: String,
    pub kind: ChannelKind,
    pub info: SystemInfo,
    pub management: Option<ManagementInfo>,
    pub node_identifier: String,
}

/// 每个连接开头的无任务消息
pub(crate) fn handshake_message(ctx: &DriverContext) -> GridMessage {
    let mut parameters = HashMap::new();
    parameters.insert(keys::DRIVER_UUID.to_string(), ctx.uuid().to_string());
    if let Some(addr) = ctx.local_addr() {
        parameters.insert("driver.address".to_string(), addr.to_string());
    }
    let header = BundleHeader {
        handshake: true,
        driver_uuid: ctx.uuid().to_string(),
        parameters,
        ..Default::default()
    };
    GridMessage::new(header, Vec::new())
}

pub(crate) fn read_handshake(
    ctx: &DriverContext,
    header: &BundleHeader,
    peer_addr: Option<SocketAddr>,
) -> Result<NodeIdentity> {
    if !header.handshake {
        return Err(GridError::Protocol("expected a handshake from the node".into()));
    }
    if header.node_uuid.is_empty() {
        return Err(GridError::Protocol("node handshake without a uuid".into()));
    }
    let uuid = header.node_uuid.clone();
    let kind = ChannelKind::from_flags(header.is_peer, header.is_local);
    let mut info: SystemInfo = header
        .system_info
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    info.set(keys::UUID, &uuid);
    info.set(keys::PEER, header.is_peer);
    info.set(keys::LOCAL, header.is_local);

    let management = if ctx.config().management_enabled && !header.management_host.is_empty() {
        let port = u16::try_from(header.management_port).map_err(|_| {
            GridError::Protocol(format!("invalid management port {}", header.management_port))
        })?;
        Some(ManagementInfo {
            host: header.management_host.clone(),
            port,
            node_uuid: uuid.clone(),
            is_master: info.get_bool(keys::PROVISIONING_MASTER),
            is_slave: info.get_bool(keys::PROVISIONING_SLAVE),
            master_uuid: info.master_uuid().map(str::to_string),
            is_peer: header.is_peer,
        })
    } else {
        None
    };

    let endpoint = if !header.management_host.is_empty() {
        format!("{}:{}", header.management_host, header.management_port)
    } else {
        peer_addr.map_or_else(|| "unknown".to_string(), |a| a.ip().to_string())
    };
    let node_identifier = node_identifier(ctx.local_addr(), &endpoint, kind, &info);
    Ok(NodeIdentity {
        uuid,
        kind,
        info,
        management,
        node_identifier,
    })
}

/// 节点重启后保持不变的标识: 驱动地址, 节点端点, 角色和 provisioning 角色
pub(crate) fn node_identifier(
    driver: Option<SocketAddr>,
    endpoint: &str,
    kind: ChannelKind,
    info: &SystemInfo,
) -> String {
    let driver = driver.map_or_else(String::new, |a| a.to_string());
    let provisioning = if info.get_bool(keys::PROVISIONING_MASTER) {
        ":master"
    } else if info.get_bool(keys::PROVISIONING_SLAVE) {
        ":slave"
    } else {
        ""
    };
    format!("[{}]{}:{}{}", driver, endpoint, kind.role(), provisioning)
}

/// 节点完成握手, 即将进入空闲
pub(crate) fn node_connected(ctx: &Arc<DriverContext>, channel: &Arc<NodeChannel>) {
    let view = channel.view();
    ctx.stats().node_connected(view.kind == ChannelKind::Peer);
    log::info!(
        "node {} connected from {:?} as {}",
        view.uuid.as_deref().unwrap_or("?"),
        channel.peer_addr(),
        view.kind.role()
    );
    ctx.reservations().transition_reservation(channel, ctx.queue());
    if let Some(info) = channel.management_info() {
        connect_management(ctx, channel, info);
    }
}

fn connect_management(ctx: &Arc<DriverContext>, channel: &Arc<NodeChannel>, info: ManagementInfo) {
    let weak_ctx = Arc::downgrade(ctx);
    let weak_channel = Arc::downgrade(channel);
    let connector = ctx.connector();
    ctx.runtime().spawn_blocking(move || match connector.connect(&info) {
        Ok(conn) => {
            let (Some(ctx), Some(channel)) = (weak_ctx.upgrade(), weak_channel.upgrade()) else {
                return;
            };
            if channel.is_closed() {
                return;
            }
            log::debug!(
                "management connection to node {} at {}:{}",
                info.node_uuid,
                info.host,
                info.port
            );
            channel.set_management(Arc::clone(&conn));
            if channel.kind().capabilities().polls_peer_attributes {
                poll_peer_attributes(&ctx, &channel, conn);
            }
            ctx.reservations().retry_pending(&ctx, &channel);
        }
        Err(e) => log::warn!(
            "no management connection to node {}: {}",
            info.node_uuid,
            e
        ),
    });
}

/// 在通道关闭前持续更新对等通道的 `peer.total.nodes`
fn poll_peer_attributes(
    ctx: &Arc<DriverContext>,
    channel: &Arc<NodeChannel>,
    conn: Arc<dyn ManagementConnection>,
) {
    let period = ctx.config().peer_poll_interval();
    let weak = Arc::downgrade(channel);
    ctx.runtime().spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(channel) = weak.upgrade() else { break };
            if channel.is_closed() || !conn.is_connected() {
                break;
            }
            let query = Arc::clone(&conn);
            match tokio::task::spawn_blocking(move || query.peer_node_count()).await {
                Ok(Ok(Some(n))) => channel.set_property(keys::PEER_TOTAL_NODES, n),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => log::warn!("peer attribute poll of channel {}: {}", channel.id(), e),
                Err(e) => {
                    log::error!("peer attribute poll of channel {} aborted: {}", channel.id(), e);
                    break;
                }
            }
        }
        log::debug!("peer attribute polling stopped");
    });
}

fn sla_parameters(sla: &JobSla) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("sla.priority".to_string(), sla.priority.to_string());
    params.insert(
        "sla.max_task_resubmits".to_string(),
        sla.max_task_resubmits.to_string(),
    );
    if let Some(timeout) = sla.dispatch_expiration {
        params.insert(
            "sla.dispatch_expiration_ms".to_string(),
            timeout.as_millis().to_string(),
        );
    }
    params
}

/// 构造 `bundle` 的消息。数据无法读取的任务以序列化失败移出 bundle,
/// 其余任务照常发送
pub(crate) fn dispatch_message(
    ctx: &DriverContext,
    kind: ChannelKind,
    node_uuid: &str,
    bundle: &NodeBundle,
) -> GridMessage {
    let job = bundle.job();
    let sla = job.sla();
    let mut blobs = vec![job.data_provider().cloned().unwrap_or_default()];
    let mut positions = Vec::new();
    let mut resubmit_counts = Vec::new();
    let mut max_resubmits = Vec::new();
    for task in bundle.tasks() {
        match task.data.load() {
            Ok(data) => {
                positions.push(task.position);
                resubmit_counts.push(task.resubmit_count);
                max_resubmits.push(task.max_resubmits.unwrap_or(sla.max_task_resubmits));
                blobs.push(data);
            }
            Err(e) => {
                let err = GridError::TaskSerialization {
                    position: task.position,
                    reason: e.to_string(),
                };
                log::warn!("job {}: {}", job.uuid(), err);
                bundle.exclude(
                    task.position,
                    TaskOutcome::failed(ReturnReason::DriverProcessingError, err.to_string()),
                );
            }
        }
    }
    let mut uuid_path = job.uuid_path().to_vec();
    uuid_path.push(ctx.uuid().to_string());
    if !kind.capabilities().forwards_task_positions {
        max_resubmits.clear();
    }
    let header = BundleHeader {
        job_uuid: job.uuid().to_string(),
        job_name: job.name().to_string(),
        bundle_id: bundle.id(),
        task_count: positions.len() as u32,
        task_positions: positions,
        resubmit_counts,
        max_resubmits,
        metadata: job
            .metadata()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        parameters: sla_parameters(&sla),
        uuid_path,
        node_uuid: node_uuid.to_string(),
        driver_uuid: ctx.uuid().to_string(),
        max_task_resubmits: sla.max_task_resubmits,
        ..Default::default()
    };
    GridMessage::new(header, blobs)
}

/// 节点返回了 `bundle` 的结果
pub(crate) fn results_received(
    ctx: &Arc<DriverContext>,
    channel: &NodeChannel,
    bundle: &Arc<NodeBundle>,
    msg: GridMessage,
) {
    let GridMessage { header, blobs } = msg;
    channel.set_accepting_new_jobs(header.accepts_new_jobs.unwrap_or(true));
    let Some(mut finished) = bundle.finish() else {
        log::debug!(
            "discarding late results of bundle {} (expired: {}, cancelled: {})",
            bundle.id(),
            bundle.is_expired(),
            bundle.is_cancelled()
        );
        return;
    };
    let job = Arc::clone(bundle.job());
    let sla = job.sla();
    let elapsed = bundle.elapsed();
    let task_count = finished.tasks.len();
    let mut outcomes = finished.excluded_outcomes();
    let mut requeue = Vec::new();

    if let Some(error) = header.node_exception.as_deref() {
        log::warn!(
            "node {} failed bundle {} of job {}: {}",
            bundle.node_uuid(),
            bundle.id(),
            job.uuid(),
            error
        );
        outcomes.extend(finished.tasks.iter().map(|t| {
            (
                t.position,
                TaskOutcome::failed(ReturnReason::NodeProcessingError, error),
            )
        }));
    } else if job.is_cancelled() || bundle.is_cancelled() {
        let stopped = job::stopped_outcome(job.stop_reason());
        outcomes.extend(finished.tasks.iter().map(|t| (t.position, stopped.clone())));
    } else if header.requeue {
        log::debug!("node asked to requeue bundle {}", bundle.id());
        requeue = finished.tasks;
    } else {
        let mut results: HashMap<u32, Bytes> = header
            .task_positions
            .iter()
            .copied()
            .zip(blobs)
            .collect();
        let resubmit: HashSet<u32> = header.resubmit_positions.iter().copied().collect();
        let mut to_resubmit = Vec::new();
        for task in finished.tasks {
            let pos = task.position;
            if let Some(error) = header.task_errors.get(&pos) {
                outcomes.push((
                    pos,
                    TaskOutcome::failed(ReturnReason::NodeProcessingError, error.clone()),
                ));
            } else if resubmit.contains(&pos) {
                to_resubmit.push(task);
            } else if let Some(data) = results.remove(&pos) {
                outcomes.push((pos, TaskOutcome::Success(data)));
            } else {
                outcomes.push((
                    pos,
                    TaskOutcome::failed(
                        ReturnReason::DriverProcessingError,
                        "node returned no result for the task",
                    ),
                ));
            }
        }
        let (resubmitted, failed) = job::resubmit_or_fail(
            &sla,
            to_resubmit,
            ReturnReason::NodeProcessingError,
            "resubmission requested by the node",
            true,
        );
        requeue = resubmitted;
        outcomes.extend(failed);
    }

    if !requeue.is_empty() {
        ctx.stats().tasks_resubmitted(requeue.len());
    }
    ctx.stats()
        .tasks_completed(task_count - requeue.len().min(task_count), elapsed);
    channel.results_feedback(ctx.bundler_factory(), task_count, elapsed, &header.system_info);
    log::debug!(
        "bundle {} of job {} returned by node {} after {:?}",
        bundle.id(),
        job.uuid(),
        bundle.node_uuid(),
        elapsed
    );
    ctx.queue()
        .bundle_returned(bundle, ReturnReason::ResultsReceived, outcomes, requeue);
}
