//! 节点预留
//!
//! 期望节点使用指定配置的作业先预留节点。节点应用配置(必要时重启)期间为 *pending*,
//! 带着该配置重新接入后为 *ready*。一个节点 uuid 不会同时出现在两个表中,
//! 所有表在同一把锁下更新, 节点不会从公共池中泄漏。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::channel::{NodeChannel, ReservationTransition};
use crate::context::DriverContext;
use crate::job::{Job, JobQueue};
use crate::system_info::keys;

#[derive(Debug, Default)]
struct Maps {
    /// 节点 uuid -> 作业 uuid
    pending: HashMap<String, String>,
    ready: HashMap<String, String>,
    /// 作业 uuid -> 节点 uuid 集合
    job_pending: HashMap<String, HashSet<String>>,
    job_ready: HashMap<String, HashSet<String>>,
    /// 配置推送需要重试的节点及对应作业
    retry: HashMap<String, String>,
}

impl Maps {
    fn remove_node(&mut self, node: &str) -> bool {
        let mut removed = false;
        if let Some(job) = self.pending.remove(node) {
            unlink(&mut self.job_pending, &job, node);
            removed = true;
        }
        if let Some(job) = self.ready.remove(node) {
            unlink(&mut self.job_ready, &job, node);
            removed = true;
        }
        self.retry.remove(node);
        removed
    }

    fn remove_job(&mut self, job: &str) -> usize {
        let mut removed = 0;
        if let Some(nodes) = self.job_pending.remove(job) {
            for node in nodes {
                self.pending.remove(&node);
                self.retry.remove(&node);
                removed += 1;
            }
        }
        if let Some(nodes) = self.job_ready.remove(job) {
            for node in nodes {
                self.ready.remove(&node);
                removed += 1;
            }
        }
        removed
    }

    fn insert_pending(&mut self, node: &str, job: &str) {
        self.remove_node(node);
        self.pending.insert(node.to_string(), job.to_string());
        self.job_pending
            .entry(job.to_string())
            .or_default()
            .insert(node.to_string());
    }

    fn insert_ready(&mut self, node: &str, job: &str) {
        self.remove_node(node);
        self.ready.insert(node.to_string(), job.to_string());
        self.job_ready
            .entry(job.to_string())
            .or_default()
            .insert(node.to_string());
    }
}

fn unlink(map: &mut HashMap<String, HashSet<String>>, job: &str, node: &str) {
    if let Some(nodes) = map.get_mut(job) {
        nodes.remove(node);
        if nodes.is_empty() {
            map.remove(job);
        }
    }
}

/// 全部预留的副本
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationSnapshot {
    pub pending: BTreeMap<String, String>,
    pub ready: BTreeMap<String, String>,
    pub job_pending: BTreeMap<String, BTreeSet<String>>,
    pub job_ready: BTreeMap<String, BTreeSet<String>>,
}

impl ReservationSnapshot {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
            && self.ready.is_empty()
            && self.job_pending.is_empty()
            && self.job_ready.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct NodeReservationHandler {
    maps: Mutex<Maps>,
}

impl NodeReservationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 `job` 预留 `channel` 对应的节点, 并请求节点应用作业配置
    pub(crate) fn do_reservation(
        &self,
        ctx: &Arc<DriverContext>,
        job: &Arc<Job>,
        channel: &Arc<NodeChannel>,
    ) {
        let Some(node) = channel.uuid() else {
            return;
        };
        self.reserve_pending(&node, job.uuid());
        log::info!(
            "node {} reserved for job {} (score {})",
            node,
            job.uuid(),
            channel.reservation_score()
        );
        push_configuration(ctx, job, channel, node);
    }

    pub(crate) fn reserve_pending(&self, node: &str, job: &str) {
        self.maps.lock().insert_pending(node, job);
    }

    pub(crate) fn mark_ready(&self, node: &str, job: &str) {
        self.maps.lock().insert_ready(node, job);
    }

    /// 删除节点的所有预留记录, 存在记录时返回 true
    pub fn remove_reservation(&self, node: &str) -> bool {
        let removed = self.maps.lock().remove_node(node);
        if removed {
            log::debug!("reservation of node {} removed", node);
        }
        removed
    }

    /// 删除为作业做的所有预留, 返回释放的节点数
    pub fn remove_job_reservations(&self, job: &str) -> usize {
        let removed = self.maps.lock().remove_job(job);
        if removed > 0 {
            log::debug!("released {} nodes reserved for job {}", removed, job);
        }
        removed
    }

    pub(crate) fn channel_closed(&self, node: &str, transition: ReservationTransition) {
        match transition {
            ReservationTransition::Remove => {
                self.remove_reservation(node);
            }
            ReservationTransition::Keep => {
                log::debug!("node {} restarting, keeping its reservation", node)
            }
        }
    }

    /// 节点重新配置后接入。若当前配置是为其 pending 的作业推送的,
    /// 则以新 uuid 转为 ready
    pub(crate) fn transition_reservation(&self, channel: &NodeChannel, queue: &JobQueue) -> bool {
        let Some(uuid) = channel.uuid() else {
            return false;
        };
        let info = channel.system_info();
        let Some(job_uuid) = info.get(keys::RESERVED_JOB).map(str::to_string) else {
            return false;
        };
        let previous = info.get(keys::RESERVED_UUID).unwrap_or(uuid.as_str()).to_string();
        match queue.get_job(&job_uuid) {
            Some(job) if !job.is_cancelled() => {}
            _ => {
                self.remove_job_reservations(&job_uuid);
                return false;
            }
        }
        {
            let mut maps = self.maps.lock();
            if maps.pending.get(&previous) != Some(&job_uuid) {
                return false;
            }
            maps.remove_node(&previous);
            maps.insert_ready(&uuid, &job_uuid);
        }
        channel.set_reservation_transition(ReservationTransition::Remove);
        log::info!(
            "node {} (was {}) is ready for job {}",
            uuid,
            previous,
            job_uuid
        );
        true
    }

    /// 上一次推送失败时重新推送配置
    pub(crate) fn retry_pending(&self, ctx: &Arc<DriverContext>, channel: &Arc<NodeChannel>) {
        let Some(node) = channel.uuid() else {
            return;
        };
        let job_uuid = {
            let mut maps = self.maps.lock();
            let Some(job) = maps.retry.remove(&node) else {
                return;
            };
            if maps.pending.get(&node) != Some(&job) {
                return;
            }
            job
        };
        match ctx.queue().get_job(&job_uuid) {
            Some(job) if !job.is_cancelled() => {
                log::debug!("retrying configuration push to node {}", node);
                push_configuration(ctx, &job, channel, node);
            }
            _ => {
                self.remove_job_reservations(&job_uuid);
            }
        }
    }

    fn schedule_retry(&self, node: &str, job: &str) {
        let mut maps = self.maps.lock();
        if maps.pending.get(node).map(String::as_str) == Some(job) {
            maps.retry.insert(node.to_string(), job.to_string());
        }
    }

    pub fn pending_job(&self, node: &str) -> Option<String> {
        self.maps.lock().pending.get(node).cloned()
    }

    pub fn ready_job(&self, node: &str) -> Option<String> {
        self.maps.lock().ready.get(node).cloned()
    }

    pub fn has_ready_node(&self, job: &str) -> bool {
        self.maps
            .lock()
            .job_ready
            .get(job)
            .is_some_and(|nodes| !nodes.is_empty())
    }

    pub fn ready_nodes(&self, job: &str) -> HashSet<String> {
        self.maps.lock().job_ready.get(job).cloned().unwrap_or_default()
    }

    /// 为 `job` pending 或 ready 的节点
    pub fn nb_reserved_nodes(&self, job: &str) -> usize {
        let maps = self.maps.lock();
        maps.job_pending.get(job).map_or(0, HashSet::len)
            + maps.job_ready.get(job).map_or(0, HashSet::len)
    }

    pub fn reservations(&self) -> ReservationSnapshot {
        let maps = self.maps.lock();
        let sets = |m: &HashMap<String, HashSet<String>>| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
                .collect()
        };
        ReservationSnapshot {
            pending: maps.pending.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ready: maps.ready.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            job_pending: sets(&maps.job_pending),
            job_ready: sets(&maps.job_ready),
        }
    }

    pub fn reserved_jobs(&self) -> BTreeSet<String> {
        let maps = self.maps.lock();
        maps.job_pending
            .keys()
            .chain(maps.job_ready.keys())
            .cloned()
            .collect()
    }

    pub fn reserved_nodes(&self) -> BTreeSet<String> {
        let maps = self.maps.lock();
        maps.pending.keys().chain(maps.ready.keys()).cloned().collect()
    }
}

/// 在执行线程池中请求节点应用作业期望的配置(合并预留标记)。
/// 配置已匹配的节点不重启, 直接就绪
fn push_configuration(
    ctx: &Arc<DriverContext>,
    job: &Arc<Job>,
    channel: &Arc<NodeChannel>,
    node: String,
) {
    let Some(spec) = job.sla().desired_node_configuration else {
        return;
    };
    let mut props = spec.configuration;
    props.insert(keys::RESERVED_JOB.to_string(), job.uuid().to_string());
    props.insert(keys::RESERVED_UUID.to_string(), node.clone());
    let restart = spec.force_restart || channel.reservation_score() > 0;
    let job_uuid = job.uuid().to_string();
    let weak_ctx = Arc::downgrade(ctx);
    let weak_channel = Arc::downgrade(channel);
    ctx.runtime().spawn_blocking(move || {
        let (Some(ctx), Some(channel)) = (weak_ctx.upgrade(), weak_channel.upgrade()) else {
            return;
        };
        let Some(conn) = channel.management() else {
            log::debug!(
                "node {} has no management connection yet, configuration push deferred",
                node
            );
            ctx.reservations().schedule_retry(&node, &job_uuid);
            return;
        };
        channel.set_reservation_transition(ReservationTransition::Keep);
        if !restart {
            channel.merge_system_info(&props);
        }
        match conn.update_configuration(props, restart) {
            Ok(()) => {
                log::debug!(
                    "configuration pushed to node {} for job {} (restart: {})",
                    node,
                    job_uuid,
                    restart
                );
                if !restart && ctx.reservations().transition_reservation(&channel, ctx.queue()) {
                    ctx.wake_dispatcher();
                }
            }
            Err(e) => {
                log::warn!("configuration push to node {} failed: {}", node, e);
                channel.set_reservation_transition(ReservationTransition::Remove);
                ctx.reservations().schedule_retry(&node, &job_uuid);
            }
        }
    });
}
