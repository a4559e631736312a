//! 空闲节点集合
//!
//! 由单个线程持有, 只能通过命令通道访问。reactor 在通道空闲时加入,
//! 调度线程获取快照并同步占用通道, 因此被占用的通道在重新加入之前
//! 不会出现在后续扫描中。

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use super::channel::NodeChannel;

enum IdleCommand {
    Add(Arc<NodeChannel>),
    Remove(usize),
    Take(usize, Sender<bool>),
    Snapshot(Sender<Vec<Arc<NodeChannel>>>),
    Len(Sender<usize>),
    Shutdown,
}

/// 空闲集合 actor 的可克隆句柄
#[derive(Clone)]
pub struct IdleSet {
    tx: Sender<IdleCommand>,
}

/// 通道空闲时由 actor 调用, 参数为新的集合大小
pub type IdleListener = Box<dyn Fn(usize) + Send>;

impl IdleSet {
    pub fn start(on_idle: IdleListener) -> io::Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("idle-set".into())
            .spawn(move || run(rx, on_idle))?;
        Ok((Self { tx }, handle))
    }

    pub fn add(&self, channel: Arc<NodeChannel>) {
        let _ = self.tx.send(IdleCommand::Add(channel));
    }

    pub fn remove(&self, id: usize) {
        let _ = self.tx.send(IdleCommand::Remove(id));
    }

    /// 移除 `id` 并返回它是否空闲, 阻塞到 actor 应答
    pub fn take(&self, id: usize) -> bool {
        self.ask(|reply| IdleCommand::Take(id, reply)).unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<Arc<NodeChannel>> {
        self.ask(IdleCommand::Snapshot).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ask(IdleCommand::Len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(IdleCommand::Shutdown);
    }

    fn ask<T>(&self, make: impl FnOnce(Sender<T>) -> IdleCommand) -> Option<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx.send(make(reply_tx)).ok()?;
        reply_rx.recv().ok()
    }
}

fn run(rx: Receiver<IdleCommand>, on_idle: IdleListener) {
    // 保持插入顺序, 扫描时先看到空闲最久的通道
    let mut idle: Vec<Arc<NodeChannel>> = Vec::new();
    while let Ok(cmd) = rx.recv() {
        match cmd {
            IdleCommand::Add(channel) => {
                if channel.is_closed() {
                    continue;
                }
                if !idle.iter().any(|c| c.id() == channel.id()) {
                    log::trace!("channel {} is idle", channel.id());
                    idle.push(channel);
                }
                on_idle(idle.len());
            }
            IdleCommand::Remove(id) => {
                idle.retain(|c| c.id() != id);
            }
            IdleCommand::Take(id, reply) => {
                let before = idle.len();
                idle.retain(|c| c.id() != id);
                let _ = reply.send(idle.len() < before);
            }
            IdleCommand::Snapshot(reply) => {
                idle.retain(|c| !c.is_closed());
                let _ = reply.send(idle.clone());
            }
            IdleCommand::Len(reply) => {
                let _ = reply.send(idle.len());
            }
            IdleCommand::Shutdown => break,
        }
    }
    log::debug!("idle-set actor stopped with {} idle channels", idle.len());
}
