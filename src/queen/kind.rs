//! 通道类型及各类型允许的行为

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// 与驱动同主机的进程内节点
    Local,
    Remote,
    /// 作为节点接入的另一个驱动
    Peer,
}

/// 按类型决定的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// 参与配置距离评分和预留
    pub reservable: bool,
    /// 消息头携带任务位置和重提交上限
    pub forwards_task_positions: bool,
    /// 受对等负载阈值和最大驱动深度限制
    pub peer_limits: bool,
    /// 管理连接可以查询对等属性
    pub polls_peer_attributes: bool,
    /// 开启本地节点优先时优先选择
    pub local_bias: bool,
}

const CAPABILITIES: [(ChannelKind, Capabilities); 3] = [
    (
        ChannelKind::Local,
        Capabilities {
            reservable: false,
            forwards_task_positions: false,
            peer_limits: false,
            polls_peer_attributes: false,
            local_bias: true,
        },
    ),
    (
        ChannelKind::Remote,
        Capabilities {
            reservable: true,
            forwards_task_positions: false,
            peer_limits: false,
            polls_peer_attributes: false,
            local_bias: false,
        },
    ),
    (
        ChannelKind::Peer,
        Capabilities {
            reservable: false,
            forwards_task_positions: true,
            peer_limits: true,
            polls_peer_attributes: true,
            local_bias: false,
        },
    ),
];

impl ChannelKind {
    pub fn from_flags(peer: bool, local: bool) -> Self {
        if peer {
            ChannelKind::Peer
        } else if local {
            ChannelKind::Local
        } else {
            ChannelKind::Remote
        }
    }

    pub fn capabilities(self) -> Capabilities {
        CAPABILITIES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, caps)| *caps)
            .unwrap_or(CAPABILITIES[1].1)
    }

    pub fn role(self) -> &'static str {
        match self {
            ChannelKind::Local => "local",
            ChannelKind::Remote => "node",
            ChannelKind::Peer => "peer",
        }
    }
}
