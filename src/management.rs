//! 节点远程管理
//!
//! 调度引擎只需要节点管理端点的三个能力: 取消作业, 推送配置(可选重启节点),
//! 以及判断连接是否存活。
//! 连接在执行线程池中按需建立, 不会在 reactor 或调度线程上建立。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;

/// 节点在握手中公布的管理端点地址
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagementInfo {
    pub host: String,
    pub port: u16,
    pub node_uuid: String,
    pub is_master: bool,
    pub is_slave: bool,
    pub master_uuid: Option<String>,
    pub is_peer: bool,
}

pub trait ManagementConnection: Send + Sync {
    /// 请求节点取消 `job_uuid`, 节点不认识该作业时返回 false
    fn cancel_job(&self, job_uuid: &str, requeue: bool) -> Result<bool>;

    fn update_configuration(&self, props: BTreeMap<String, String>, restart: bool) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// 对等驱动下挂的节点数
    fn peer_node_count(&self) -> Result<Option<usize>> {
        Ok(None)
    }
}

pub trait ManagementConnector: Send + Sync {
    fn connect(&self, info: &ManagementInfo) -> Result<Arc<dyn ManagementConnection>>;
}

/// 关闭管理功能时使用的连接器, 所有节点都不可达
#[derive(Debug, Default, Clone, Copy)]
pub struct NoManagement;

impl ManagementConnector for NoManagement {
    fn connect(&self, info: &ManagementInfo) -> Result<Arc<dyn ManagementConnection>> {
        Err(crate::GridError::Management(format!(
            "no management connector for node {}",
            info.node_uuid
        )))
    }
}
