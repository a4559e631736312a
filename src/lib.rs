//! ZergGrid 核心库入口
//!
//! 任务网格驱动的节点调度引擎: 节点通过 TCP 接入, 由单个 mio reactor 驱动所有通道,
//! 调度线程负责把排队中的作业分配给空闲节点。

pub mod balancer;
pub mod config;
pub mod context;
pub mod driver;
pub mod drone;
pub mod error;
pub mod job;
pub mod management;
pub mod policy;
pub mod proto;
pub mod queen;
pub mod schedule;
pub mod stats;
pub mod system_info;

pub use config::{DriverConfig, LoadBalancingConfig};
pub use context::DriverContext;
pub use driver::Driver;
pub use error::{GridError, Result};
pub use job::{
    DataLocation, Job, JobBuilder, JobListener, JobSla, JobStatus, NodeConfigSpec, ReturnReason,
    TaskOutcome,
};
pub use management::{ManagementConnection, ManagementConnector, ManagementInfo, NoManagement};
pub use policy::{ExecutionPolicy, PolicyContext};
pub use schedule::Schedule;
pub use system_info::{keys, SystemInfo};
