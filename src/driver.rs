//! 驱动启动
//!
//! 持有运行时和常驻线程: reactor, 调度线程, 空闲集合 actor

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::runtime::{Builder, Runtime};

use crate::config::DriverConfig;
use crate::context::DriverContext;
use crate::job::Job;
use crate::management::ManagementConnector;
use crate::queen::dispatcher::JobDispatcher;
use crate::queen::network::NodeServer;
use crate::stats::StatsSnapshot;
use crate::Result;

pub struct Driver {
    ctx: Arc<DriverContext>,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
    runtime: Option<Runtime>,
}

impl Driver {
    pub fn start(config: DriverConfig, connector: Arc<dyn ManagementConnector>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.executor_threads.max(1))
            .thread_name("grid-executor")
            .enable_time()
            .build()?;
        let listen_addr = config.listen_addr;
        let (ctx, idle_thread) = DriverContext::new(config, connector, runtime.handle().clone())?;
        let (server, local_addr) = match NodeServer::bind(&ctx, listen_addr) {
            Ok(bound) => bound,
            Err(e) => {
                ctx.stop();
                let _ = idle_thread.join();
                return Err(e);
            }
        };
        let reactor = thread::Builder::new()
            .name("node-server".into())
            .spawn(move || server.run())?;
        let dispatcher = JobDispatcher::new(Arc::clone(&ctx));
        let dispatcher = thread::Builder::new()
            .name("job-dispatcher".into())
            .spawn(move || dispatcher.run())?;
        log::info!("driver {} started on {}", ctx.uuid(), local_addr);
        Ok(Self {
            ctx,
            local_addr,
            threads: vec![reactor, dispatcher, idle_thread],
            runtime: Some(runtime),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn uuid(&self) -> &str {
        self.ctx.uuid()
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    pub fn submit(&self, job: Arc<Job>) {
        self.ctx.submit_job(job);
    }

    pub fn cancel_job(&self, uuid: &str) -> bool {
        self.ctx.cancel_job(uuid)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats().snapshot()
    }

    /// 停止所有线程并关闭全部节点通道
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        log::info!("driver {} shutting down", self.ctx.uuid());
        self.ctx.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("a driver thread panicked");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}
