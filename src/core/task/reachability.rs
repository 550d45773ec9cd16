//! 主机可达性监视
//!
//! 监视器产生可达性观测流；`ReachabilityTask` 在观测到从不可达变为可达时成功结束。

use actix::prelude::*;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::core::error::TaskError;
use super::actor::{CooperativeTask, TaskCore};
use super::messages::CancelTask;
use super::state::{TaskId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

/// 可达性监视能力；丢弃返回的流即停止监视
pub trait ReachabilityMonitor: Send + Sync + 'static {
    fn watch(&self, host: &str, port: u16) -> BoxStream<'static, Reachability>;
}

/// 定期尝试建立 TCP 连接来判断可达性
#[derive(Debug, Clone)]
pub struct TcpConnectMonitor {
    interval: Duration,
    timeout: Duration,
}

impl TcpConnectMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for TcpConnectMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(5))
    }
}

impl ReachabilityMonitor for TcpConnectMonitor {
    fn watch(&self, host: &str, port: u16) -> BoxStream<'static, Reachability> {
        let address = format!("{}:{}", host, port);
        let interval = self.interval;
        let timeout = self.timeout;
        stream::unfold(true, move |first| {
            let address = address.clone();
            async move {
                if !first {
                    tokio::time::sleep(interval).await;
                }
                let reachable = matches!(
                    tokio::time::timeout(timeout, TcpStream::connect(&address)).await,
                    Ok(Ok(_))
                );
                trace!("探测 {}: {}", address, reachable);
                let observed = if reachable { Reachability::Reachable } else { Reachability::Unreachable };
                Some((observed, false))
            }
        })
        .boxed()
    }
}

#[derive(Debug, Clone)]
pub struct ReachabilityOutcome {
    pub task_id: TaskId,
    pub host: String,
    pub result: Result<(), TaskError>,
}

/// 等待主机重新变为可达的任务
pub struct ReachabilityTask {
    core: TaskCore<ReachabilityOutcome>,
    host: String,
    port: u16,
    monitor: Arc<dyn ReachabilityMonitor>,
    last: Option<Reachability>,
    watch: Option<SpawnHandle>,
}

impl ReachabilityTask {
    pub fn new(host: impl Into<String>, port: u16, monitor: Arc<dyn ReachabilityMonitor>) -> Self {
        Self {
            core: TaskCore::new("reachability"),
            host: host.into(),
            port,
            monitor,
            last: None,
            watch: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Actor for ReachabilityTask {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.begin(ctx);
    }
}

impl Handler<CancelTask> for ReachabilityTask {
    type Result = ();
    fn handle(&mut self, _msg: CancelTask, ctx: &mut Self::Context) {
        self.cancel(ctx);
    }
}

impl StreamHandler<Reachability> for ReachabilityTask {
    fn handle(&mut self, observed: Reachability, ctx: &mut Self::Context) {
        if self.state() != TaskState::Running {
            return;
        }
        let previous = self.last.replace(observed);
        if previous == Some(Reachability::Unreachable) && observed == Reachability::Reachable {
            debug!("[task {}] {} 重新可达", self.id(), self.host);
            self.finish(None, ctx);
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        self.watch = None;
        let error = TaskError::MonitorEnded(self.host.clone());
        self.finish(Some(error), ctx);
    }
}

impl CooperativeTask for ReachabilityTask {
    type Output = ReachabilityOutcome;

    fn core(&self) -> &TaskCore<ReachabilityOutcome> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore<ReachabilityOutcome> {
        &mut self.core
    }

    fn on_start(&mut self, ctx: &mut Context<Self>) {
        let observations = self.monitor.watch(&self.host, self.port);
        self.watch = Some(ctx.add_stream(observations));
    }

    fn on_will_finish(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.watch.take() {
            ctx.cancel_future(handle);
        }
    }

    fn output(&mut self) -> ReachabilityOutcome {
        ReachabilityOutcome {
            task_id: self.id(),
            host: self.host.clone(),
            result: self.error().cloned().map_or(Ok(()), Err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{run_task, ScriptedReachability};

    #[actix_rt::test]
    async fn test_finishes_on_transition_to_reachable() {
        let monitor = ScriptedReachability::new();
        let task = ReachabilityTask::new("example.com", 80, monitor.clone());
        let pending = actix_rt::spawn(run_task(task));

        monitor.wait_for_watchers(1).await;
        monitor.set(Reachability::Reachable);
        monitor.set(Reachability::Unreachable);
        monitor.set(Reachability::Reachable);

        let outcome = pending.await.unwrap();
        assert_eq!(outcome.result, Ok(()));
        assert_eq!(outcome.host, "example.com");
    }

    #[actix_rt::test]
    async fn test_monitor_end_is_error() {
        let monitor = ScriptedReachability::new();
        let task = ReachabilityTask::new("example.com", 443, monitor.clone());
        let pending = actix_rt::spawn(run_task(task));

        monitor.wait_for_watchers(1).await;
        monitor.close();

        let outcome = pending.await.unwrap();
        assert_eq!(outcome.result, Err(TaskError::MonitorEnded("example.com".into())));
    }

    #[actix_rt::test]
    async fn test_tcp_connect_reports_refused_port() {
        // 绑定后立即释放，端口大概率无人监听
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let monitor = TcpConnectMonitor::new(Duration::from_millis(10), Duration::from_millis(200));
        let first = monitor.watch("127.0.0.1", port).next().await;
        assert_eq!(first, Some(Reachability::Unreachable));
    }
}
