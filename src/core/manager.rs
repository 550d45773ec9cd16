//! 任务管理器
//!
//! 持有网络事件循环线程、计算工作线程池和三条调度队列：
//! - 管理队列：不限宽度，放可达性监视、重试包装等轻量任务
//! - 传输队列：固定宽度，限制同时进行的 HTTP 传输
//! - 计算队列：宽度等于工作线程数
//!
//! 路由表记录每个已提交任务的取消入口；完成回调只在任务仍被跟踪时触发。

use actix::dev::ToEnvelope;
use actix::prelude::*;
use awc::http::header::{self, HeaderMap, HeaderValue};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use crate::config::Config;
use crate::core::error::TaskError;
use crate::core::task::actor::{CooperativeTask, TaskHandle};
use crate::core::task::compute::ComputeJob;
use crate::core::task::http::{HttpTransfer, DEFAULT_RESPONSE_SIZE, MAXIMUM_RESPONSE_SIZE};
use crate::core::task::messages::CancelTask;
use crate::core::task::notify::SuccessNotifier;
use crate::core::task::reachability::{ReachabilityMonitor, ReachabilityTask, TcpConnectMonitor};
use crate::core::task::request::HttpRequest;
use crate::core::task::retry::RetryPolicy;
use crate::core::task::retrying::RetryingTransfer;
use crate::core::task::state::TaskId;
use crate::core::task::transport::{AwcTransport, Transport};

/// 调度队列类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    Management,
    Transfer,
    Compute,
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueClass::Management => "管理",
            QueueClass::Transfer => "传输",
            QueueClass::Compute => "计算",
        };
        f.write_str(name)
    }
}

/// 已提交任务的路由信息
struct Route {
    queue: QueueClass,
    handle: TaskHandle,
}

struct Inner {
    network: Arbiter,
    workers: Vec<Arbiter>,
    idle_workers: Mutex<Vec<ArbiterHandle>>,
    ui: ArbiterHandle,

    routes: Mutex<HashMap<TaskId, Route>>,
    transfer_slots: Arc<Semaphore>,
    compute_slots: Arc<Semaphore>,
    transfers_active: AtomicUsize,
    network_in_use: watch::Sender<bool>,

    transport: Arc<dyn Transport>,
    reachability: Arc<dyn ReachabilityMonitor>,
    notifier: SuccessNotifier,
    user_agent: String,
    default_headers: HeaderMap,
    default_response_size: usize,
    maximum_response_size: usize,
    retry_policy: RetryPolicy,
}

impl Inner {
    fn lock_routes(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_arbiters(&self) {
        self.network.stop();
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// 在 UI 线程上根据当前活跃传输数刷新 networkInUse
    fn publish_network_in_use(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.ui.spawn_fn(move || {
            let busy = inner.transfers_active.load(Ordering::SeqCst) > 0;
            inner.network_in_use.send_if_modified(|current| {
                if *current != busy {
                    *current = busy;
                    true
                } else {
                    false
                }
            });
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_arbiters();
    }
}

/// 任务管理器，克隆代价很小，所有克隆共享同一组队列和线程
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

/// 任务管理器构建器
pub struct ManagerBuilder {
    transfer_width: usize,
    compute_workers: usize,
    transport: Option<Arc<dyn Transport>>,
    reachability: Option<Arc<dyn ReachabilityMonitor>>,
    user_agent: String,
    default_headers: HeaderMap,
    default_response_size: usize,
    maximum_response_size: usize,
    retry_policy: RetryPolicy,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self {
            transfer_width: 4,
            compute_workers: 0,
            transport: None,
            reachability: None,
            user_agent: format!("gallerynet/{}", env!("CARGO_PKG_VERSION")),
            default_headers: HeaderMap::new(),
            default_response_size: DEFAULT_RESPONSE_SIZE,
            maximum_response_size: MAXIMUM_RESPONSE_SIZE,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ManagerBuilder {
    pub fn with_config(mut self, config: &Config) -> Self {
        self.transfer_width = config.max_concurrent_transfers;
        self.compute_workers = config.compute_workers;
        self.transport = Some(Arc::new(AwcTransport::new(Duration::from_secs(config.timeout))));
        self.reachability = Some(Arc::new(TcpConnectMonitor::new(
            Duration::from_secs(config.reachability_interval),
            Duration::from_secs(config.reachability_timeout),
        )));
        self.user_agent = config.user_agent.clone();
        self.default_response_size = config.default_response_size;
        self.maximum_response_size = config.maximum_response_size;
        self.retry_policy = config.retry_policy();
        self
    }

    pub fn transfer_width(mut self, width: usize) -> Self {
        self.transfer_width = width;
        self
    }

    /// 0 表示使用可用并行度
    pub fn compute_workers(mut self, workers: usize) -> Self {
        self.compute_workers = workers;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn reachability(mut self, monitor: Arc<dyn ReachabilityMonitor>) -> Self {
        self.reachability = Some(monitor);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn default_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn response_sizes(mut self, default_size: usize, maximum_size: usize) -> Self {
        self.default_response_size = default_size;
        self.maximum_response_size = maximum_size;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// 启动网络线程与计算线程池；必须在 actix System 中调用
    pub fn build(self, ui: ArbiterHandle) -> TaskManager {
        let worker_count = match self.compute_workers {
            0 => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        };
        let transfer_width = self.transfer_width.max(1);

        let network = Arbiter::new();
        let workers: Vec<Arbiter> = (0..worker_count).map(|_| Arbiter::new()).collect();
        let idle_workers = workers.iter().map(Arbiter::handle).collect();
        let (network_in_use, _) = watch::channel(false);

        info!("任务管理器启动: 传输队列宽度 {}, 计算线程 {}", transfer_width, worker_count);

        TaskManager {
            inner: Arc::new(Inner {
                network,
                workers,
                idle_workers: Mutex::new(idle_workers),
                ui,
                routes: Mutex::new(HashMap::new()),
                transfer_slots: Arc::new(Semaphore::new(transfer_width)),
                compute_slots: Arc::new(Semaphore::new(worker_count)),
                transfers_active: AtomicUsize::new(0),
                network_in_use,
                transport: self.transport.unwrap_or_else(|| Arc::new(AwcTransport::default())),
                reachability: self.reachability.unwrap_or_else(|| Arc::new(TcpConnectMonitor::default())),
                notifier: SuccessNotifier::default(),
                user_agent: self.user_agent,
                default_headers: self.default_headers,
                default_response_size: self.default_response_size,
                maximum_response_size: self.maximum_response_size,
                retry_policy: self.retry_policy,
            }),
        }
    }
}

/// 会提交嵌套传输的任务放进传输队列会占住嵌套尝试需要的槽位，改到管理队列
fn effective_queue<T: CooperativeTask>(queue: QueueClass) -> QueueClass {
    if T::SUBMITS_NESTED_TRANSFERS && queue == QueueClass::Transfer {
        warn!("包含嵌套传输的任务不能占用传输队列，改为管理队列");
        return QueueClass::Management;
    }
    queue
}

impl TaskManager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    pub fn from_config(config: &Config, ui: ArbiterHandle) -> Self {
        Self::builder().with_config(config).build(ui)
    }

    /// 提交任务
    ///
    /// 管理与传输队列的任务若没有指定事件循环，就绑定到网络线程；计算任务绑定到
    /// 取得的工作线程。任务结束后 `callback` 在 `completion` 线程上执行，
    /// 但如果任务在此之前已被 [`TaskManager::cancel`] 移出路由表，回调不会执行。
    /// 会提交嵌套传输的任务（如 [`RetryingTransfer`]）总是放到管理队列。
    pub fn submit<T, F>(&self, mut task: T, queue: QueueClass, completion: ArbiterHandle, callback: F) -> TaskHandle
    where
        T: CooperativeTask + Send,
        T::Context: ToEnvelope<T, CancelTask>,
        F: FnOnce(T::Output) + Send + 'static,
    {
        let handle = task.handle();
        let id = handle.id();
        let queue = effective_queue::<T>(queue);
        if queue != QueueClass::Compute && task.core().event_loop().is_none() {
            task.core_mut().set_event_loop(self.inner.network.handle());
        }
        let done = task.core_mut().completion();
        self.inner
            .lock_routes()
            .insert(id, Route { queue, handle: handle.clone() });
        debug!("[task {}] 提交到{}队列", id, queue);

        let inner = Arc::clone(&self.inner);
        let task_handle = handle.clone();
        let dispatch = async move {
            let slots = match queue {
                QueueClass::Management => None,
                QueueClass::Transfer => Some(Arc::clone(&inner.transfer_slots)),
                QueueClass::Compute => Some(Arc::clone(&inner.compute_slots)),
            };
            let permit = match slots {
                Some(slots) => match slots.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            // 排队期间已被管理器取消的任务不再启动
            if !inner.lock_routes().contains_key(&id) {
                debug!("[task {}] 出队前已取消", id);
                return;
            }

            let mut worker = None;
            if queue == QueueClass::Compute {
                let picked = inner
                    .idle_workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop()
                    .unwrap_or_else(|| inner.network.handle());
                task.core_mut().set_event_loop(picked.clone());
                worker = Some(picked);
            }
            let event_loop = match task.core().event_loop() {
                Some(event_loop) => event_loop.clone(),
                None => inner.network.handle(),
            };

            if queue == QueueClass::Transfer && inner.transfers_active.fetch_add(1, Ordering::SeqCst) == 0 {
                inner.publish_network_in_use();
            }

            let addr = T::start_in_arbiter(&event_loop, move |_| task);
            task_handle.bind(&addr);
            let output = done.await;

            drop(permit);
            if let Some(worker) = worker {
                inner.idle_workers.lock().unwrap_or_else(PoisonError::into_inner).push(worker);
            }
            if queue == QueueClass::Transfer && inner.transfers_active.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.publish_network_in_use();
            }

            let output = match output {
                Ok(output) => output,
                Err(_) => {
                    warn!("[task {}] 任务在结束前被丢弃", id);
                    inner.lock_routes().remove(&id);
                    return;
                }
            };
            let routes = Arc::clone(&inner);
            completion.spawn_fn(move || {
                // 在提交线程上判断：同线程上先行的 cancel 已经移除了路由
                if routes.lock_routes().remove(&id).is_some() {
                    callback(output);
                } else {
                    debug!("[task {}] 已取消，丢弃完成回调", id);
                }
            });
        };
        self.inner.network.spawn(dispatch);
        handle
    }

    /// 取消任务；任务未被跟踪时什么也不做
    pub fn cancel(&self, id: TaskId) -> bool {
        let route = self.inner.lock_routes().remove(&id);
        match route {
            Some(route) => {
                debug!("[task {}] 取消（{}队列）", id, route.queue);
                route.handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, id: TaskId) -> bool {
        self.inner.lock_routes().contains_key(&id)
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock_routes().len()
    }

    /// 只应在 UI 线程上读取
    pub fn network_in_use(&self) -> bool {
        *self.inner.network_in_use.borrow()
    }

    pub fn watch_network_in_use(&self) -> watch::Receiver<bool> {
        self.inner.network_in_use.subscribe()
    }

    pub fn ui(&self) -> &ArbiterHandle {
        &self.inner.ui
    }

    pub fn success_notifier(&self) -> &SuccessNotifier {
        &self.inner.notifier
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    /// 为每个发出的请求补上 User-Agent 与默认头
    pub fn apply_default_headers(&self, request: &mut HttpRequest) {
        if let Ok(value) = HeaderValue::from_str(&self.inner.user_agent) {
            request.set_default_header(header::USER_AGENT, value);
        }
        for (name, value) in self.inner.default_headers.iter() {
            request.set_default_header(name.clone(), value.clone());
        }
    }

    pub fn request_to_get(&self, url: &str) -> Result<HttpRequest, TaskError> {
        let mut request = HttpRequest::get(url)?;
        self.apply_default_headers(&mut request);
        Ok(request)
    }

    /// 使用管理器的传输层与长度限制构造传输任务
    pub fn http_transfer(&self, mut request: HttpRequest) -> HttpTransfer {
        self.apply_default_headers(&mut request);
        HttpTransfer::new(request, Arc::clone(&self.inner.transport))
            .with_response_sizes(self.inner.default_response_size, self.inner.maximum_response_size)
    }

    /// 重试包装任务应提交到管理队列；提交到传输队列时 `submit` 会自动改到管理队列
    pub fn retrying_transfer(&self, request: HttpRequest) -> RetryingTransfer {
        RetryingTransfer::new(self.clone(), request).with_policy(self.inner.retry_policy.clone())
    }

    pub fn monitor_reachability(&self, host: &str, port: u16) -> ReachabilityTask {
        ReachabilityTask::new(host, port, Arc::clone(&self.inner.reachability))
    }

    /// 在计算队列上执行闭包，结果在 `completion` 线程上交给 `callback`
    pub fn add_compute_task<R, J, C>(&self, job: J, completion: ArbiterHandle, callback: C) -> TaskHandle
    where
        R: Send + Unpin + 'static,
        J: FnOnce() -> R + Send + 'static,
        C: FnOnce(R) + Send + 'static,
    {
        self.submit(ComputeJob::new(job), QueueClass::Compute, completion, move |outcome| {
            if let Some(value) = outcome.value {
                callback(value);
            }
        })
    }

    /// 取消所有任务并停止网络与计算线程
    pub fn shutdown(&self) {
        let routes: Vec<Route> = self.inner.lock_routes().drain().map(|(_, route)| route).collect();
        info!("任务管理器关闭，取消 {} 个任务", routes.len());
        for route in routes {
            route.handle.cancel();
        }
        self.inner.stop_arbiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::http::HttpOutcome;
    use crate::core::test_support::{eventually, Script, ScriptedReachability, ScriptedTransport};

    fn manager(transport: &Arc<ScriptedTransport>, width: usize) -> TaskManager {
        let transport: Arc<dyn Transport> = transport.clone();
        TaskManager::builder()
            .transfer_width(width)
            .compute_workers(2)
            .transport(transport)
            .reachability(ScriptedReachability::new())
            .build(Arbiter::current())
    }

    #[test]
    fn test_wrapper_tasks_are_moved_off_transfer_queue() {
        assert_eq!(effective_queue::<RetryingTransfer>(QueueClass::Transfer), QueueClass::Management);
        assert_eq!(effective_queue::<RetryingTransfer>(QueueClass::Management), QueueClass::Management);
        assert_eq!(effective_queue::<HttpTransfer>(QueueClass::Transfer), QueueClass::Transfer);
    }

    #[actix_rt::test]
    async fn test_completion_runs_on_submitting_thread() {
        let transport = ScriptedTransport::new(vec![Script::ok("text/plain", &[b"ok"])]);
        let manager = manager(&transport, 4);
        let request = manager.request_to_get("http://example.com/").unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let submitter = thread::current().id();

        manager.submit(manager.http_transfer(request), QueueClass::Transfer, Arbiter::current(), move |outcome: HttpOutcome| {
            let _ = tx.send((thread::current().id(), outcome));
        });
        let (callback_thread, outcome) = rx.await.unwrap();

        assert_eq!(callback_thread, submitter);
        assert!(outcome.result.is_ok());
        assert_eq!(manager.tracked_count(), 0);
        manager.shutdown();
    }

    #[actix_rt::test]
    async fn test_default_headers_are_applied() {
        let transport = ScriptedTransport::new(vec![]);
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let manager = TaskManager::builder()
            .transport(transport_dyn)
            .user_agent("gallery-test/1.0")
            .default_header(header::ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN"))
            .build(Arbiter::current());

        let request = manager.request_to_get("http://example.com/").unwrap();
        assert_eq!(request.headers.get(header::USER_AGENT).unwrap(), "gallery-test/1.0");
        assert_eq!(request.headers.get(header::ACCEPT_LANGUAGE).unwrap(), "zh-CN");
        manager.shutdown();
    }

    #[actix_rt::test]
    async fn test_cancel_right_after_submit_suppresses_callback() {
        let transport = ScriptedTransport::new(vec![Script::ok("text/plain", &[b"ok"])]);
        let manager = manager(&transport, 4);
        let calls = Arc::new(AtomicUsize::new(0));

        let request = manager.request_to_get("http://example.com/").unwrap();
        let counter = Arc::clone(&calls);
        let handle = manager.submit(manager.http_transfer(request), QueueClass::Transfer, Arbiter::current(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(manager.cancel(handle.id()));
        // 再次取消是无操作
        assert!(!manager.cancel(handle.id()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!manager.is_tracked(handle.id()));
        manager.shutdown();
    }

    #[actix_rt::test]
    async fn test_network_in_use_follows_transfer_queue() {
        let transport = ScriptedTransport::new(vec![Script::Hang]);
        let manager = manager(&transport, 4);
        assert!(!manager.network_in_use());

        let request = manager.request_to_get("http://example.com/slow").unwrap();
        let handle = manager.submit(manager.http_transfer(request), QueueClass::Transfer, Arbiter::current(), |_| {});
        eventually(|| manager.network_in_use()).await;

        manager.cancel(handle.id());
        eventually(|| !manager.network_in_use()).await;
        manager.shutdown();
    }

    #[actix_rt::test]
    async fn test_transfer_queue_width_is_bounded() {
        let transport = ScriptedTransport::new(vec![Script::Hang, Script::Hang, Script::Hang]);
        let manager = manager(&transport, 2);

        let handles: Vec<TaskHandle> = (0..3)
            .map(|i| {
                let request = manager.request_to_get(&format!("http://example.com/{}", i)).unwrap();
                manager.submit(manager.http_transfer(request), QueueClass::Transfer, Arbiter::current(), |_| {})
            })
            .collect();

        eventually(|| transport.open_count() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.open_count(), 2);

        // 取消一个已经开始的传输，排队的那个随即启动
        let started = transport.requests()[0].url.path().trim_start_matches('/').to_string();
        let index: usize = started.parse().unwrap();
        manager.cancel(handles[index].id());
        eventually(|| transport.open_count() == 3).await;
        manager.shutdown();
    }

    #[actix_rt::test]
    async fn test_compute_task_runs_on_worker_thread() {
        let transport = ScriptedTransport::new(vec![]);
        let manager = manager(&transport, 4);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let caller = thread::current().id();

        manager.add_compute_task(
            move || (thread::current().id(), 6 * 7),
            Arbiter::current(),
            move |value| {
                let _ = tx.send(value);
            },
        );
        let (worker_thread, value) = rx.await.unwrap();
        assert_eq!(value, 42);
        assert_ne!(worker_thread, caller);
        manager.shutdown();
    }
}
