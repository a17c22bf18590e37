#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use taskpool_core::{
    config::{DispatcherConfig, HealthConfig, PerformanceConfig, PoolConfig, RetryConfig},
    models::{
        ProbeResponse, TaskExecutionMessage, TaskSubmission, WorkerInfo, WorkerLocation,
        WorkerRegistration,
    },
    traits::{WorkerProber, WorkerProcessManager, WorkerTransport},
    SchedulerError, SchedulerResult,
};
use taskpool_dispatcher::{
    create_strategy, Dispatcher, HealthMonitor, PerformanceTracker, PoolManager, RetryPolicy,
    TaskController, TaskQueue, WorkerRegistry,
};
use taskpool_domain::EventBus;
use taskpool_infrastructure::{
    InMemoryTaskRepository, InMemoryWorkerMetricRepository, InMemoryWorkerRepository,
    MetricsCollector,
};

/// 记录投递和取消请求的传输层
#[derive(Default)]
pub struct MockTransport {
    dispatched: Mutex<Vec<(String, TaskExecutionMessage)>>,
    cancelled: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_worker(&self, worker_id: &str) {
        self.failing.lock().unwrap().insert(worker_id.to_string());
    }

    pub fn dispatched(&self) -> Vec<(String, TaskExecutionMessage)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn dispatched_to(&self, worker_id: &str) -> Vec<TaskExecutionMessage> {
        self.dispatched()
            .into_iter()
            .filter(|(w, _)| w == worker_id)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn cancelled(&self) -> Vec<(String, String)> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn dispatch(
        &self,
        worker: &WorkerInfo,
        message: &TaskExecutionMessage,
    ) -> SchedulerResult<()> {
        if self.failing.lock().unwrap().contains(&worker.id) {
            return Err(SchedulerError::Network(format!(
                "connection refused: {}",
                worker.endpoint_url
            )));
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((worker.id.clone(), message.clone()));
        Ok(())
    }

    async fn cancel(&self, worker: &WorkerInfo, task_id: &str) -> SchedulerResult<()> {
        self.cancelled
            .lock()
            .unwrap()
            .push((worker.id.clone(), task_id.to_string()));
        Ok(())
    }
}

/// 可逐个Worker设置健康状态的探针
#[derive(Default)]
pub struct MockProber {
    down: Mutex<HashSet<String>>,
    latency: Mutex<HashMap<String, f64>>,
    probes: AtomicUsize,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, worker_id: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(worker_id.to_string());
        } else {
            set.remove(worker_id);
        }
    }

    pub fn set_latency(&self, worker_id: &str, latency_ms: f64) {
        self.latency
            .lock()
            .unwrap()
            .insert(worker_id.to_string(), latency_ms);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerProber for MockProber {
    async fn probe(&self, worker: &WorkerInfo) -> SchedulerResult<ProbeResponse> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.down.lock().unwrap().contains(&worker.id) {
            return Err(SchedulerError::Network("connection refused".to_string()));
        }
        let latency_ms = self
            .latency
            .lock()
            .unwrap()
            .get(&worker.id)
            .copied()
            .unwrap_or(5.0);
        Ok(ProbeResponse {
            ok: true,
            latency_ms,
        })
    }
}

/// 不启动真实进程的Worker管理
#[derive(Default)]
pub struct MockProcessManager {
    next: AtomicUsize,
    running: Mutex<HashSet<String>>,
    terminated: Mutex<Vec<String>>,
}

impl MockProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerProcessManager for MockProcessManager {
    async fn spawn(&self) -> SchedulerResult<WorkerRegistration> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let worker_id = format!("local-{n}");
        self.running.lock().unwrap().insert(worker_id.clone());
        Ok(WorkerRegistration {
            worker_id: worker_id.clone(),
            location: WorkerLocation::Local,
            endpoint_url: format!("http://127.0.0.1:{}", 9100 + n),
            max_concurrent_tasks: 1,
            supported_task_types: vec![],
            performance_factor: None,
        })
    }

    async fn terminate(&self, worker_id: &str) -> SchedulerResult<()> {
        if self.running.lock().unwrap().remove(worker_id) {
            self.terminated.lock().unwrap().push(worker_id.to_string());
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "mock"
    }
}

/// 组装好的测试环境，全部使用内存仓储
pub struct Harness {
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<WorkerRegistry>,
    pub tracker: Arc<PerformanceTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub controller: Arc<TaskController>,
    pub transport: Arc<MockTransport>,
    pub prober: Arc<MockProber>,
    pub metric_repo: Arc<InMemoryWorkerMetricRepository>,
    pub events: EventBus,
    pub health_config: HealthConfig,
}

pub struct HarnessBuilder {
    pub dispatcher: DispatcherConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub performance: PerformanceConfig,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            // 测试中不需要随机抖动
            retry: RetryConfig {
                jitter_factor: 0.0,
                ..RetryConfig::default()
            },
            health: HealthConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

impl HarnessBuilder {
    pub fn build(self) -> Harness {
        let events = EventBus::default();
        let metrics = MetricsCollector::new();
        let wakeup = Arc::new(Notify::new());

        let queue = Arc::new(TaskQueue::new(
            Arc::new(InMemoryTaskRepository::new()),
            self.dispatcher.clone(),
            wakeup.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(
            Arc::new(InMemoryWorkerRepository::new()),
            wakeup.clone(),
            events.clone(),
        ));
        let metric_repo = Arc::new(InMemoryWorkerMetricRepository::new());
        let tracker = Arc::new(PerformanceTracker::new(
            metric_repo.clone(),
            registry.clone(),
            self.performance,
            events.clone(),
            metrics.clone(),
        ));
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            registry.clone(),
            tracker.clone(),
            transport.clone(),
            create_strategy(&self.dispatcher),
            RetryPolicy::new(self.retry),
            self.dispatcher,
            wakeup,
            events.clone(),
            metrics,
        ));
        let controller = Arc::new(TaskController::new(dispatcher.clone()));

        Harness {
            queue,
            registry,
            tracker,
            dispatcher,
            controller,
            transport,
            prober: Arc::new(MockProber::new()),
            metric_repo,
            events,
            health_config: self.health,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        HarnessBuilder::default().build()
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.registry.clone(),
            self.prober.clone(),
            self.health_config.clone(),
            self.dispatcher.clone(),
            MetricsCollector::new(),
        )
    }

    pub fn pool_manager(&self, config: PoolConfig, process: Arc<MockProcessManager>) -> PoolManager {
        PoolManager::new(
            process,
            self.dispatcher.clone(),
            config,
            self.events.clone(),
            MetricsCollector::new(),
        )
    }

    pub async fn add_worker(&self, worker_id: &str, max_concurrent_tasks: i32) {
        self.add_worker_with(worker_id, max_concurrent_tasks, None, vec![])
            .await;
    }

    pub async fn add_worker_with(
        &self,
        worker_id: &str,
        max_concurrent_tasks: i32,
        performance_factor: Option<f64>,
        supported_task_types: Vec<String>,
    ) {
        let registered = self
            .controller
            .register_worker(WorkerRegistration {
                worker_id: worker_id.to_string(),
                location: WorkerLocation::Remote,
                endpoint_url: format!("http://{worker_id}:9000"),
                max_concurrent_tasks,
                supported_task_types,
                performance_factor,
            })
            .await
            .unwrap();
        assert!(registered);
    }

    pub async fn worker(&self, worker_id: &str) -> WorkerInfo {
        self.registry.require(worker_id).await.unwrap()
    }
}

pub fn chat(prompt: &str) -> TaskSubmission {
    TaskSubmission::new("chat", json!({ "prompt": prompt }))
}
