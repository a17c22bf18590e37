use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use taskpool_core::{
    config::DatabaseBackend,
    traits::{TaskRepository, WorkerMetricRepository, WorkerRepository},
    AppConfig,
};
use taskpool_dispatcher::{
    create_strategy, Dispatcher, HealthMonitor, PerformanceTracker, PoolManager, RetryPolicy,
    TaskController, TaskQueue, WorkerFailureHandler, WorkerRegistry,
};
use taskpool_domain::{DomainEvent, EventBus};
use taskpool_infrastructure::{
    init_metrics, DatabaseManager, HttpWorkerClient, InMemoryTaskRepository,
    InMemoryWorkerMetricRepository, InMemoryWorkerRepository, LocalProcessManager,
    MetricsCollector, SqliteTaskRepository, SqliteWorkerMetricRepository, SqliteWorkerRepository,
};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Repositories {
    tasks: Arc<dyn TaskRepository>,
    workers: Arc<dyn WorkerRepository>,
    metrics: Arc<dyn WorkerMetricRepository>,
}

/// 主应用程序
pub struct Application {
    database: Option<DatabaseManager>,
    dispatcher: Arc<Dispatcher>,
    health_monitor: Arc<HealthMonitor>,
    pool: Option<Arc<PoolManager>>,
    controller: Arc<TaskController>,
    events: EventBus,
}

impl Application {
    /// 按配置组装所有组件
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!(
            "初始化应用程序，存储后端: {:?}, 调度策略: {}",
            config.database.backend, config.dispatcher.strategy
        );

        if let Some(bind) = &config.observability.metrics_bind {
            init_metrics(bind).context("初始化Prometheus导出器失败")?;
        }

        let (database, repos) = create_repositories(&config).await?;

        let events = EventBus::default();
        let metrics = MetricsCollector::new();
        let wakeup = Arc::new(Notify::new());

        let client = Arc::new(
            HttpWorkerClient::new(Duration::from_millis(config.dispatcher.forward_timeout_ms))
                .context("创建Worker HTTP客户端失败")?,
        );

        let queue = Arc::new(TaskQueue::new(
            repos.tasks,
            config.dispatcher.clone(),
            wakeup.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(
            repos.workers,
            wakeup.clone(),
            events.clone(),
        ));
        let tracker = Arc::new(PerformanceTracker::new(
            repos.metrics,
            registry.clone(),
            config.performance.clone(),
            events.clone(),
            metrics.clone(),
        ));

        let since = Utc::now()
            - chrono::Duration::hours(config.performance.warmup_window_hours as i64);
        let warmed = tracker
            .warm_up(since)
            .await
            .context("加载历史执行指标失败")?;
        info!("从最近 {} 小时的历史指标预热了 {} 个Worker", config.performance.warmup_window_hours, warmed);

        let dispatcher = Arc::new(Dispatcher::new(
            queue,
            registry.clone(),
            tracker,
            client.clone(),
            create_strategy(&config.dispatcher),
            RetryPolicy::new(config.retry.clone()),
            config.dispatcher.clone(),
            wakeup,
            events.clone(),
            metrics.clone(),
        ));

        let failure_handler: Arc<dyn WorkerFailureHandler> = dispatcher.clone();
        let health_monitor = Arc::new(HealthMonitor::new(
            registry,
            client,
            config.health.clone(),
            failure_handler,
            metrics.clone(),
        ));

        let controller = Arc::new(TaskController::new(dispatcher.clone()));

        for registration in config.workers.iter().cloned() {
            let worker_id = registration.worker_id.clone();
            match controller.register_worker(registration).await {
                Ok(true) => info!(worker_id = %worker_id, "已注册配置中的Worker"),
                Ok(false) => debug!(worker_id = %worker_id, "Worker已存在，跳过注册"),
                Err(e) => warn!(worker_id = %worker_id, "注册配置中的Worker失败: {e}"),
            }
        }

        let pool = if config.pool.enabled {
            let process = Arc::new(LocalProcessManager::new(config.pool.process.clone()));
            Some(Arc::new(PoolManager::new(
                process,
                dispatcher.clone(),
                config.pool.clone(),
                events.clone(),
                metrics,
            )))
        } else {
            None
        };

        Ok(Self {
            database,
            dispatcher,
            health_monitor,
            pool,
            controller,
            events,
        })
    }

    /// 运行所有后台循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动后台服务");

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        handles.push({
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { dispatcher.run(shutdown_rx).await })
        });

        handles.push({
            let monitor = Arc::clone(&self.health_monitor);
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { monitor.run(shutdown_rx).await })
        });

        if let Some(pool) = &self.pool {
            let pool = Arc::clone(pool);
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move { pool.run(shutdown_rx).await }));
        }

        handles.push({
            let events = self.events.clone();
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(log_events(events, shutdown_rx))
        });

        let _ = shutdown_rx.recv().await;
        info!("正在停止后台服务...");

        for handle in handles {
            if let Err(e) = handle.await {
                error!("后台任务异常退出: {e}");
            }
        }

        if let Some(pool) = &self.pool {
            if let Err(e) = pool.shutdown().await {
                error!("关闭本地Worker失败: {e}");
            }
        }

        match self.controller.summary().await {
            Ok(summary) => info!("停止时的任务统计: {:?}", summary),
            Err(e) => warn!("读取任务统计失败: {e}"),
        }

        if let Some(database) = &self.database {
            database.close().await;
        }

        info!("后台服务已停止");
        Ok(())
    }
}

async fn create_repositories(config: &AppConfig) -> Result<(Option<DatabaseManager>, Repositories)> {
    match config.database.backend {
        DatabaseBackend::Memory => {
            info!("使用内存存储");
            let repos = Repositories {
                tasks: Arc::new(InMemoryTaskRepository::new()),
                workers: Arc::new(InMemoryWorkerRepository::new()),
                metrics: Arc::new(InMemoryWorkerMetricRepository::new()),
            };
            Ok((None, repos))
        }
        DatabaseBackend::Sqlite => {
            let database = DatabaseManager::new(&config.database)
                .await
                .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
            database.migrate().await.context("数据库迁移失败")?;

            let pool = database.pool().clone();
            let repos = Repositories {
                tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
                workers: Arc::new(SqliteWorkerRepository::new(pool.clone())),
                metrics: Arc::new(SqliteWorkerMetricRepository::new(pool)),
            };
            Ok((Some(database), repos))
        }
    }
}

/// 将领域事件写入日志
async fn log_events(events: EventBus, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => debug!(
                    event_type = event.event_type(),
                    aggregate_id = %event.aggregate_id(),
                    "{}",
                    serde_json::to_string(&event.kind).unwrap_or_default()
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("事件日志落后，丢弃了 {skipped} 个事件");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskpool_core::models::{TaskStatus, TaskSubmission, WorkerLocation, WorkerRegistration};

    fn remote_worker(id: &str) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: id.to_string(),
            location: WorkerLocation::Remote,
            endpoint_url: "http://127.0.0.1:9".to_string(),
            max_concurrent_tasks: 2,
            supported_task_types: Vec::new(),
            performance_factor: None,
        }
    }

    #[tokio::test]
    async fn test_memory_application_accepts_tasks() {
        let app = Application::new(AppConfig::default()).await.unwrap();
        let controller = Arc::clone(&app.controller);

        let id = controller
            .submit(TaskSubmission::new("chat", json!({ "prompt": "hi" })))
            .await
            .unwrap();
        let task = controller.get_status(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_configured_workers_survive_restart_with_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.database.backend = DatabaseBackend::Sqlite;
        config.database.url = format!("sqlite://{}", dir.path().join("taskpool.db").display());
        config.workers = vec![remote_worker("w1")];

        {
            let app = Application::new(config.clone()).await.unwrap();
            let workers = app.controller.list_workers().await.unwrap();
            assert_eq!(workers.len(), 1);
            if let Some(database) = &app.database {
                database.close().await;
            }
        }

        // 再次启动时不会重复注册
        let app = Application::new(config).await.unwrap();
        let workers = app.controller.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, "w1");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let app = Arc::new(Application::new(AppConfig::default()).await.unwrap());
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
