mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};

use common::{chat, Harness, MockProcessManager};
use taskpool_core::config::PoolConfig;
use taskpool_core::models::{
    ErrorType, ExecutionMetrics, TaskOutcome, TaskStatus, WorkerLocation, WorkerRegistration,
    WorkerStatus,
};

fn pool_config(min_workers: usize, max_workers: usize) -> PoolConfig {
    PoolConfig {
        enabled: true,
        min_workers,
        max_workers,
        scale_up_ratio: 2.0,
        scale_up_window_seconds: 10,
        idle_window_seconds: 30,
        cooldown_seconds: 15,
        drain_grace_seconds: 60,
        ..PoolConfig::default()
    }
}

#[tokio::test]
async fn test_reconcile_fills_minimum() {
    let h = Harness::new();
    let process = Arc::new(MockProcessManager::new());
    let pool = h.pool_manager(pool_config(2, 4), process.clone());

    pool.reconcile(Utc::now()).await.unwrap();
    assert_eq!(process.running(), 2);
    assert_eq!(pool.pool_size().await.unwrap(), 2);
    assert_eq!(h.registry.list_eligible().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_scale_up_on_sustained_pressure_then_drain_when_idle() {
    let h = Harness::new();
    let process = Arc::new(MockProcessManager::new());
    let pool = h.pool_manager(pool_config(1, 2), process.clone());
    let t0 = Utc::now();

    pool.reconcile(t0).await.unwrap();
    h.dispatcher.schedule_pending(t0).await.unwrap();
    for i in 0..5 {
        h.controller.submit(chat(&format!("job {i}"))).await.unwrap();
    }
    h.dispatcher.schedule_pending(t0).await.unwrap();

    // 压力刚出现，不扩容
    pool.reconcile(t0 + Duration::seconds(1)).await.unwrap();
    assert_eq!(process.running(), 1);

    pool.reconcile(t0 + Duration::seconds(20)).await.unwrap();
    assert_eq!(process.running(), 2);

    // 达到上限后不再扩容
    pool.reconcile(t0 + Duration::seconds(60)).await.unwrap();
    assert_eq!(process.running(), 2);

    // 全部完成后Worker空闲
    loop {
        h.dispatcher.schedule_pending(Utc::now()).await.unwrap();
        let running: Vec<_> = h
            .controller
            .list_active_tasks()
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .collect();
        if running.is_empty() {
            break;
        }
        for task in running {
            let worker_id = task.assigned_worker_id.clone().unwrap();
            h.controller
                .report_result(
                    &task.id,
                    TaskOutcome::Succeeded {
                        result: serde_json::json!({}),
                    },
                    ExecutionMetrics::new(worker_id, 100).for_attempt(task.attempt_count),
                )
                .await
                .unwrap();
        }
    }
    assert_eq!(h.controller.summary().await.unwrap().succeeded, 5);

    let idle_start = t0 + Duration::seconds(100);
    pool.reconcile(idle_start).await.unwrap();
    pool.reconcile(idle_start + Duration::seconds(31)).await.unwrap();
    let draining = h
        .registry
        .list_by_status(WorkerStatus::Draining)
        .await
        .unwrap();
    assert_eq!(draining.len(), 1);

    // 没有在途任务，下一轮直接终止
    pool.reconcile(idle_start + Duration::seconds(32)).await.unwrap();
    assert_eq!(process.running(), 1);
    assert_eq!(process.terminated(), vec![draining[0].id.clone()]);
    assert_eq!(
        h.worker(&draining[0].id).await.status,
        WorkerStatus::Removed
    );
}

#[tokio::test]
async fn test_drain_timeout_requeues_leftovers() {
    let h = Harness::new();
    let process = Arc::new(MockProcessManager::new());
    let pool = h.pool_manager(pool_config(1, 2), process.clone());
    let t0 = Utc::now();

    pool.reconcile(t0).await.unwrap();
    let first = process.running_ids()[0].clone();
    let task_id = h.controller.submit(chat("long")).await.unwrap();
    h.dispatcher.schedule_pending(t0).await.unwrap();

    assert!(h.registry.begin_drain(&first).await.unwrap());
    // 排空期间补足下限
    pool.reconcile(t0 + Duration::seconds(1)).await.unwrap();
    assert_eq!(process.running(), 2);
    assert_eq!(
        h.controller.get_status(&task_id).await.unwrap().status,
        TaskStatus::Running
    );

    pool.reconcile(t0 + Duration::seconds(62)).await.unwrap();
    let task = h.controller.get_status(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.error_type, Some(ErrorType::DrainTimeout));
    assert_eq!(process.running(), 1);
    assert!(process.terminated().contains(&first));
}

#[tokio::test]
async fn test_local_worker_left_by_previous_run_is_retired() {
    let h = Harness::new();
    let stale = WorkerRegistration {
        worker_id: "old-host-local-1".to_string(),
        location: WorkerLocation::Local,
        endpoint_url: "http://127.0.0.1:9100".to_string(),
        max_concurrent_tasks: 1,
        supported_task_types: vec![],
        performance_factor: None,
    };
    assert!(h.controller.register_worker(stale).await.unwrap());
    h.add_worker("remote", 1).await;
    h.registry.begin_drain("remote").await.unwrap();

    let task_id = h.controller.submit(chat("leftover")).await.unwrap();
    h.dispatcher.schedule_pending(Utc::now()).await.unwrap();
    let task = h.controller.get_status(&task_id).await.unwrap();
    assert_eq!(task.assigned_worker_id.as_deref(), Some("old-host-local-1"));

    let process = Arc::new(MockProcessManager::new());
    let pool = h.pool_manager(pool_config(1, 2), process.clone());
    pool.reconcile(Utc::now()).await.unwrap();

    assert_eq!(
        h.worker("old-host-local-1").await.status,
        WorkerStatus::Removed
    );
    // 远程Worker不归Worker池管理
    assert_eq!(h.worker("remote").await.status, WorkerStatus::Draining);
    assert_eq!(pool.pool_size().await.unwrap(), 1);

    let task = h.controller.get_status(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.error_type, Some(ErrorType::WorkerLost));

    h.dispatcher.schedule_pending(Utc::now()).await.unwrap();
    let task = h.controller.get_status(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.assigned_worker_id, Some(process.running_ids()[0].clone()));
}

#[tokio::test]
async fn test_dead_local_worker_is_replaced() {
    let h = Harness::new();
    let process = Arc::new(MockProcessManager::new());
    let pool = h.pool_manager(pool_config(2, 3), process.clone());
    let monitor = h.health_monitor();

    pool.reconcile(Utc::now()).await.unwrap();
    let victim = process.running_ids()[0].clone();
    h.prober.set_down(&victim, true);
    for _ in 0..3 {
        monitor.check_all().await.unwrap();
    }
    assert_eq!(h.worker(&victim).await.status, WorkerStatus::Dead);

    pool.reconcile(Utc::now()).await.unwrap();
    assert_eq!(process.running(), 2);
    assert!(!process.running_ids().contains(&victim));
    assert_eq!(process.terminated(), vec![victim.clone()]);
    assert_eq!(h.worker(&victim).await.status, WorkerStatus::Removed);
}

#[tokio::test]
async fn test_pool_size_stays_within_bounds_under_random_load() {
    let (min_workers, max_workers) = (1, 4);
    let h = Harness::new();
    let process = Arc::new(MockProcessManager::new());
    let pool = h.pool_manager(pool_config(min_workers, max_workers), process.clone());
    let monitor = h.health_monitor();
    let mut rng = StdRng::seed_from_u64(0x7a5c_9001);
    let mut now = Utc::now();

    for step in 0..200 {
        now += Duration::seconds(5);

        for _ in 0..rng.random_range(0..4) {
            h.controller
                .submit(chat(&format!("step {step}")))
                .await
                .unwrap();
        }

        // 部分在途任务完成
        for task in h.controller.list_active_tasks().await.unwrap() {
            if task.status != TaskStatus::Running || !rng.random_bool(0.5) {
                continue;
            }
            let worker_id = task.assigned_worker_id.clone().unwrap();
            h.controller
                .report_result(
                    &task.id,
                    TaskOutcome::Succeeded {
                        result: serde_json::json!({}),
                    },
                    ExecutionMetrics::new(worker_id, 1_000).for_attempt(task.attempt_count),
                )
                .await
                .unwrap();
        }

        // 偶尔有Worker失联
        let running = process.running_ids();
        if !running.is_empty() && rng.random_bool(0.05) {
            let victim = &running[rng.random_range(0..running.len())];
            h.prober.set_down(victim, true);
        }
        monitor.check_all().await.unwrap();

        pool.reconcile(now).await.unwrap();
        h.dispatcher.schedule_pending(Utc::now()).await.unwrap();

        let size = pool.pool_size().await.unwrap();
        assert!(
            (min_workers..=max_workers).contains(&size),
            "第 {step} 步Worker数量越界: {size}"
        );
        assert_eq!(process.running(), size, "第 {step} 步进程数与注册数不一致");
    }
}
