#![allow(dead_code)]

use serde_json::json;
use taskpool_core::{
    config::{DatabaseBackend, DatabaseConfig},
    models::{Task, TaskSubmission, WorkerInfo, WorkerLocation, WorkerRegistration},
};
use taskpool_infrastructure::DatabaseManager;

/// 创建已完成迁移的内存SQLite数据库
pub async fn setup_memory_database() -> DatabaseManager {
    setup_database("sqlite::memory:").await
}

pub async fn setup_database(url: &str) -> DatabaseManager {
    let config = DatabaseConfig {
        backend: DatabaseBackend::Sqlite,
        url: url.to_string(),
        ..Default::default()
    };
    let manager = DatabaseManager::new(&config).await.unwrap();
    manager.migrate().await.unwrap();
    manager
}

pub fn task(task_type: &str, priority: i32) -> Task {
    Task::new(
        TaskSubmission::new(task_type, json!({"prompt": "write a haiku"})).with_priority(priority),
        1,
    )
}

pub fn worker(id: &str) -> WorkerInfo {
    WorkerInfo::new(WorkerRegistration {
        worker_id: id.to_string(),
        location: WorkerLocation::Remote,
        endpoint_url: format!("http://{id}.internal:9000"),
        max_concurrent_tasks: 2,
        supported_task_types: vec!["chat".to_string()],
        performance_factor: None,
    })
}
