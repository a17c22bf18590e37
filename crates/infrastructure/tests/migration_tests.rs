mod database_test_utils;

use database_test_utils::{setup_database, setup_memory_database};
use taskpool_core::traits::TaskRepository;
use taskpool_infrastructure::SqliteTaskRepository;

#[tokio::test]
async fn test_database_migrations_from_scratch() {
    let db = setup_memory_database().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
    )
    .fetch_all(db.pool())
    .await
    .unwrap();
    let table_names: Vec<String> = tables.into_iter().map(|(name,)| name).collect();

    assert_eq!(table_names, vec!["tasks", "worker_metrics", "workers"]);
}

#[tokio::test]
async fn test_required_indexes_exist() {
    let db = setup_memory_database().await;

    let indexes: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'index'")
            .fetch_all(db.pool())
            .await
            .unwrap();
    let names: Vec<String> = indexes.into_iter().map(|(name,)| name).collect();

    for expected in [
        "idx_tasks_status_priority_created",
        "idx_worker_metrics_worker_id",
        "idx_worker_metrics_measured_at",
    ] {
        assert!(names.iter().any(|n| n == expected), "缺少索引 {expected}");
    }
}

#[tokio::test]
async fn test_migration_idempotency() {
    let db = setup_memory_database().await;
    db.migrate().await.unwrap();
    db.health_check().await.unwrap();
}

#[tokio::test]
async fn test_file_database_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("taskpool.db").display());

    let task = database_test_utils::task("chat", 0);
    {
        let db = setup_database(&url).await;
        SqliteTaskRepository::new(db.pool().clone())
            .create(&task)
            .await
            .unwrap();
        db.close().await;
    }

    let db = setup_database(&url).await;
    let stored = SqliteTaskRepository::new(db.pool().clone())
        .get_by_id(&task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.payload, task.payload);
}
