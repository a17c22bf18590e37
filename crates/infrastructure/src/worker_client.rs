//! 基于HTTP的Worker客户端
//!
//! - `GET  {endpoint}/health`：健康检查
//! - `POST {endpoint}/tasks`：投递任务
//! - `POST {endpoint}/tasks/{id}/cancel`：取消任务

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use taskpool_core::{
    models::{ProbeResponse, TaskExecutionMessage, WorkerInfo},
    traits::{WorkerProber, WorkerTransport},
    SchedulerError, SchedulerResult,
};

pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(request_timeout: Duration) -> SchedulerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { client })
    }

    /// 复用已有的连接池
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(worker: &WorkerInfo, path: &str) -> String {
        format!("{}{}", worker.endpoint_url.trim_end_matches('/'), path)
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        url: String,
        body: &T,
    ) -> SchedulerResult<()> {
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("请求 {url} 失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Network(format!(
                "{url} 返回错误状态 {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerProber for HttpWorkerClient {
    async fn probe(&self, worker: &WorkerInfo) -> SchedulerResult<ProbeResponse> {
        let url = Self::url(worker, "/health");
        let started = Instant::now();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("健康检查 {url} 失败: {e}")))?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok(ProbeResponse {
            ok: response.status().is_success(),
            latency_ms,
        })
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerClient {
    async fn dispatch(
        &self,
        worker: &WorkerInfo,
        message: &TaskExecutionMessage,
    ) -> SchedulerResult<()> {
        self.post_json(Self::url(worker, "/tasks"), message).await?;
        debug!("任务 {} 已投递到Worker {}", message.task_id, worker.id);
        Ok(())
    }

    async fn cancel(&self, worker: &WorkerInfo, task_id: &str) -> SchedulerResult<()> {
        let path = format!("/tasks/{task_id}/cancel");
        self.post_json(Self::url(worker, &path), &serde_json::json!({}))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskpool_core::models::{WorkerLocation, WorkerRegistration};

    #[test]
    fn test_url_joins_without_double_slash() {
        let worker = WorkerInfo::new(WorkerRegistration {
            worker_id: "w-1".to_string(),
            location: WorkerLocation::Remote,
            endpoint_url: "http://10.0.0.2:9000/".to_string(),
            max_concurrent_tasks: 1,
            supported_task_types: vec![],
            performance_factor: None,
        });
        assert_eq!(
            HttpWorkerClient::url(&worker, "/health"),
            "http://10.0.0.2:9000/health"
        );
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_network_error() {
        let client = HttpWorkerClient::new(Duration::from_millis(200)).unwrap();
        let worker = WorkerInfo::new(WorkerRegistration {
            worker_id: "w-1".to_string(),
            location: WorkerLocation::Local,
            // 端口 9 通常没有服务监听
            endpoint_url: "http://127.0.0.1:9".to_string(),
            max_concurrent_tasks: 1,
            supported_task_types: vec![],
            performance_factor: None,
        });

        let result = client.probe(&worker).await;
        assert!(matches!(result, Err(SchedulerError::Network(_))));
    }
}
