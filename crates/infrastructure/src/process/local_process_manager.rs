use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use taskpool_core::{
    config::LocalProcessConfig,
    models::{WorkerLocation, WorkerRegistration},
    traits::WorkerProcessManager,
    SchedulerError, SchedulerResult,
};

struct ManagedProcess {
    child: Child,
    port_offset: u16,
}

#[derive(Default)]
struct ProcessTable {
    processes: HashMap<String, ManagedProcess>,
    used_offsets: BTreeSet<u16>,
    spawned_total: u64,
}

/// 以操作系统进程方式运行本地Worker
///
/// 每个Worker占用 `base_port` 起的一个端口，退出后端口可被复用。
/// Worker ID 带有本次运行的标识，重启后不会与存储中遗留的记录重名。
pub struct LocalProcessManager {
    config: LocalProcessConfig,
    host_name: String,
    run_id: String,
    table: Mutex<ProcessTable>,
}

impl LocalProcessManager {
    pub fn new(config: LocalProcessConfig) -> Self {
        let host_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            config,
            host_name,
            run_id,
            table: Mutex::new(ProcessTable::default()),
        }
    }

    fn worker_id(&self, sequence: u64) -> String {
        format!("{}-{}-local-{}", self.host_name, self.run_id, sequence)
    }

    fn render_args(&self, worker_id: &str, port: u16) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{worker_id}", worker_id)
            })
            .collect()
    }

    pub async fn running_count(&self) -> usize {
        self.table.lock().await.processes.len()
    }
}

#[async_trait]
impl WorkerProcessManager for LocalProcessManager {
    async fn spawn(&self) -> SchedulerResult<WorkerRegistration> {
        let mut table = self.table.lock().await;

        let offset = (0..=u16::MAX)
            .find(|o| !table.used_offsets.contains(o))
            .ok_or_else(|| SchedulerError::Process("没有可用端口".to_string()))?;
        let port = self
            .config
            .base_port
            .checked_add(offset)
            .ok_or_else(|| SchedulerError::Process("端口超出范围".to_string()))?;

        table.spawned_total += 1;
        let worker_id = self.worker_id(table.spawned_total);
        let args = self.render_args(&worker_id, port);

        let child = Command::new(&self.config.program)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SchedulerError::Process(format!("启动Worker进程 {} 失败: {e}", self.config.program))
            })?;

        info!(
            worker_id = %worker_id,
            pid = child.id(),
            port = port,
            "本地Worker进程已启动"
        );

        table.used_offsets.insert(offset);
        table.processes.insert(
            worker_id.clone(),
            ManagedProcess {
                child,
                port_offset: offset,
            },
        );

        Ok(WorkerRegistration {
            worker_id,
            location: WorkerLocation::Local,
            endpoint_url: format!("http://{}:{}", self.config.host, port),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            supported_task_types: self.config.supported_task_types.clone(),
            performance_factor: None,
        })
    }

    async fn terminate(&self, worker_id: &str) -> SchedulerResult<()> {
        let process = {
            let mut table = self.table.lock().await;
            let process = table.processes.remove(worker_id);
            if let Some(p) = &process {
                table.used_offsets.remove(&p.port_offset);
            }
            process
        };

        let Some(mut process) = process else {
            return Ok(());
        };

        if let Err(e) = process.child.kill().await {
            // 进程可能已经自行退出
            warn!("终止Worker进程 {} 失败: {}", worker_id, e);
        } else {
            info!("本地Worker进程已终止: {}", worker_id);
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "os_process"
    }
}
