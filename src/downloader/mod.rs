pub mod control;
pub mod error;
pub mod history;
pub mod invocation;
pub mod package;
pub mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::ffmpeg::FfmpegResolver;
use crate::retry::RetryController;
use crate::task::{SubmitRequest, TaskRegistry, TaskView};
use control::TaskControl;
use error::DownloadError;
use history::HistoryStore;
use invocation::ToolCommand;
use supervisor::{AttemptRunner, ProcessSupervisor};

/// 对外入口：提交、轮询、暂停/继续/取消
pub struct DownloadManager {
    settings: Arc<Settings>,
    registry: Arc<TaskRegistry>,
    control: Arc<TaskControl>,
    controller: Arc<RetryController>,
}

impl DownloadManager {
    pub fn new(settings: Settings, history: Arc<dyn HistoryStore>) -> Self {
        let registry = Arc::new(TaskRegistry::new(&settings, history));
        let runner = Arc::new(ProcessSupervisor::new(registry.clone(), &settings));
        let resolver = Arc::new(FfmpegResolver::new(settings.ffmpeg.clone()));
        let tool = ToolCommand::locate(&settings.ytdlp);
        Self::with_components(settings, registry, runner, resolver, tool)
    }

    /// 自定义组件（测试中替换执行器或 ffmpeg 下载器）
    pub fn with_components(
        settings: Settings,
        registry: Arc<TaskRegistry>,
        runner: Arc<dyn AttemptRunner>,
        resolver: Arc<FfmpegResolver>,
        tool: ToolCommand,
    ) -> Self {
        let controller = Arc::new(RetryController::new(
            &settings,
            registry.clone(),
            runner,
            resolver,
            tool,
        ));
        Self {
            settings: Arc::new(settings),
            registry,
            control: Arc::new(TaskControl::new()),
            controller,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// 校验参数、准备目标目录，然后在后台开始下载
    pub async fn submit(&self, request: SubmitRequest) -> Result<String, DownloadError> {
        let mut validated = self.registry.validate(&request)?;
        validated.destination = prepare_destination(&validated.destination).await?;

        let task_id = self.registry.insert(validated);
        let token = self.control.register(&task_id);
        info!(task_id = %task_id, source = %request.source, "📥 提交下载任务");

        let controller = self.controller.clone();
        let control = self.control.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            match controller.drive(&id, token).await {
                Ok(view) => debug!(task_id = %id, status = ?view.status, "任务结束"),
                Err(e) => error!(task_id = %id, "任务结束时出错: {}", e),
            }
            control.unregister(&id);
        });

        Ok(task_id)
    }

    /// 未知或已过期的 ID 返回 `not_found` 快照
    pub fn snapshot(&self, task_id: &str) -> TaskView {
        self.registry
            .get(task_id)
            .unwrap_or_else(|_| TaskView::not_found(task_id))
    }

    pub fn pause(&self, task_id: &str) -> Result<(), DownloadError> {
        self.registry.update(task_id, |t| {
            t.paused = true;
            t.message = "正在暂停...".to_string();
        })
    }

    pub fn resume(&self, task_id: &str) -> Result<(), DownloadError> {
        self.registry.update(task_id, |t| {
            t.paused = false;
            t.message = "正在继续...".to_string();
        })
    }

    pub fn cancel(&self, task_id: &str) -> Result<(), DownloadError> {
        self.registry.update(task_id, |t| {
            t.cancelled = true;
            t.message = "正在取消...".to_string();
        })?;
        self.control.cancel(task_id);
        Ok(())
    }

    pub fn cancel_all(&self) {
        for task_id in self.registry.active_ids() {
            let _ = self.cancel(&task_id);
        }
        self.control.cancel_all();
    }

    /// 仍在运行的任务数
    pub fn running(&self) -> usize {
        self.control.running()
    }

    /// 定期清理过期的已完成任务
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let period = Duration::from_secs(self.settings.retention.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 第一次 tick 立即返回
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.sweep();
            }
        })
    }
}

/// 创建目标目录并确认可写，返回绝对路径
pub async fn prepare_destination(dir: &Path) -> Result<PathBuf, DownloadError> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        DownloadError::InvalidInput(format!("无法创建目标目录 {}: {}", dir.display(), e))
    })?;

    let probe = dir.join(format!(".write_test_{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&probe, b"ok").await.map_err(|e| {
        DownloadError::InvalidInput(format!("目标目录不可写 {}: {}", dir.display(), e))
    })?;
    let _ = tokio::fs::remove_file(&probe).await;

    Ok(tokio::fs::canonicalize(dir)
        .await
        .unwrap_or_else(|_| dir.to_path_buf()))
}
