//! 下载历史的外部存储边界：任务成功完成后调用一次 `record`。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::task::Task;

/// 写入历史的任务摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub title: String,
    pub file_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    /// 例如 `VIDEO - 1080`
    pub format_info: String,
    pub source: String,
    pub file_size: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

impl TaskSummary {
    pub fn from_task(task: &Task) -> Self {
        let file_path = task.output_file_path.clone();
        let title = file_path
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| task.request.source.clone());
        let file_size = file_path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len());

        Self {
            task_id: task.id.clone(),
            title,
            file_path,
            output_dir: task.actual_output_directory.clone(),
            format_info: task.request.format_info(),
            source: task.request.source.clone(),
            file_size,
            completed_at: task.end_time.unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record(&self, summary: TaskSummary) -> anyhow::Result<()>;
}

/// 追加写入的 JSON Lines 文件
pub struct JsonLinesHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for JsonLinesHistory {
    async fn record(&self, summary: TaskSummary) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&summary)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// 内存中的历史，主要给测试用
#[derive(Default)]
pub struct MemoryHistory {
    records: std::sync::Mutex<Vec<TaskSummary>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TaskSummary> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn record(&self, summary: TaskSummary) -> anyhow::Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?
            .push(summary);
        Ok(())
    }
}
