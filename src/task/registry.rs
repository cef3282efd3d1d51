use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info, warn};
use url::Url;

use super::models::{DownloadRequest, Outcome, SubmitRequest, Task, TaskStatus, TaskView};
use crate::config::Settings;
use crate::downloader::error::DownloadError;
use crate::downloader::history::{HistoryStore, TaskSummary};

/// 任务注册表
///
/// 活跃任务与已完成任务分两个分区保存，同一个 ID 任意时刻最多出现在一个分区里。
/// 所有修改都通过 [`TaskRegistry::update`] 在分片锁内完成，读到的要么是修改前的值，
/// 要么是修改后的值。
pub struct TaskRegistry {
    active: DashMap<String, Task>,
    completed: DashMap<String, Task>,
    allowed_hosts: Vec<String>,
    default_output_dir: PathBuf,
    retention: TimeDelta,
    history: Arc<dyn HistoryStore>,
}

impl TaskRegistry {
    pub fn new(settings: &Settings, history: Arc<dyn HistoryStore>) -> Self {
        let retention = retention_window(settings.retention.retention_secs);
        Self {
            active: DashMap::new(),
            completed: DashMap::new(),
            allowed_hosts: settings
                .allowed_hosts
                .iter()
                .map(|h| h.trim().to_lowercase())
                .collect(),
            default_output_dir: settings.default_output_dir.clone(),
            retention,
            history,
        }
    }

    /// 校验提交参数：来源链接、清晰度、格式
    pub fn validate(&self, request: &SubmitRequest) -> Result<DownloadRequest, DownloadError> {
        let source = validate_source(&request.source, &self.allowed_hosts)?;
        Ok(DownloadRequest {
            source,
            quality: request.quality.parse()?,
            format: request.format.parse()?,
            destination: request
                .destination
                .clone()
                .unwrap_or_else(|| self.default_output_dir.clone()),
            package_as_archive: request.package_as_archive,
        })
    }

    /// 创建任务并返回 ID
    pub fn create(&self, request: &SubmitRequest) -> Result<String, DownloadError> {
        let request = self.validate(request)?;
        Ok(self.insert(request))
    }

    /// 插入已校验的任务
    pub fn insert(&self, request: DownloadRequest) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        debug!(task_id = %task_id, source = %request.source, "创建下载任务");
        self.active
            .insert(task_id.clone(), Task::new(task_id.clone(), request));
        task_id
    }

    pub fn get(&self, task_id: &str) -> Result<TaskView, DownloadError> {
        if let Some(task) = self.active.get(task_id) {
            return Ok(task.view());
        }
        self.completed
            .get(task_id)
            .map(|task| task.view())
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))
    }

    /// 只读访问完整任务（活跃或已完成）
    pub fn read<R>(&self, task_id: &str, f: impl FnOnce(&Task) -> R) -> Option<R> {
        if let Some(task) = self.active.get(task_id) {
            return Some(f(&task));
        }
        self.completed.get(task_id).map(|task| f(&task))
    }

    /// 修改活跃任务，闭包在分片写锁内执行，不能再访问注册表
    pub fn update(
        &self,
        task_id: &str,
        mutator: impl FnOnce(&mut Task),
    ) -> Result<(), DownloadError> {
        match self.active.get_mut(task_id) {
            Some(mut task) => {
                mutator(&mut task);
                Ok(())
            }
            None if self.completed.contains_key(task_id) => {
                Err(DownloadError::TaskAlreadyFinalized(task_id.to_string()))
            }
            None => Err(DownloadError::TaskNotFound(task_id.to_string())),
        }
    }

    /// 结束任务：活跃 → 已完成，只能成功一次
    ///
    /// 成功完成时通知历史存储。
    pub async fn finalize(&self, task_id: &str, outcome: Outcome) -> Result<TaskView, DownloadError> {
        let task = match self.active.entry(task_id.to_string()) {
            Entry::Occupied(entry) => {
                let mut task = entry.get().clone();
                apply_outcome(&mut task, &outcome, Utc::now());
                // 先放进已完成分区再移除，持有 entry 期间其他读者看不到中间状态
                self.completed.insert(task_id.to_string(), task.clone());
                entry.remove();
                task
            }
            Entry::Vacant(_) => {
                return Err(if self.completed.contains_key(task_id) {
                    DownloadError::TaskAlreadyFinalized(task_id.to_string())
                } else {
                    DownloadError::TaskNotFound(task_id.to_string())
                });
            }
        };

        match &outcome {
            Outcome::Completed { .. } => {
                info!(task_id = %task_id, "✅ 下载完成");
                if let Err(e) = self.history.record(TaskSummary::from_task(&task)).await {
                    error!(task_id = %task_id, "写入下载历史失败: {:#}", e);
                }
            }
            Outcome::Failed { message } => {
                warn!(task_id = %task_id, "❌ 下载失败: {}", message);
            }
            Outcome::Cancelled => {
                info!(task_id = %task_id, "下载已取消");
            }
        }

        Ok(task.view())
    }

    /// 清理超过保留时间的已完成任务
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.completed.retain(|_, task| {
            let keep = task
                .end_time
                .is_none_or(|end| now.signed_duration_since(end) < self.retention);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!("清理了 {} 个过期任务", removed);
        }
        removed
    }

    /// 任务已不在活跃分区也视为取消
    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.active.get(task_id).is_none_or(|task| task.cancelled)
    }

    pub fn is_paused(&self, task_id: &str) -> bool {
        self.active.get(task_id).is_some_and(|task| task.paused)
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed.contains_key(task_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

fn apply_outcome(task: &mut Task, outcome: &Outcome, now: DateTime<Utc>) {
    task.end_time = Some(now);
    task.paused = false;
    match outcome {
        Outcome::Completed {
            output_file,
            output_dir,
            note,
        } => {
            task.status = TaskStatus::Completed;
            task.advance_progress(100.0);
            task.message = match note {
                Some(note) => format!("下载已完成，{}", note),
                None => "下载已完成!".to_string(),
            };
            task.output_file_path = output_file.clone();
            task.actual_output_directory = Some(output_dir.clone());
            task.eta_seconds = Some(0);
        }
        Outcome::Failed { message } => {
            task.status = TaskStatus::Error;
            task.error = Some(message.clone());
            task.message = format!("下载失败: {}", message);
            task.speed_bytes_per_sec = None;
            task.eta_seconds = None;
        }
        Outcome::Cancelled => {
            task.status = TaskStatus::Error;
            task.cancelled = true;
            task.error = Some("下载已取消".to_string());
            task.message = "下载已取消".to_string();
            task.speed_bytes_per_sec = None;
            task.eta_seconds = None;
        }
    }
}

/// 来源必须是允许主机（含子域名）上的 http(s) 链接
pub fn validate_source(source: &str, allowed_hosts: &[String]) -> Result<String, DownloadError> {
    let source = source.trim();
    let url = Url::parse(source)
        .map_err(|e| DownloadError::InvalidInput(format!("无效的链接 {}: {}", source, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DownloadError::InvalidInput(format!(
            "不支持的协议: {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .map(str::to_lowercase)
        .ok_or_else(|| DownloadError::InvalidInput(format!("链接缺少主机名: {}", source)))?;
    let allowed = allowed_hosts
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{}", h)));
    if !allowed {
        return Err(DownloadError::InvalidInput(format!("不支持的网站: {}", host)));
    }
    Ok(source.to_string())
}

/// 保留时长，超出 `TimeDelta` 范围的配置视为永久保留
fn retention_window(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
