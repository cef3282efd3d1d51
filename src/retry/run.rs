use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::classify::classify_attempt;
use super::policy::{ErrorKind, RetryDecision, RetryPolicy};
use crate::config::{Settings, YtDlpConfig};
use crate::downloader::error::{AttemptError, DownloadError};
use crate::downloader::invocation::{Invocation, ToolCommand};
use crate::downloader::package::package_output;
use crate::downloader::supervisor::{AttemptOutput, AttemptRunner};
use crate::ffmpeg::{install_hint, FfmpegResolver, ResolveError};
use crate::task::{DownloadRequest, Outcome, TaskRegistry, TaskStatus, TaskView};

/// 重试控制器：一个任务从第一次尝试到结束的完整流程
pub struct RetryController {
    registry: Arc<TaskRegistry>,
    runner: Arc<dyn AttemptRunner>,
    resolver: Arc<FfmpegResolver>,
    tool: ToolCommand,
    ytdlp: YtDlpConfig,
    policy: RetryPolicy,
    socket_timeout_step: Duration,
}

impl RetryController {
    pub fn new(
        settings: &Settings,
        registry: Arc<TaskRegistry>,
        runner: Arc<dyn AttemptRunner>,
        resolver: Arc<FfmpegResolver>,
        tool: ToolCommand,
    ) -> Self {
        Self {
            registry,
            runner,
            resolver,
            tool,
            ytdlp: settings.ytdlp.clone(),
            policy: RetryPolicy::from_config(&settings.retry),
            socket_timeout_step: Duration::from_secs(settings.retry.socket_timeout_step_secs),
        }
    }

    /// 运行任务直到成功、失败或取消，并结束任务
    pub async fn drive(
        &self,
        task_id: &str,
        cancel: CancellationToken,
    ) -> Result<TaskView, DownloadError> {
        let request = self
            .registry
            .read(task_id, |t| t.request.clone())
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))?;
        let outcome = self.run_attempts(task_id, &request, &cancel).await;
        self.registry.finalize(task_id, outcome).await
    }

    async fn run_attempts(
        &self,
        task_id: &str,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Outcome {
        let working_dir = request.working_dir(task_id);
        let mut invocation =
            Invocation::for_request(self.tool.clone(), request, &working_dir, &self.ytdlp);
        let max = self.policy.max_attempts;

        self.set_message(task_id, TaskStatus::Initializing, "正在准备下载...");

        // 音频转换一开始就需要 ffmpeg；解析失败先不终止，交给后面的分类处理
        let mut dependency_attempted = false;
        if request.format.requires_codec() {
            dependency_attempted = true;
            self.set_message(task_id, TaskStatus::Initializing, "正在检查 ffmpeg...");
            match self.resolve_dependency(cancel).await {
                None => return Outcome::Cancelled,
                Some(Ok(path)) => invocation.ffmpeg_location = Some(path),
                Some(Err(e)) => {
                    warn!(task_id = %task_id, "未能获取 ffmpeg: {}", e);
                    self.set_message(
                        task_id,
                        TaskStatus::Initializing,
                        "警告: 未能获取 ffmpeg，音频转换可能失败",
                    );
                }
            }
        } else if let Some(path) = self.resolver.cached() {
            invocation.ffmpeg_location = Some(path);
        }

        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() || self.registry.is_cancelled(task_id) {
                return Outcome::Cancelled;
            }
            let _ = self.registry.update(task_id, |t| t.attempt = attempt);
            info!(task_id = %task_id, attempt, "开始第 {}/{} 次尝试", attempt, max);

            let error = match self
                .runner
                .run(task_id, &invocation, cancel.child_token())
                .await
            {
                Ok(output) => return self.complete(task_id, request, &working_dir, output).await,
                Err(AttemptError::Cancelled) => return Outcome::Cancelled,
                Err(AttemptError::Spawn(e)) => {
                    return Outcome::Failed {
                        message: format!("无法启动 yt-dlp: {}。请确认已安装 yt-dlp", e),
                    };
                }
                Err(e) => e,
            };

            let kind = classify_attempt(&error);
            let detail = error.detail();
            warn!(task_id = %task_id, attempt, ?kind, "第 {} 次尝试失败: {}", attempt, detail);

            if kind == ErrorKind::MissingDependency {
                if dependency_attempted {
                    return Outcome::Failed {
                        message: format!("下载需要 ffmpeg，但未能自动获取。{}", install_hint()),
                    };
                }
                dependency_attempted = true;
                self.set_message(task_id, TaskStatus::Initializing, "缺少 ffmpeg，正在尝试自动安装...");
                match self.resolve_dependency(cancel).await {
                    None => return Outcome::Cancelled,
                    Some(Ok(path)) => {
                        invocation.ffmpeg_location = Some(path);
                        self.set_message(task_id, TaskStatus::Initializing, "已安装 ffmpeg，正在重试下载...");
                        // 同一原因不再消耗重试次数
                        continue;
                    }
                    Some(Err(e)) => {
                        return Outcome::Failed {
                            message: e.with_install_hint(),
                        };
                    }
                }
            }

            match self.policy.decide(attempt, kind) {
                RetryDecision::NoRetry => {
                    return Outcome::Failed {
                        message: format!(
                            "重试次数已用尽 ({}/{}): {} - {}",
                            attempt,
                            max,
                            kind.label(),
                            summarize(&detail)
                        ),
                    };
                }
                RetryDecision::RetryAfter(delay) => {
                    self.mutate(&mut invocation, kind);
                    let message = format!(
                        "{}，{} ({}/{})",
                        kind.label(),
                        kind.remediation(),
                        attempt + 1,
                        max
                    );
                    self.set_message(task_id, TaskStatus::Initializing, &message);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Outcome::Cancelled,
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// 等待 ffmpeg 解析，取消时返回 `None`。
    /// 其他任务仍在等待的话，共享的解析会继续进行。
    async fn resolve_dependency(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<PathBuf, ResolveError>> {
        tokio::select! {
            result = self.resolver.resolve() => Some(result),
            _ = cancel.cancelled() => None,
        }
    }

    /// 按失败类别调整下一次尝试的参数，调整会累积
    fn mutate(&self, invocation: &mut Invocation, kind: ErrorKind) {
        match kind {
            ErrorKind::Network | ErrorKind::Timeout => {
                invocation.widen_socket_timeout(self.socket_timeout_step)
            }
            ErrorKind::Format => invocation.relax_format(),
            ErrorKind::AccessDenied => invocation.use_alternate_client(),
            ErrorKind::MissingDependency | ErrorKind::Unknown => {}
        }
    }

    async fn complete(
        &self,
        task_id: &str,
        request: &DownloadRequest,
        working_dir: &Path,
        output: AttemptOutput,
    ) -> Outcome {
        let file = output.artifact.path().map(Path::to_path_buf);
        if file.is_none() {
            warn!(task_id = %task_id, "下载成功但无法确定输出文件");
        }

        if !request.package_as_archive {
            let output_dir = file
                .as_deref()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| request.destination.clone());
            return Outcome::Completed {
                output_file: file,
                output_dir,
                note: None,
            };
        }

        let Some(file) = file else {
            return Outcome::Completed {
                output_file: None,
                output_dir: working_dir.to_path_buf(),
                note: Some("未找到可打包的文件".to_string()),
            };
        };

        self.set_message(task_id, TaskStatus::Finalizing, "正在打包文件...");
        match package_output(&file, working_dir, &request.destination).await {
            Ok(archive) => Outcome::Completed {
                output_file: Some(archive),
                output_dir: request.destination.clone(),
                note: None,
            },
            Err(e) => {
                warn!(task_id = %task_id, "打包失败: {}", e);
                Outcome::Completed {
                    output_dir: parent_or(&file, working_dir),
                    output_file: Some(file),
                    note: Some(format!("但打包失败，已保留原文件: {}", e)),
                }
            }
        }
    }

    fn set_message(&self, task_id: &str, status: TaskStatus, message: &str) {
        let _ = self.registry.update(task_id, |t| {
            // 已进入下载阶段后不回退状态
            if matches!(t.status, TaskStatus::Starting | TaskStatus::Initializing)
                || status == TaskStatus::Finalizing
            {
                t.status = status;
            }
            t.message = message.to_string();
        });
    }
}

fn parent_or(file: &Path, fallback: &Path) -> PathBuf {
    file.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| fallback.to_path_buf())
}

/// 错误详情只保留最后一行，避免消息过长
fn summarize(detail: &str) -> String {
    let line = detail
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or(detail)
        .trim();
    if line.chars().count() > 200 {
        let cut: String = line.chars().take(200).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}
