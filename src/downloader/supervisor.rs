//! 进程监督器
//!
//! 启动 yt-dlp 子进程，并发运行两个协作单元：
//! - 读取单元：逐行读取 stdout/stderr，喂给进度解析器并写回注册表；
//! - 看门狗：按固定间隔检查取消、暂停、空闲超时，并驱动模拟进度。
//!
//! 任一单元结束后另一个随之丢弃，子进程在取消或超时时被杀掉。

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chardetng::EncodingDetector;
use itertools::Itertools;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::AttemptError;
use super::invocation::Invocation;
use crate::config::{ProgressConfig, Settings, WatchdogConfig};
use crate::progress::{Phase, ProgressParser, ProgressUpdate};
use crate::task::TaskRegistry;

/// 输出文件的确定方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputArtifact {
    /// 工具输出中明确报告
    Reported(PathBuf),
    /// 扫描目录得到的最近修改文件
    Scanned(PathBuf),
    Unresolved,
}

impl OutputArtifact {
    pub fn path(&self) -> Option<&Path> {
        match self {
            OutputArtifact::Reported(p) | OutputArtifact::Scanned(p) => Some(p),
            OutputArtifact::Unresolved => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptOutput {
    pub exit_code: i32,
    pub artifact: OutputArtifact,
}

/// 执行一次尝试，测试中可以替换成脚本化实现
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run(
        &self,
        task_id: &str,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<AttemptOutput, AttemptError>;
}

pub struct ProcessSupervisor {
    registry: Arc<TaskRegistry>,
    watchdog: WatchdogConfig,
    progress: ProgressConfig,
}

/// 读取单元和看门狗共享的状态
struct AttemptState {
    parser: ProgressParser,
    last_activity: Instant,
    stderr_tail: VecDeque<String>,
    tail_limit: usize,
}

impl AttemptState {
    fn push_stderr(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if self.stderr_tail.len() == self.tail_limit.max(1) {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line.trim().to_string());
    }
}

enum Verdict {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut { phase: Phase, idle: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl ProcessSupervisor {
    pub fn new(registry: Arc<TaskRegistry>, settings: &Settings) -> Self {
        Self {
            registry,
            watchdog: settings.watchdog.clone(),
            progress: settings.progress.clone(),
        }
    }

    /// 当前阶段允许的最长无输出时间
    fn idle_limit(&self, phase: Phase, short_form: bool) -> Duration {
        let secs = match phase {
            p if p.is_pre_download() && short_form => self.watchdog.short_init_timeout_secs,
            p if p.is_pre_download() => self.watchdog.init_timeout_secs,
            Phase::Downloading => self.watchdog.stall_timeout_secs,
            _ => self.watchdog.postprocess_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    fn apply(&self, task_id: &str, update: Option<ProgressUpdate>) {
        if let Some(update) = update {
            let _ = self.registry.update(task_id, |task| task.apply_progress(&update));
        }
    }

    fn on_line(&self, task_id: &str, line: &str, stream: Stream, state: &Mutex<AttemptState>) {
        debug!(task_id = %task_id, "[yt-dlp {:?}] {}", stream, line);
        let now = Instant::now();
        let update = match state.lock() {
            Ok(mut s) => {
                s.last_activity = now;
                if stream == Stream::Stderr {
                    s.push_stderr(line);
                }
                s.parser.feed_line(line, now)
            }
            Err(_) => None,
        };
        self.apply(task_id, update);
    }

    fn on_chunk(&self, task_id: &str, bytes: &[u8], stream: Stream, state: &Mutex<AttemptState>) {
        let text = decode_line(bytes);
        for line in text.split(['\r', '\n']).filter(|l| !l.trim().is_empty()) {
            self.on_line(task_id, line, stream, state);
        }
    }

    async fn read_streams<R1, R2>(
        &self,
        task_id: &str,
        stdout: R1,
        stderr: R2,
        state: &Mutex<AttemptState>,
    ) where
        R1: tokio::io::AsyncRead + Unpin,
        R2: tokio::io::AsyncRead + Unpin,
    {
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        // 缓冲区放在循环外：select 取消的 read_until 已读出的部分会保留下来
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                read = stdout.read_until(b'\n', &mut out_buf), if !out_done => match read {
                    Ok(0) => out_done = true,
                    Ok(_) => {
                        self.on_chunk(task_id, &out_buf, Stream::Stdout, state);
                        out_buf.clear();
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, "读取 stdout 失败: {}", e);
                        out_done = true;
                    }
                },
                read = stderr.read_until(b'\n', &mut err_buf), if !err_done => match read {
                    Ok(0) => err_done = true,
                    Ok(_) => {
                        self.on_chunk(task_id, &err_buf, Stream::Stderr, state);
                        err_buf.clear();
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, "读取 stderr 失败: {}", e);
                        err_done = true;
                    }
                },
            }
        }
    }

    async fn watch(
        &self,
        task_id: &str,
        pid: Option<u32>,
        short_form: bool,
        cancel: &CancellationToken,
        state: &Mutex<AttemptState>,
    ) -> Verdict {
        let mut interval = tokio::time::interval(self.watchdog.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let started = Instant::now();
        let mut paused_since: Option<Instant> = None;
        let mut paused_total = Duration::ZERO;
        let mut soft_warned = false;
        let soft_warning = Duration::from_secs(if short_form {
            self.watchdog.short_soft_warning_secs
        } else {
            self.watchdog.soft_warning_secs
        });
        let hard_timeout = Duration::from_secs(self.watchdog.short_hard_timeout_secs);

        loop {
            interval.tick().await;
            let now = Instant::now();

            if cancel.is_cancelled() || self.registry.is_cancelled(task_id) {
                return Verdict::Cancelled;
            }

            let paused = self.registry.is_paused(task_id);
            match (paused, paused_since) {
                (true, None) => {
                    suspend(pid);
                    paused_since = Some(now);
                    info!(task_id = %task_id, "下载已暂停");
                    let _ = self
                        .registry
                        .update(task_id, |t| t.message = "下载已暂停".to_string());
                    continue;
                }
                (true, Some(_)) => continue,
                (false, Some(since)) => {
                    resume(pid);
                    let frozen = now.saturating_duration_since(since);
                    paused_total += frozen;
                    paused_since = None;
                    if let Ok(mut s) = state.lock() {
                        // 暂停期间不计入空闲时间
                        s.last_activity += frozen;
                    }
                    info!(task_id = %task_id, "继续下载");
                    let _ = self
                        .registry
                        .update(task_id, |t| t.message = "继续下载...".to_string());
                }
                (false, None) => {}
            }

            let (idle, phase, update) = match state.lock() {
                Ok(mut s) => {
                    let update = s.parser.tick(now);
                    (
                        now.saturating_duration_since(s.last_activity),
                        s.parser.phase(),
                        update,
                    )
                }
                Err(_) => return Verdict::Cancelled,
            };
            self.apply(task_id, update);

            if idle >= self.idle_limit(phase, short_form) {
                warn!(task_id = %task_id, ?phase, "下载无响应 {} 秒", idle.as_secs());
                return Verdict::TimedOut { phase, idle };
            }

            let active = now.saturating_duration_since(started).saturating_sub(paused_total);
            if short_form && active >= hard_timeout {
                warn!(task_id = %task_id, "短视频下载超过 {} 秒", hard_timeout.as_secs());
                return Verdict::TimedOut {
                    phase,
                    idle: active,
                };
            }
            if !soft_warned && active >= soft_warning {
                soft_warned = true;
                let message = if short_form {
                    "短视频下载时间较长，可能是网络较慢，请耐心等待..."
                } else {
                    "下载时间过长，可能是网络较慢或文件较大，请耐心等待..."
                };
                warn!(task_id = %task_id, "{}", message);
                let _ = self
                    .registry
                    .update(task_id, |t| t.message = message.to_string());
            }
        }
    }
}

#[async_trait]
impl AttemptRunner for ProcessSupervisor {
    async fn run(
        &self,
        task_id: &str,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<AttemptOutput, AttemptError> {
        let output_dir = &invocation.output_dir;
        tokio::fs::create_dir_all(output_dir).await?;

        let start_progress = self.registry.read(task_id, |t| t.progress).unwrap_or(0.0);
        let state = Mutex::new(AttemptState {
            parser: ProgressParser::resume_from(start_progress, self.progress.clone(), Instant::now()),
            last_activity: Instant::now(),
            stderr_tail: VecDeque::new(),
            tail_limit: self.watchdog.stderr_tail_lines,
        });

        let args = invocation.to_args();
        debug!(task_id = %task_id, "启动 {} {}", invocation.tool.program.display(), args.join(" "));

        let mut cmd = invocation.tool.command();
        cmd.args(&args)
            .current_dir(output_dir)
            // 让工具把临时文件和配置目录放在下载目录里
            .env("USERPROFILE", output_dir)
            .env("TEMP", output_dir)
            .env("TMP", output_dir)
            .env("TMPDIR", output_dir)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // 独立进程组，终止和暂停时连同 ffmpeg 等子进程一起处理
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn().map_err(AttemptError::Spawn)?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AttemptError::Io(std::io::Error::other("无法获取 stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AttemptError::Io(std::io::Error::other("无法获取 stderr")))?;

        let _ = self.registry.update(task_id, |t| {
            t.message = "正在解析视频信息...".to_string();
        });

        let verdict = {
            let run = async {
                self.read_streams(task_id, stdout, stderr, &state).await;
                child.wait().await
            };
            tokio::select! {
                status = run => Verdict::Exited(status),
                verdict = self.watch(task_id, pid, invocation.short_form, &cancel, &state) => verdict,
                _ = cancel.cancelled() => Verdict::Cancelled,
            }
        };

        let status = match verdict {
            Verdict::Exited(status) => status?,
            Verdict::Cancelled => {
                terminate(&mut child, pid).await;
                info!(task_id = %task_id, "已终止下载进程");
                return Err(AttemptError::Cancelled);
            }
            Verdict::TimedOut { phase, idle } => {
                terminate(&mut child, pid).await;
                return Err(AttemptError::Timeout { phase, idle });
            }
        };

        let (reported, tail) = match state.lock() {
            Ok(mut s) => {
                let finished = status.success().then(|| s.parser.mark_finished());
                self.apply(task_id, finished);
                (
                    s.parser.destination().map(Path::to_path_buf),
                    s.stderr_tail.iter().join("\n"),
                )
            }
            Err(_) => (None, String::new()),
        };

        if !status.success() {
            return Err(AttemptError::Exit {
                code: status.code(),
                stderr_tail: tail,
            });
        }

        let artifact = resolve_artifact(reported, output_dir);
        debug!(task_id = %task_id, ?artifact, "下载进程正常退出");
        Ok(AttemptOutput {
            exit_code: status.code().unwrap_or(0),
            artifact,
        })
    }
}

/// 优先使用工具报告且确实存在的文件，否则扫描目录
pub fn resolve_artifact(reported: Option<PathBuf>, output_dir: &Path) -> OutputArtifact {
    if let Some(path) = reported {
        let path = if path.is_relative() {
            output_dir.join(path)
        } else {
            path
        };
        if path.is_file() {
            return OutputArtifact::Reported(path);
        }
    }
    match newest_file(output_dir) {
        Some(path) => OutputArtifact::Scanned(path),
        None => OutputArtifact::Unresolved,
    }
}

/// 目录中最近修改的文件，忽略未完成的临时文件
pub fn newest_file(dir: &Path) -> Option<PathBuf> {
    const PARTIAL: &[&str] = &["part", "ytdl", "tmp", "temp"];

    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let name = path.file_name()?.to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            let partial = path
                .extension()
                .map(|ext| PARTIAL.contains(&ext.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false);
            if partial {
                return None;
            }
            Some((meta.modified().ok()?, path))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// 非 UTF-8 输出按检测到的编码解码
fn decode_line(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let mut detector = EncodingDetector::new();
            detector.feed(bytes, true);
            let encoding = detector.guess(None, true);
            let (decoded, _, _) = encoding.decode(bytes);
            decoded.into_owned()
        }
    }
}

async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>) {
    // 暂停中的进程也要先恢复，避免信号堆积
    resume(pid);
    kill_group(pid);
    if let Err(e) = child.kill().await {
        debug!("终止下载进程失败（可能已退出）: {}", e);
    }
}

/// 向子进程所在的进程组发送信号，进程组号即子进程号
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: kill(2) 只向本进程启动的进程组发送信号，不涉及内存操作
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!("发送信号 {} 到进程组 {} 失败", signal, pgid);
    }
}

#[cfg(unix)]
fn suspend(pid: Option<u32>) {
    signal_group(pid, libc::SIGSTOP);
}

#[cfg(unix)]
fn resume(pid: Option<u32>) {
    signal_group(pid, libc::SIGCONT);
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(not(unix))]
fn suspend(_pid: Option<u32>) {}

#[cfg(not(unix))]
fn resume(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_gbk_bytes() {
        // "下载" in GBK
        let bytes = [0xcf, 0xc2, 0xd4, 0xd8];
        let text = decode_line(&bytes);
        assert!(!text.is_empty());
        assert_eq!(decode_line("[download] 5.0%".as_bytes()), "[download] 5.0%");
    }

    #[test]
    fn newest_file_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(dir.path().join("b.mp4.part"), b"b").unwrap();
        assert_eq!(newest_file(dir.path()), Some(dir.path().join("a.mp4")));
    }

    #[test]
    fn reported_path_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let reported = dir.path().join("clip.mp4");
        std::fs::write(&reported, b"x").unwrap();
        std::fs::write(dir.path().join("newer.mp4"), b"y").unwrap();
        assert_eq!(
            resolve_artifact(Some(reported.clone()), dir.path()),
            OutputArtifact::Reported(reported)
        );
        assert!(matches!(
            resolve_artifact(Some(dir.path().join("gone.mp4")), dir.path()),
            OutputArtifact::Scanned(_)
        ));
        let empty = tempfile::tempdir().unwrap();
        assert_eq!(resolve_artifact(None, empty.path()), OutputArtifact::Unresolved);
    }
}
