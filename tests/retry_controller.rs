use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use yt_downloader::config::Settings;
use yt_downloader::downloader::error::AttemptError;
use yt_downloader::downloader::history::MemoryHistory;
use yt_downloader::downloader::invocation::{Invocation, ToolCommand};
use yt_downloader::downloader::supervisor::{AttemptOutput, AttemptRunner, OutputArtifact};
use yt_downloader::ffmpeg::{ArchiveFetcher, FfmpegResolver, ResolveError};
use yt_downloader::task::TaskRegistry;
use yt_downloader::{DownloadManager, SubmitRequest, TaskView, ViewStatus};

/// 每次尝试的脚本化结果
#[derive(Debug, Clone)]
enum Step {
    Succeed(&'static str),
    Fail(&'static str),
    WaitForCancel,
}

struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn invocations(&self) -> Vec<Invocation> {
        self.seen.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl AttemptRunner for ScriptedRunner {
    async fn run(
        &self,
        _task_id: &str,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<AttemptOutput, AttemptError> {
        self.seen.lock().unwrap().push(invocation.clone());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Fail("ERROR: script exhausted"));
        match step {
            Step::Succeed(name) => {
                std::fs::create_dir_all(&invocation.output_dir).unwrap();
                let path = invocation.output_dir.join(name);
                std::fs::write(&path, b"video").unwrap();
                Ok(AttemptOutput {
                    exit_code: 0,
                    artifact: OutputArtifact::Reported(path),
                })
            }
            Step::Fail(stderr) => Err(AttemptError::Exit {
                code: Some(1),
                stderr_tail: stderr.to_string(),
            }),
            Step::WaitForCancel => {
                cancel.cancelled().await;
                Err(AttemptError::Cancelled)
            }
        }
    }
}

struct StubFetcher {
    calls: AtomicUsize,
    succeed: bool,
    delay: Duration,
}

#[async_trait]
impl ArchiveFetcher for StubFetcher {
    async fn fetch(&self, bin_dir: &Path) -> Result<PathBuf, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if !self.succeed {
            return Err(ResolveError::Fetch("404 Not Found".to_string()));
        }
        std::fs::create_dir_all(bin_dir).unwrap();
        let path = bin_dir.join("ffmpeg");
        std::fs::write(&path, b"fake").unwrap();
        Ok(path)
    }
}

struct Harness {
    manager: DownloadManager,
    runner: Arc<ScriptedRunner>,
    fetcher: Arc<StubFetcher>,
    history: Arc<MemoryHistory>,
    _dir: tempfile::TempDir,
}

fn create_harness(steps: Vec<Step>, fetch_succeeds: bool) -> Harness {
    create_harness_with_fetch_delay(steps, fetch_succeeds, Duration::ZERO)
}

fn create_harness_with_fetch_delay(
    steps: Vec<Step>,
    fetch_succeeds: bool,
    fetch_delay: Duration,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let downloads = dir.path().join("downloads");
    std::fs::create_dir_all(&downloads).unwrap();

    let mut settings = Settings::default();
    settings.default_output_dir = downloads.clone();
    settings.retry.network_delay_ms = 5;
    settings.retry.format_delay_ms = 5;
    settings.retry.access_delay_ms = 5;
    settings.retry.timeout_delay_ms = 5;
    settings.retry.unknown_delay_ms = 5;
    settings.ffmpeg.path = None;
    settings.ffmpeg.probe_system = false;
    settings.ffmpeg.install_dir = dir.path().join("ffmpeg");

    let history = Arc::new(MemoryHistory::new());
    let registry = Arc::new(TaskRegistry::new(&settings, history.clone()));
    let runner = ScriptedRunner::new(steps);
    let fetcher = Arc::new(StubFetcher {
        calls: AtomicUsize::new(0),
        succeed: fetch_succeeds,
        delay: fetch_delay,
    });
    let resolver = Arc::new(FfmpegResolver::with_fetcher(
        settings.ffmpeg.clone(),
        fetcher.clone(),
    ));
    let manager = DownloadManager::with_components(
        settings,
        registry,
        runner.clone(),
        resolver,
        ToolCommand::new("yt-dlp", Vec::new()),
    );

    Harness {
        manager,
        runner,
        fetcher,
        history,
        _dir: dir,
    }
}

async fn wait_terminal(manager: &DownloadManager, task_id: &str) -> TaskView {
    for _ in 0..500 {
        let view = manager.snapshot(task_id);
        if view.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} did not finish in time", task_id);
}

const NETWORK: &str = "ERROR: Unable to download webpage: Connection reset by peer";
const FORMAT: &str = "ERROR: Requested format is not available";
const FORBIDDEN: &str = "ERROR: unable to download video data: HTTP Error 403: Forbidden";
const NO_FFMPEG: &str = "ERROR: ffmpeg not found. Please install or provide the path using --ffmpeg-location";

#[tokio::test]
async fn test_exhausts_budget_on_persistent_network_errors() {
    let h = create_harness(vec![Step::Fail(NETWORK); 3], true);
    let id = h
        .manager
        .submit(SubmitRequest::new("https://www.youtube.com/watch?v=abc"))
        .await
        .unwrap();

    let view = wait_terminal(&h.manager, &id).await;
    assert_eq!(view.status, ViewStatus::Error);
    assert_eq!(view.attempt, 3);
    let error = view.error.unwrap();
    assert!(error.contains("重试次数已用尽 (3/3)"), "error: {}", error);
    assert!(error.contains("Connection reset by peer"));

    // 每次网络错误都放宽 socket 超时
    let timeouts: Vec<u64> = h
        .runner
        .invocations()
        .iter()
        .map(|inv| inv.socket_timeout.as_secs())
        .collect();
    assert_eq!(timeouts, vec![15, 30, 45]);

    assert!(!h.manager.registry().is_active(&id));
    assert!(h.history.records().is_empty());
}

#[tokio::test]
async fn test_format_error_relaxes_selector_then_succeeds() {
    let h = create_harness(vec![Step::Fail(FORMAT), Step::Succeed("clip-abc.mp4")], true);
    let id = h
        .manager
        .submit(SubmitRequest::new("https://youtu.be/abc").with_quality("1080"))
        .await
        .unwrap();

    let view = wait_terminal(&h.manager, &id).await;
    assert_eq!(view.status, ViewStatus::Completed);
    assert_eq!(view.progress, 100.0);
    assert_eq!(view.attempt, 2);
    assert!(view.output_path.unwrap().ends_with("clip-abc.mp4"));

    let invocations = h.runner.invocations();
    assert_ne!(invocations[0].format_selector, "best");
    assert_eq!(invocations[1].format_selector, "best");

    let records = h.history.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].format_info, "VIDEO - 1080");
    assert_eq!(records[0].file_size, Some(5));
}

#[tokio::test]
async fn test_access_denied_switches_client() {
    let h = create_harness(vec![Step::Fail(FORBIDDEN), Step::Succeed("a.mp4")], true);
    let id = h
        .manager
        .submit(SubmitRequest::new("https://youtu.be/abc"))
        .await
        .unwrap();

    let view = wait_terminal(&h.manager, &id).await;
    assert_eq!(view.status, ViewStatus::Completed);

    let invocations = h.runner.invocations();
    assert!(invocations[0].extractor_args.is_none());
    assert_eq!(
        invocations[1].extractor_args.as_deref(),
        Some("youtube:player_client=android")
    );
    assert!(
        invocations[1]
            .headers
            .iter()
            .any(|(name, _)| name == "User-Agent")
    );
}

#[tokio::test]
async fn test_missing_ffmpeg_is_resolved_without_consuming_budget() {
    // 缺 ffmpeg 那次不算，后面仍有三次机会
    let steps = vec![
        Step::Fail(NO_FFMPEG),
        Step::Fail(NETWORK),
        Step::Fail(NETWORK),
        Step::Succeed("merged.mkv"),
    ];
    let h = create_harness(steps, true);
    let id = h
        .manager
        .submit(SubmitRequest::new("https://youtu.be/abc").with_format("video_mkv"))
        .await
        .unwrap();

    let view = wait_terminal(&h.manager, &id).await;
    assert_eq!(view.status, ViewStatus::Completed, "message: {}", view.message);
    assert_eq!(view.attempt, 3);
    assert_eq!(h.runner.calls(), 4);
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);

    let invocations = h.runner.invocations();
    assert!(invocations[0].ffmpeg_location.is_none());
    assert!(invocations[1].ffmpeg_location.is_some());
    assert!(invocations[3].to_args().contains(&"--ffmpeg-location".to_string()));
}

#[tokio::test]
async fn test_unresolvable_ffmpeg_fails_with_install_hint() {
    let h = create_harness(vec![Step::Fail(NO_FFMPEG), Step::Succeed("never.mp4")], false);
    let id = h
        .manager
        .submit(SubmitRequest::new("https://youtu.be/abc"))
        .await
        .unwrap();

    let view = wait_terminal(&h.manager, &id).await;
    assert_eq!(view.status, ViewStatus::Error);
    let error = view.error.unwrap();
    assert!(error.contains("ffmpeg"), "error: {}", error);
    assert_eq!(h.runner.calls(), 1);
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_audio_resolves_ffmpeg_up_front() {
    let h = create_harness(vec![Step::Succeed("song-audio.mp3")], true);
    let id = h
        .manager
        .submit(SubmitRequest::new("https://youtu.be/abc").with_format("audio"))
        .await
        .unwrap();

    let view = wait_terminal(&h.manager, &id).await;
    assert_eq!(view.status, ViewStatus::Completed);
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
    let invocations = h.runner.invocations();
    assert!(invocations[0].ffmpeg_location.is_some());
    assert_eq!(invocations[0].format_selector, "bestaudio/best");
}

#[tokio::test]
async fn test_cancel_stops_running_attempt() {
    let h = create_harness(vec![Step::WaitForCancel], true);
    let id = h
        .manager
        .submit(SubmitRequest::new("https://youtu.be/abc"))
        .await
        .unwrap();

    for _ in 0..200 {
        if h.runner.calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.runner.calls(), 1);

    h.manager.cancel(&id).unwrap();
    let view = wait_terminal(&h.manager, &id).await;
    assert_eq!(view.status, ViewStatus::Error);
    assert!(view.cancelled);
    assert_eq!(view.error.as_deref(), Some("下载已取消"));
    assert!(h.history.records().is_empty());

    // 已结束的任务不能再取消
    assert!(h.manager.cancel(&id).is_err());
}

#[tokio::test]
async fn test_cancel_during_ffmpeg_fetch() {
    let h = create_harness_with_fetch_delay(
        vec![Step::Succeed("never.mp3")],
        true,
        Duration::from_secs(30),
    );
    let id = h
        .manager
        .submit(SubmitRequest::new("https://youtu.be/abc").with_format("audio"))
        .await
        .unwrap();

    for _ in 0..200 {
        if h.fetcher.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);

    let started = std::time::Instant::now();
    h.manager.cancel(&id).unwrap();
    let view = wait_terminal(&h.manager, &id).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(view.status, ViewStatus::Error);
    assert!(view.cancelled);
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn test_packaged_download_produces_archive() {
    let h = create_harness(vec![Step::Succeed("clip-abc.mp4")], true);
    let id = h
        .manager
        .submit(SubmitRequest::new("https://youtu.be/abc").packaged(true))
        .await
        .unwrap();

    let view = wait_terminal(&h.manager, &id).await;
    assert_eq!(view.status, ViewStatus::Completed, "message: {}", view.message);

    // 工具写入 temp_<id>，结束后只剩下 zip
    let working_dir = h.runner.invocations()[0].output_dir.clone();
    assert!(working_dir.ends_with(format!("temp_{}", id)));
    assert!(!working_dir.exists());

    let archive = view.output_path.unwrap();
    assert_eq!(archive.file_name().unwrap(), "clip-abc.zip");
    assert!(archive.is_file());
    assert_eq!(view.output_dir.as_deref(), archive.parent());
}
