use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::downloader::error::DownloadError;
use crate::progress::{Phase, ProgressUpdate, Provenance};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Starting,
    Initializing,
    Downloading,
    Finalizing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

/// 清晰度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Best,
    P2160,
    P1440,
    P1080,
    P720,
    P480,
    P360,
}

impl Quality {
    /// 最大高度，`Best` 不限制
    pub fn height(self) -> Option<u32> {
        match self {
            Quality::Best => None,
            Quality::P2160 => Some(2160),
            Quality::P1440 => Some(1440),
            Quality::P1080 => Some(1080),
            Quality::P720 => Some(720),
            Quality::P480 => Some(480),
            Quality::P360 => Some(360),
        }
    }
}

impl FromStr for Quality {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().trim_end_matches('p') {
            "best" => Ok(Quality::Best),
            "2160" => Ok(Quality::P2160),
            "1440" => Ok(Quality::P1440),
            "1080" => Ok(Quality::P1080),
            "720" => Ok(Quality::P720),
            "480" => Ok(Quality::P480),
            "360" => Ok(Quality::P360),
            _ => Err(DownloadError::InvalidInput(format!("不支持的清晰度: {}", s))),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.height() {
            Some(h) => write!(f, "{}", h),
            None => write!(f, "best"),
        }
    }
}

/// 输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatType {
    Video,
    Audio,
    VideoWebm,
    VideoMkv,
}

impl FormatType {
    /// 是否一开始就需要 ffmpeg
    pub fn requires_codec(self) -> bool {
        matches!(self, FormatType::Audio)
    }

    /// `--merge-output-format` 的容器
    pub fn merge_container(self) -> Option<&'static str> {
        match self {
            FormatType::VideoWebm => Some("webm"),
            FormatType::VideoMkv => Some("mkv"),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormatType::Video => "video",
            FormatType::Audio => "audio",
            FormatType::VideoWebm => "video_webm",
            FormatType::VideoMkv => "video_mkv",
        }
    }
}

impl FromStr for FormatType {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "video" => Ok(FormatType::Video),
            "audio" => Ok(FormatType::Audio),
            "video_webm" => Ok(FormatType::VideoWebm),
            "video_mkv" => Ok(FormatType::VideoMkv),
            _ => Err(DownloadError::InvalidInput(format!("不支持的格式: {}", s))),
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调用方提交的原始参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub source: String,
    pub quality: String,
    pub format: String,
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub package_as_archive: bool,
}

impl SubmitRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            quality: "best".to_string(),
            format: "video".to_string(),
            destination: None,
            package_as_archive: false,
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn packaged(mut self, package: bool) -> Self {
        self.package_as_archive = package;
        self
    }
}

/// 校验后的任务参数
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRequest {
    pub source: String,
    pub quality: Quality,
    pub format: FormatType,
    pub destination: PathBuf,
    pub package_as_archive: bool,
}

impl DownloadRequest {
    /// Shorts 之类的短视频走更严格的超时
    pub fn is_short_form(&self) -> bool {
        self.source.contains("shorts")
    }

    /// 实际交给工具的输出目录：打包时先下到临时目录
    pub fn working_dir(&self, task_id: &str) -> PathBuf {
        if self.package_as_archive {
            self.destination.join(format!("temp_{}", task_id))
        } else {
            self.destination.clone()
        }
    }

    /// 例如 `VIDEO - 1080`
    pub fn format_info(&self) -> String {
        format!("{} - {}", self.format.as_str().to_uppercase(), self.quality)
    }
}

/// 任务
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub request: DownloadRequest,
    pub status: TaskStatus,
    pub phase: Phase,
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_progress_update: DateTime<Utc>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_seconds: Option<u64>,
    pub provenance: Option<Provenance>,
    pub speed_provenance: Option<Provenance>,
    pub paused: bool,
    pub cancelled: bool,
    pub output_file_path: Option<PathBuf>,
    pub actual_output_directory: Option<PathBuf>,
    /// 当前第几次尝试（从 1 开始）
    pub attempt: u32,
}

impl Task {
    pub fn new(id: String, request: DownloadRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            status: TaskStatus::Starting,
            phase: Phase::Probing,
            progress: 0.0,
            message: "任务已创建，等待开始...".to_string(),
            error: None,
            start_time: now,
            end_time: None,
            last_progress_update: now,
            speed_bytes_per_sec: None,
            eta_seconds: None,
            provenance: None,
            speed_provenance: None,
            paused: false,
            cancelled: false,
            output_file_path: None,
            actual_output_directory: None,
            attempt: 0,
        }
    }

    /// 只接受不小于当前值的进度，返回是否前进
    pub fn advance_progress(&mut self, value: f64) -> bool {
        let value = value.clamp(0.0, 100.0);
        if value > self.progress {
            self.progress = value;
            self.last_progress_update = Utc::now();
            true
        } else {
            false
        }
    }

    /// 应用解析器给出的一次进度变化
    pub fn apply_progress(&mut self, update: &ProgressUpdate) {
        if self.advance_progress(update.progress) {
            self.provenance = Some(update.provenance);
        }
        self.phase = update.phase;
        self.status = match update.phase {
            Phase::Probing | Phase::FetchingMetadata => TaskStatus::Initializing,
            Phase::Downloading => TaskStatus::Downloading,
            Phase::Merging | Phase::WritingMetadata | Phase::Done => TaskStatus::Finalizing,
        };
        if update.speed.is_some() {
            self.speed_bytes_per_sec = update.speed;
            self.speed_provenance = update.speed_provenance;
        }
        if update.eta.is_some() {
            self.eta_seconds = update.eta;
        }
        if !update.message.is_empty() {
            self.message = update.message.clone();
        }
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.id.clone(),
            status: ViewStatus::from(self.status),
            progress: self.progress,
            message: self.message.clone(),
            speed: self.speed_bytes_per_sec,
            eta: self.eta_seconds,
            error: self.error.clone(),
            output_path: self.output_file_path.clone(),
            output_dir: self.actual_output_directory.clone(),
            paused: self.paused,
            cancelled: self.cancelled,
            attempt: self.attempt,
            simulated: self.provenance == Some(Provenance::Simulated),
            start_time: Some(self.start_time),
            end_time: self.end_time,
        }
    }
}

/// 对外状态，额外包含 `not_found`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStatus {
    Starting,
    Initializing,
    Downloading,
    Finalizing,
    Completed,
    Error,
    NotFound,
}

impl From<TaskStatus> for ViewStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Starting => ViewStatus::Starting,
            TaskStatus::Initializing => ViewStatus::Initializing,
            TaskStatus::Downloading => ViewStatus::Downloading,
            TaskStatus::Finalizing => ViewStatus::Finalizing,
            TaskStatus::Completed => ViewStatus::Completed,
            TaskStatus::Error => ViewStatus::Error,
        }
    }
}

/// 轮询快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: ViewStatus,
    pub progress: f64,
    pub message: String,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub paused: bool,
    pub cancelled: bool,
    pub attempt: u32,
    /// 当前进度是否为模拟值
    pub simulated: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TaskView {
    /// 未知或已过期的任务
    pub fn not_found(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: ViewStatus::NotFound,
            progress: 0.0,
            message: "任务不存在或已过期".to_string(),
            speed: None,
            eta: None,
            error: None,
            output_path: None,
            output_dir: None,
            paused: false,
            cancelled: false,
            attempt: 0,
            simulated: false,
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ViewStatus::Completed | ViewStatus::Error | ViewStatus::NotFound
        )
    }
}

/// 任务的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        /// 无法确定具体文件时为 `None`
        output_file: Option<PathBuf>,
        output_dir: PathBuf,
        /// 附加说明，例如打包失败
        note: Option<String>,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quality_and_format() {
        assert_eq!("1080".parse::<Quality>().unwrap(), Quality::P1080);
        assert_eq!("720p".parse::<Quality>().unwrap(), Quality::P720);
        assert_eq!("BEST".parse::<Quality>().unwrap(), Quality::Best);
        assert!("999".parse::<Quality>().is_err());
        assert_eq!("video_mkv".parse::<FormatType>().unwrap(), FormatType::VideoMkv);
        assert!(matches!(
            "flac".parse::<FormatType>(),
            Err(DownloadError::InvalidInput(_))
        ));
    }

    #[test]
    fn progress_never_goes_backwards() {
        let request = DownloadRequest {
            source: "https://youtu.be/x".to_string(),
            quality: Quality::Best,
            format: FormatType::Video,
            destination: PathBuf::from("/tmp"),
            package_as_archive: false,
        };
        let mut task = Task::new("t".to_string(), request);
        assert!(task.advance_progress(40.0));
        assert!(!task.advance_progress(30.0));
        assert_eq!(task.progress, 40.0);
        assert!(task.advance_progress(250.0));
        assert_eq!(task.progress, 100.0);
    }
}
