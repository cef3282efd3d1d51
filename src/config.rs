//! 运行配置：可选的 JSON 配置文件 + 环境变量覆盖。
//!
//! 所有分节都带 `#[serde(default)]`，配置文件只需要写想改的字段。

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// yt-dlp 可执行程序相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YtDlpConfig {
    /// 程序名或路径
    pub program: String,
    /// 程序不在 PATH 中时的备用调用方式，例如 `["python3", "-m", "yt_dlp"]`
    pub python_fallback: Vec<String>,
    /// 传给工具自身的 `--retries`
    pub retries: u32,
    /// 首次尝试的 `--socket-timeout`（秒）
    pub socket_timeout_secs: u64,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            python_fallback: vec![
                if cfg!(windows) { "python" } else { "python3" }.to_string(),
                "-m".to_string(),
                "yt_dlp".to_string(),
            ],
            retries: 2,
            socket_timeout_secs: 15,
        }
    }
}

/// 重试控制器参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（包含第一次）
    pub max_attempts: u32,
    pub network_delay_ms: u64,
    pub format_delay_ms: u64,
    pub access_delay_ms: u64,
    pub timeout_delay_ms: u64,
    pub unknown_delay_ms: u64,
    /// 网络类错误每次重试增加的 socket 超时（秒）
    pub socket_timeout_step_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            network_delay_ms: 2000,
            format_delay_ms: 1000,
            access_delay_ms: 1000,
            timeout_delay_ms: 2000,
            unknown_delay_ms: 2000,
            socket_timeout_step_secs: 15,
        }
    }
}

/// 看门狗时间窗口
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub tick_ms: u64,
    /// 下载开始前无输出的超时
    pub init_timeout_secs: u64,
    /// 短视频的初始化超时
    pub short_init_timeout_secs: u64,
    /// 下载阶段无输出的超时
    pub stall_timeout_secs: u64,
    /// 合并/写元数据阶段无输出的超时
    pub postprocess_timeout_secs: u64,
    /// 总耗时超过该值时仅提示
    pub soft_warning_secs: u64,
    pub short_soft_warning_secs: u64,
    /// 短视频总耗时硬超时
    pub short_hard_timeout_secs: u64,
    /// 失败时保留的 stderr 末尾行数
    pub stderr_tail_lines: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            init_timeout_secs: 90,
            short_init_timeout_secs: 30,
            stall_timeout_secs: 300,
            postprocess_timeout_secs: 600,
            soft_warning_secs: 600,
            short_soft_warning_secs: 60,
            short_hard_timeout_secs: 180,
            stderr_tail_lines: 3,
        }
    }
}

impl WatchdogConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// 进度平滑与模拟参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// 超过该时长没有真实百分比即开始模拟
    pub liveness_threshold_ms: u64,
    /// 单次跳变超过该值才做平滑
    pub smoothing_threshold: f64,
    /// 每次前进差值的比例
    pub smoothing_fraction: f64,
    /// 每次前进的上限
    pub smoothing_cap: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            liveness_threshold_ms: 2000,
            smoothing_threshold: 15.0,
            smoothing_fraction: 0.5,
            smoothing_cap: 10.0,
        }
    }
}

impl ProgressConfig {
    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_millis(self.liveness_threshold_ms)
    }
}

/// 已完成任务的保留策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_secs: 2 * 60 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

/// ffmpeg 依赖解析配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    /// 显式指定的 ffmpeg 路径
    pub path: Option<PathBuf>,
    /// 自动下载的安装目录（同时也是第一个探测位置）
    pub install_dir: PathBuf,
    /// 是否探测系统位置、`FFMPEG_PATH` 和 `PATH`
    pub probe_system: bool,
    /// 覆盖默认的发布包地址
    pub archive_url: Option<String>,
    pub backup_archive_url: Option<String>,
    /// 发布包的 SHA-256（十六进制），为空则不校验
    pub archive_sha256: Option<String>,
    pub fetch_timeout_secs: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            path: None,
            install_dir: PathBuf::from("ffmpeg"),
            probe_system: true,
            archive_url: None,
            backup_archive_url: None,
            archive_sha256: None,
            fetch_timeout_secs: 300,
        }
    }
}

/// 全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ytdlp: YtDlpConfig,
    /// 未指定目标目录时使用的下载目录
    pub default_output_dir: PathBuf,
    /// 允许的来源主机（含子域名）
    pub allowed_hosts: Vec<String>,
    pub retry: RetryConfig,
    pub watchdog: WatchdogConfig,
    pub progress: ProgressConfig,
    pub retention: RetentionConfig,
    pub ffmpeg: FfmpegConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ytdlp: YtDlpConfig::default(),
            default_output_dir: PathBuf::from("videos"),
            allowed_hosts: vec!["youtube.com".to_string(), "youtu.be".to_string()],
            retry: RetryConfig::default(),
            watchdog: WatchdogConfig::default(),
            progress: ProgressConfig::default(),
            retention: RetentionConfig::default(),
            ffmpeg: FfmpegConfig::default(),
        }
    }
}

impl Settings {
    /// 读取配置文件（不存在则使用默认值），再应用环境变量覆盖
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
                serde_json::from_str(&data)
                    .with_context(|| format!("解析配置文件失败: {}", path.display()))?
            }
            Some(path) => {
                tracing::warn!("配置文件不存在，使用默认配置: {}", path.display());
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// `YTDLP_PATH` / `FFMPEG_PATH` 环境变量覆盖
    pub fn apply_env(&mut self) {
        if let Ok(program) = std::env::var("YTDLP_PATH") {
            if !program.trim().is_empty() {
                self.ytdlp.program = program;
            }
        }
        if let Ok(ffmpeg) = std::env::var("FFMPEG_PATH") {
            if !ffmpeg.trim().is_empty() {
                self.ffmpeg.path = Some(PathBuf::from(ffmpeg));
            }
        }
    }
}
