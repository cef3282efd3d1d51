use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::common::utils::find_in_path;
use crate::config::YtDlpConfig;
use crate::task::{DownloadRequest, FormatType, Quality};

const ANDROID_USER_AGENT: &str =
    "com.google.android.youtube/19.09.37 (Linux; U; Android 12) gzip";
const ANDROID_CLIENT_ARGS: &str = "youtube:player_client=android";

/// 如何启动 yt-dlp：直接运行，或者 `python -m yt_dlp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, prefix_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args,
        }
    }

    /// 程序不在 `PATH` 中时退回 python 模块调用
    pub fn locate(config: &YtDlpConfig) -> Self {
        if let Some(found) = find_in_path(&config.program) {
            return Self::new(found, Vec::new());
        }
        match config.python_fallback.split_first() {
            Some((python, rest)) => {
                warn!(
                    "未在 PATH 中找到 {}，改用 {} {}",
                    config.program,
                    python,
                    rest.join(" ")
                );
                Self::new(python, rest.to_vec())
            }
            None => Self::new(&config.program, Vec::new()),
        }
    }

    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.prefix_args);
        cmd
    }
}

/// 一次尝试的完整参数，重试时在原有基础上调整
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: ToolCommand,
    pub source: String,
    pub output_dir: PathBuf,
    pub format_selector: String,
    pub format_type: FormatType,
    pub socket_timeout: Duration,
    pub tool_retries: u32,
    pub headers: Vec<(String, String)>,
    pub extractor_args: Option<String>,
    pub ffmpeg_location: Option<PathBuf>,
    pub short_form: bool,
}

impl Invocation {
    pub fn for_request(
        tool: ToolCommand,
        request: &DownloadRequest,
        output_dir: &Path,
        config: &YtDlpConfig,
    ) -> Self {
        Self {
            tool,
            source: request.source.clone(),
            output_dir: output_dir.to_path_buf(),
            format_selector: format_selector(request.quality, request.format),
            format_type: request.format,
            socket_timeout: Duration::from_secs(config.socket_timeout_secs),
            tool_retries: config.retries,
            headers: Vec::new(),
            extractor_args: None,
            ffmpeg_location: None,
            short_form: request.is_short_form(),
        }
    }

    /// `<dir>/%(title).100s-%(id)s[-shorts|-audio].%(ext)s`
    pub fn output_template(&self) -> String {
        let suffix = if self.format_type == FormatType::Audio {
            "-audio"
        } else if self.short_form {
            "-shorts"
        } else {
            ""
        };
        self.output_dir
            .join(format!("%(title).100s-%(id)s{}.%(ext)s", suffix))
            .to_string_lossy()
            .into_owned()
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "--no-warnings",
            "--no-check-certificate",
            "--newline",
            "--progress",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("-f".to_string());
        args.push(self.format_selector.clone());
        args.push("-o".to_string());
        args.push(self.output_template());
        args.extend(
            ["--restrict-filenames", "--no-overwrites", "--no-cache-dir"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push("--retries".to_string());
        args.push(self.tool_retries.to_string());
        args.push("--socket-timeout".to_string());
        args.push(self.socket_timeout.as_secs().to_string());

        if let Some(ffmpeg) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }

        match self.format_type {
            FormatType::Audio => {
                args.extend(
                    ["-x", "--audio-format", "mp3", "--keep-video"]
                        .iter()
                        .map(|s| s.to_string()),
                );
            }
            other => {
                if let Some(container) = other.merge_container() {
                    args.push("--merge-output-format".to_string());
                    args.push(container.to_string());
                }
            }
        }

        for (name, value) in &self.headers {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }
        if let Some(extractor_args) = &self.extractor_args {
            args.push("--extractor-args".to_string());
            args.push(extractor_args.clone());
        }

        args.push(self.source.clone());
        args
    }

    /// 网络类错误：放宽 socket 超时
    pub fn widen_socket_timeout(&mut self, step: Duration) {
        self.socket_timeout += step;
    }

    /// 格式类错误：退回通用格式
    pub fn relax_format(&mut self) {
        self.format_selector = "best".to_string();
    }

    /// 访问被拒绝：换成移动客户端标识
    pub fn use_alternate_client(&mut self) {
        self.headers.retain(|(name, _)| !name.eq_ignore_ascii_case("User-Agent"));
        self.headers
            .push(("User-Agent".to_string(), ANDROID_USER_AGENT.to_string()));
        self.extractor_args = Some(ANDROID_CLIENT_ARGS.to_string());
    }
}

/// 清晰度 + 格式 → yt-dlp 的 `-f` 选择器
pub fn format_selector(quality: Quality, format: FormatType) -> String {
    if format == FormatType::Audio {
        return "bestaudio/best".to_string();
    }
    match quality.height() {
        Some(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
        None => "bestvideo+bestaudio/best".to_string(),
    }
}
