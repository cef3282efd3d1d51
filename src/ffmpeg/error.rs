use thiserror::Error;

/// ffmpeg 解析失败
///
/// 需要 `Clone`：同一次在途解析的结果会分发给所有等待者。
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("ffmpeg 不可用: {reason}")]
    Unavailable { reason: String },

    #[error("下载 ffmpeg 失败: {0}")]
    Fetch(String),

    #[error("解压 ffmpeg 失败: {0}")]
    Extract(String),

    #[error("ffmpeg 发布包校验失败: 期望 {expected}, 实际 {actual}")]
    Checksum { expected: String, actual: String },
}

impl ResolveError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ResolveError::Unavailable {
            reason: reason.into(),
        }
    }

    /// 附带手动安装提示的完整消息
    pub fn with_install_hint(&self) -> String {
        format!("{}。{}", self, install_hint())
    }
}

impl From<reqwest::Error> for ResolveError {
    fn from(error: reqwest::Error) -> Self {
        ResolveError::Fetch(error.to_string())
    }
}

impl From<zip::result::ZipError> for ResolveError {
    fn from(error: zip::result::ZipError) -> Self {
        ResolveError::Extract(error.to_string())
    }
}

/// 按平台给出的手动安装方式
pub fn install_hint() -> &'static str {
    if cfg!(target_os = "linux") {
        "请手动安装 ffmpeg，例如 `sudo apt-get install ffmpeg` 或 `sudo dnf install ffmpeg`，或者选择视频格式下载"
    } else if cfg!(target_os = "macos") {
        "请手动安装 ffmpeg，例如 `brew install ffmpeg`，或者选择视频格式下载"
    } else {
        "请从 https://ffmpeg.org/download.html 下载并安装 ffmpeg，或者选择视频格式下载"
    }
}
