use std::time::Duration;

use serde::Serialize;

use crate::config::RetryConfig;

/// 失败原因分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 超时、连接失败、DNS
    Network,
    /// 请求的格式不可用
    Format,
    /// 403、限流、需要登录确认
    AccessDenied,
    /// 缺少 ffmpeg / ffprobe
    MissingDependency,
    /// 看门狗判定无响应
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// 给用户看的简短描述
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Network => "网络连接问题",
            ErrorKind::Format => "请求的格式不可用",
            ErrorKind::AccessDenied => "访问被拒绝",
            ErrorKind::MissingDependency => "缺少 ffmpeg",
            ErrorKind::Timeout => "下载无响应",
            ErrorKind::Unknown => "未知错误",
        }
    }

    /// 下一次尝试会做的调整
    pub fn remediation(self) -> &'static str {
        match self {
            ErrorKind::Network => "延长超时后重试",
            ErrorKind::Format => "改用通用格式重试",
            ErrorKind::AccessDenied => "更换客户端标识后重试",
            ErrorKind::MissingDependency => "正在准备 ffmpeg",
            ErrorKind::Timeout => "延长超时后重试",
            ErrorKind::Unknown => "稍后重试",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// 按错误类别给出固定的短延迟，而不是指数退避
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数（包含第一次）
    pub max_attempts: u32,
    pub network_delay: Duration,
    pub format_delay: Duration,
    pub access_delay: Duration,
    pub timeout_delay: Duration,
    pub unknown_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            network_delay: Duration::from_millis(config.network_delay_ms),
            format_delay: Duration::from_millis(config.format_delay_ms),
            access_delay: Duration::from_millis(config.access_delay_ms),
            timeout_delay: Duration::from_millis(config.timeout_delay_ms),
            unknown_delay: Duration::from_millis(config.unknown_delay_ms),
        }
    }

    /// `attempt` 从 1 开始。缺少依赖不在这里重试，由控制器先解析依赖。
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        match kind {
            ErrorKind::MissingDependency => RetryDecision::NoRetry,
            ErrorKind::Network => RetryDecision::RetryAfter(self.network_delay),
            ErrorKind::Format => RetryDecision::RetryAfter(self.format_delay),
            ErrorKind::AccessDenied => RetryDecision::RetryAfter(self.access_delay),
            ErrorKind::Timeout => RetryDecision::RetryAfter(self.timeout_delay),
            ErrorKind::Unknown => RetryDecision::RetryAfter(self.unknown_delay),
        }
    }
}
