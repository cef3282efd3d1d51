//! 按关键字把失败文本归类，驱动重试时的参数调整。

use crate::downloader::error::AttemptError;
use crate::retry::policy::ErrorKind;

const MISSING_DEPENDENCY: &[&str] = &[
    "ffmpeg not found",
    "ffprobe not found",
    "ffmpeg is not installed",
    "ffprobe is not installed",
    "ffprobe and ffmpeg not found",
    "--ffmpeg-location",
];

const ACCESS_DENIED: &[&str] = &[
    "http error 403",
    "403:",
    "forbidden",
    "http error 429",
    "429:",
    "too many requests",
    "sign in to confirm",
    "access denied",
];

const NETWORK: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network is unreachable",
    "name or service not known",
    "temporary failure in name resolution",
    "getaddrinfo failed",
    "unable to download webpage",
    "remote end closed",
];

const FORMAT: &[&str] = &["no suitable format", "requested format", "format"];

/// 失败文本 → 分类，顺序即优先级
pub fn classify(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(MISSING_DEPENDENCY) {
        ErrorKind::MissingDependency
    } else if any(ACCESS_DENIED) {
        ErrorKind::AccessDenied
    } else if any(NETWORK) {
        ErrorKind::Network
    } else if any(FORMAT) {
        ErrorKind::Format
    } else {
        ErrorKind::Unknown
    }
}

/// 单次尝试失败的分类，看门狗超时单独归类
pub fn classify_attempt(error: &AttemptError) -> ErrorKind {
    match error {
        AttemptError::Timeout { .. } => ErrorKind::Timeout,
        other => classify(&other.detail()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_examples() {
        assert_eq!(classify("Connection timed out"), ErrorKind::Network);
        assert_eq!(classify("HTTP Error 403: Forbidden"), ErrorKind::AccessDenied);
        assert_eq!(classify("ffmpeg not found"), ErrorKind::MissingDependency);
        assert_eq!(
            classify("ERROR: [youtube] abc: Requested format is not available"),
            ErrorKind::Format
        );
        assert_eq!(classify("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn status_codes_need_http_context() {
        assert_eq!(classify("Downloading 1403 fragments"), ErrorKind::Unknown);
        assert_eq!(classify("HTTP Error 429: Too Many Requests"), ErrorKind::AccessDenied);
        assert_eq!(classify("got 403: blocked"), ErrorKind::AccessDenied);
    }

    #[test]
    fn dependency_wins_over_other_keywords() {
        let text = "ERROR: Postprocessing: ffprobe and ffmpeg not found. Please install or provide the path using --ffmpeg-location";
        assert_eq!(classify(text), ErrorKind::MissingDependency);
    }

    #[test]
    fn watchdog_timeout_is_its_own_kind() {
        let err = AttemptError::Timeout {
            phase: crate::progress::Phase::Downloading,
            idle: std::time::Duration::from_secs(300),
        };
        assert_eq!(classify_attempt(&err), ErrorKind::Timeout);
    }
}
