use std::time::Duration;

use thiserror::Error;

use crate::progress::Phase;

/// 任务级错误，会出现在调用方面前
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("无效的输入: {0}")]
    InvalidInput(String),

    #[error("任务未找到: {0}")]
    TaskNotFound(String),

    #[error("任务已结束: {0}")]
    TaskAlreadyFinalized(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 单次尝试的失败，由重试控制器消化
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("无法启动下载工具: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("下载工具退出码 {code:?}: {stderr_tail}")]
    Exit {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("下载超时: {phase:?} 阶段 {idle:?} 无响应")]
    Timeout { phase: Phase, idle: Duration },

    #[error("下载已取消")]
    Cancelled,

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

impl AttemptError {
    /// 交给错误分类器的文本
    pub fn detail(&self) -> String {
        match self {
            AttemptError::Exit { stderr_tail, code } if stderr_tail.trim().is_empty() => {
                format!("process exited with code {:?}", code)
            }
            AttemptError::Exit { stderr_tail, .. } => stderr_tail.clone(),
            AttemptError::Timeout { idle, .. } => {
                format!("download timed out after {}s without output", idle.as_secs())
            }
            other => other.to_string(),
        }
    }
}
