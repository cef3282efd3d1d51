//! 任务取消令牌。
//!
//! 每个运行中的任务注册一个 [`CancellationToken`]，`cancel` 时触发，
//! 重试控制器和进程监督器在每个等待点检查它。

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct TaskControl {
    tokens: DashMap<String, CancellationToken>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// 任务开始时调用，返回传给控制器的令牌
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(task_id.to_string(), token.clone());
        token
    }

    /// 任务结束（成功或失败）时调用
    pub fn unregister(&self, task_id: &str) {
        self.tokens.remove(task_id);
    }

    /// 返回任务是否仍在运行
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
    }

    pub fn running(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_trips_registered_token() {
        let control = TaskControl::new();
        let token = control.register("a");
        assert!(control.cancel("a"));
        assert!(token.is_cancelled());
        control.unregister("a");
        assert!(!control.cancel("a"));
        assert_eq!(control.running(), 0);
    }
}
