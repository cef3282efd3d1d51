//! 错误分类与重试
//!
//! 失败按关键字分类后，由控制器决定是否重试以及下一次尝试要调整哪些参数
//! （超时、格式、客户端标识），而不是固定的退避表。

mod classify;
mod policy;
mod run;

pub use classify::{classify, classify_attempt};
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
pub use run::RetryController;
