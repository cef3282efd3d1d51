//! 估算策略：平滑、模拟前进、合成速度与剩余时间。
//!
//! 解析器只负责"看到了什么"，所有"猜出来的"数值都集中在这里，
//! 并通过 [`Provenance`] 标注来源。

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::patterns::{DOWNLOAD_BAND_END, DOWNLOAD_BAND_START};
use crate::config::ProgressConfig;

/// 数值来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// 直接来自工具输出
    Observed,
    /// 由估算策略生成
    Simulated,
    /// 来自阶段标记对应的下界
    PhaseFloor,
}

/// 合成速度的下限 100 KiB/s
pub const MIN_SPEED: f64 = 100.0 * 1024.0;
/// 没有任何依据时的基准速度 1 MiB/s
pub const BASELINE_SPEED: f64 = 1024.0 * 1024.0;
/// 没有真实进度可参考时的模拟速率（界面百分点/秒）
pub const DEFAULT_SIMULATION_RATE: f64 = 0.5;
/// 模拟进度最多领先最近一次真实进度的百分点
pub const SIMULATION_LEAD: f64 = 10.0;
/// 下载开始前的缓慢前进
pub const INIT_CREEP_STEP: f64 = 0.2;
pub const INIT_CREEP_CEILING: f64 = 14.0;

/// 大跳变按比例分步追赶，小跳变直接到位
pub fn smooth(current: f64, target: f64, config: &ProgressConfig) -> f64 {
    if target <= current {
        return current;
    }
    let gap = target - current;
    if gap > config.smoothing_threshold {
        current + (gap * config.smoothing_fraction).min(config.smoothing_cap)
    } else {
        target
    }
}

/// 下一次真实里程碑：最近真实进度 + 领先量，且不进入后处理区间
pub fn simulation_milestone(last_real: Option<f64>) -> f64 {
    (last_real.unwrap_or(DOWNLOAD_BAND_START) + SIMULATION_LEAD).min(DOWNLOAD_BAND_END - 1.0)
}

/// 根据已观察到的进度推算模拟速率
pub fn simulation_rate(last_real: Option<f64>, download_elapsed: Option<Duration>) -> f64 {
    match (last_real, download_elapsed) {
        (Some(progress), Some(elapsed))
            if elapsed.as_secs_f64() >= 1.0 && progress > DOWNLOAD_BAND_START =>
        {
            ((progress - DOWNLOAD_BAND_START) / elapsed.as_secs_f64()).clamp(0.05, 2.0)
        }
        _ => DEFAULT_SIMULATION_RATE,
    }
}

/// 模拟前进一步，结果不会超过 `milestone`
pub fn simulate_step(current: f64, milestone: f64, rate: f64, elapsed: Duration) -> f64 {
    if current >= milestone {
        return current;
    }
    let step = (rate * elapsed.as_secs_f64()).max(0.0);
    (current + step).min(milestone)
}

/// 工具没有报告速度时合成一个
///
/// 已知总大小则按 已下载字节 / 已用时间 计算；否则在基准速度上加一点抖动。
pub fn synthesize_speed(raw_percent: Option<f64>, total_bytes: Option<u64>, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if let (Some(pct), Some(total)) = (raw_percent, total_bytes) {
        if secs > 0.0 && pct > 0.0 {
            return (total as f64 * pct / 100.0 / secs).max(MIN_SPEED);
        }
    }
    let pct = raw_percent.unwrap_or(0.0);
    let jitter: f64 = rand::rng().random_range(0.9..1.1);
    (BASELINE_SPEED * (1.0 + pct / 200.0) * jitter).max(MIN_SPEED)
}

/// 推算剩余时间（秒）
pub fn derive_eta(
    raw_percent: f64,
    total_bytes: Option<u64>,
    speed: f64,
    elapsed: Duration,
) -> Option<u64> {
    if raw_percent >= 100.0 {
        return Some(0);
    }
    if let Some(total) = total_bytes {
        if speed > 0.0 {
            let remaining = total as f64 * (1.0 - raw_percent / 100.0);
            return Some((remaining / speed).ceil() as u64);
        }
    }
    if raw_percent > 0.0 {
        let secs = elapsed.as_secs_f64();
        return Some((secs * (100.0 - raw_percent) / raw_percent).ceil() as u64);
    }
    None
}

/// 界面进度换算回工具百分比，用于模拟时的 ETA 估算
pub fn raw_from_display(progress: f64) -> f64 {
    ((progress - DOWNLOAD_BAND_START) / 0.8).clamp(0.0, 100.0)
}
