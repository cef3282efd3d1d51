//! 进度推断引擎
//!
//! 把 yt-dlp 逐行输出转换成单调不减的 0-100 界面进度、阶段、速度和剩余时间。
//! 工具长时间不输出时，由 [`ProgressParser::tick`] 给出明确标注为模拟值的前进。

mod estimate;
mod patterns;

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub use estimate::{
    derive_eta, simulate_step, simulation_milestone, smooth, synthesize_speed, Provenance,
    MIN_SPEED,
};
pub use patterns::{
    detect_phase, map_download_percent, observe, parse_eta, parse_percent, parse_speed,
    parse_total_bytes, Observation, DOWNLOAD_BAND_END, DOWNLOAD_BAND_START,
};

use crate::common::format::{format_eta, format_speed};
use crate::config::ProgressConfig;

/// 下载阶段，顺序即先后
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Probing,
    FetchingMetadata,
    Downloading,
    Merging,
    WritingMetadata,
    Done,
}

impl Phase {
    /// 进入该阶段后界面进度的下界
    pub fn floor(self) -> f64 {
        match self {
            Phase::Probing => 5.0,
            Phase::FetchingMetadata => 12.0,
            Phase::Downloading => DOWNLOAD_BAND_START,
            Phase::Merging => DOWNLOAD_BAND_END,
            Phase::WritingMetadata => 97.0,
            Phase::Done => 98.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Probing => "正在解析链接",
            Phase::FetchingMetadata => "正在获取视频信息",
            Phase::Downloading => "下载中",
            Phase::Merging => "正在合并音视频",
            Phase::WritingMetadata => "正在写入元数据",
            Phase::Done => "下载完成，正在处理文件",
        }
    }

    pub fn is_pre_download(self) -> bool {
        self < Phase::Downloading
    }
}

/// 一次进度变化
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub progress: f64,
    /// 字节/秒
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub message: String,
    pub provenance: Provenance,
    pub speed_provenance: Option<Provenance>,
}

/// 单次尝试内的进度状态机
///
/// 每次尝试新建一个，通过 [`ProgressParser::resume_from`] 从上一次显示的进度继续，
/// 所以界面进度在重试之间也不会倒退。
#[derive(Debug)]
pub struct ProgressParser {
    config: ProgressConfig,
    phase: Phase,
    progress: f64,
    pending_target: Option<f64>,
    started_at: Instant,
    download_started_at: Option<Instant>,
    last_signal_at: Instant,
    last_tick_at: Instant,
    last_real_at: Option<Instant>,
    last_real_progress: Option<f64>,
    last_raw_percent: Option<f64>,
    total_bytes: Option<u64>,
    speed: Option<f64>,
    eta: Option<u64>,
    destination: Option<PathBuf>,
}

impl ProgressParser {
    pub fn new(config: ProgressConfig, now: Instant) -> Self {
        Self::resume_from(0.0, config, now)
    }

    /// 从已显示的进度继续（至少为解析阶段的下界）
    pub fn resume_from(progress: f64, config: ProgressConfig, now: Instant) -> Self {
        Self {
            config,
            phase: Phase::Probing,
            progress: progress.clamp(Phase::Probing.floor(), 100.0),
            pending_target: None,
            started_at: now,
            download_started_at: None,
            last_signal_at: now,
            last_tick_at: now,
            last_real_at: None,
            last_real_progress: None,
            last_raw_percent: None,
            total_bytes: None,
            speed: None,
            eta: None,
            destination: None,
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 工具最后报告的输出文件
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// 处理一行输出，没有可用信息时返回 `None`
    pub fn feed_line(&mut self, line: &str, now: Instant) -> Option<ProgressUpdate> {
        let obs = observe(line);
        if obs.is_empty() {
            return None;
        }
        self.last_signal_at = now;
        if let Some(dest) = obs.destination.clone() {
            self.destination = Some(dest);
        }

        if let Some(raw) = obs.percent {
            return Some(self.observe_percent(raw, &obs, now));
        }
        if let Some((phase, floor)) = obs.phase {
            return Some(self.enter_phase(phase, floor, now));
        }
        None
    }

    /// 定时调用：追赶平滑目标、模拟下载前进或初始化阶段的缓慢前进
    pub fn tick(&mut self, now: Instant) -> Option<ProgressUpdate> {
        let dt = now.saturating_duration_since(self.last_tick_at);
        self.last_tick_at = now;

        if let Some(target) = self.pending_target {
            self.advance_towards(target);
            let raw = self.last_raw_percent.unwrap_or(0.0);
            return Some(self.download_update(raw, Provenance::Observed, Provenance::Observed));
        }

        match self.phase {
            Phase::Downloading => self.simulate_download(now, dt),
            Phase::Probing | Phase::FetchingMetadata => self.creep_init(now),
            _ => None,
        }
    }

    /// 工具正常退出
    pub fn mark_finished(&mut self) -> ProgressUpdate {
        self.pending_target = None;
        self.enter_phase(Phase::Done, Phase::Done.floor(), Instant::now())
    }

    fn observe_percent(&mut self, raw: f64, obs: &Observation, now: Instant) -> ProgressUpdate {
        if self.phase < Phase::Downloading {
            self.phase = Phase::Downloading;
        }
        let started = *self.download_started_at.get_or_insert(now);
        self.last_real_at = Some(now);
        self.last_raw_percent = Some(raw);
        if obs.total_bytes.is_some() {
            self.total_bytes = obs.total_bytes;
        }

        let target = map_download_percent(raw).max(self.pending_target.unwrap_or(0.0));
        self.last_real_progress = Some(self.last_real_progress.map_or(target, |p| p.max(target)));
        self.advance_towards(target);

        let elapsed = now.saturating_duration_since(started);
        let (speed, speed_provenance) = match obs.speed {
            Some(speed) => (speed, Provenance::Observed),
            None => (
                synthesize_speed(Some(raw), self.total_bytes, elapsed),
                Provenance::Simulated,
            ),
        };
        self.speed = Some(speed);
        self.eta = obs
            .eta
            .or_else(|| derive_eta(raw, self.total_bytes, speed, elapsed));

        self.download_update(raw, Provenance::Observed, speed_provenance)
    }

    fn enter_phase(&mut self, phase: Phase, floor: f64, now: Instant) -> ProgressUpdate {
        if phase >= self.phase {
            self.phase = phase;
        }
        if phase == Phase::Downloading {
            self.download_started_at.get_or_insert(now);
        }
        if floor > self.progress {
            self.progress = floor;
        }
        if self.pending_target.is_some_and(|t| t <= self.progress) {
            self.pending_target = None;
        }

        ProgressUpdate {
            phase: self.phase,
            progress: self.progress,
            speed: None,
            eta: None,
            message: format!("{}...", self.phase.label()),
            provenance: Provenance::PhaseFloor,
            speed_provenance: None,
        }
    }

    fn simulate_download(&mut self, now: Instant, dt: std::time::Duration) -> Option<ProgressUpdate> {
        let silent_since = self
            .last_real_at
            .or(self.download_started_at)
            .unwrap_or(self.started_at);
        if now.saturating_duration_since(silent_since) < self.config.liveness_threshold() {
            return None;
        }

        let milestone = simulation_milestone(self.last_real_progress);
        let download_elapsed = match (self.last_real_at, self.download_started_at) {
            (Some(real), Some(start)) => Some(real.saturating_duration_since(start)),
            _ => None,
        };
        let rate = estimate::simulation_rate(self.last_real_progress, download_elapsed);
        let next = simulate_step(self.progress, milestone, rate, dt);
        if next <= self.progress {
            return None;
        }
        self.progress = next;

        let raw = estimate::raw_from_display(self.progress);
        let elapsed = now.saturating_duration_since(self.download_started_at.unwrap_or(self.started_at));
        let speed = synthesize_speed(Some(raw), self.total_bytes, elapsed);
        self.speed = Some(speed);
        self.eta = derive_eta(raw, self.total_bytes, speed, elapsed);

        Some(self.download_update(raw, Provenance::Simulated, Provenance::Simulated))
    }

    fn creep_init(&mut self, now: Instant) -> Option<ProgressUpdate> {
        if now.saturating_duration_since(self.last_signal_at) < self.config.liveness_threshold() {
            return None;
        }
        if self.progress >= estimate::INIT_CREEP_CEILING {
            return None;
        }
        self.progress = (self.progress + estimate::INIT_CREEP_STEP).min(estimate::INIT_CREEP_CEILING);
        let waited = now.saturating_duration_since(self.started_at).as_secs();

        Some(ProgressUpdate {
            phase: self.phase,
            progress: self.progress,
            speed: None,
            eta: None,
            message: format!("{}... (已等待 {} 秒)", self.phase.label(), waited),
            provenance: Provenance::Simulated,
            speed_provenance: None,
        })
    }

    fn advance_towards(&mut self, target: f64) {
        if target <= self.progress {
            self.pending_target = None;
            return;
        }
        let next = smooth(self.progress, target, &self.config);
        self.progress = next;
        self.pending_target = (next < target).then_some(target);
    }

    fn download_update(
        &self,
        raw: f64,
        provenance: Provenance,
        speed_provenance: Provenance,
    ) -> ProgressUpdate {
        let speed_text = self
            .speed
            .map(format_speed)
            .unwrap_or_else(|| "未知速度".to_string());
        let eta_text = self.eta.map(format_eta).unwrap_or_else(|| "未知".to_string());
        let message = match provenance {
            Provenance::Simulated => format!(
                "下载中... {:.1}% - {} - 剩余时间: {}",
                self.progress, speed_text, eta_text
            ),
            _ => format!("下载中: {:.1}% - {} - 剩余时间: {}", raw, speed_text, eta_text),
        };

        ProgressUpdate {
            phase: self.phase,
            progress: self.progress,
            speed: self.speed,
            eta: self.eta,
            message,
            provenance,
            speed_provenance: Some(speed_provenance),
        }
    }
}
