//! 从 yt-dlp 的单行输出中提取百分比、速度、剩余时间、阶段标记和输出文件路径。
//!
//! 这里全部是纯函数，不持有任何状态。

use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::Regex;

use super::Phase;

/// 下载阶段在界面进度中的下界
pub const DOWNLOAD_BAND_START: f64 = 15.0;
/// 下载阶段在界面进度中的上界，之后留给后处理
pub const DOWNLOAD_BAND_END: f64 = 95.0;

lazy_static! {
    /// 已知的百分比格式，按顺序取第一个匹配；百分比必须紧跟在前缀之后
    static ref PERCENT_PATTERNS: Vec<Regex> = vec![
        // "[download]  5.0% of 10.00MiB at 1.00MiB/s ETA 00:09"
        // "[download] 100% of ~10.50MiB in 00:05"
        Regex::new(r"^\[download\]\s+~?\s*(\d+(?:\.\d+)?)%").unwrap(),
        // --progress-template "downloaded_bytes:%(progress._percent_str)s"
        Regex::new(r"^downloaded_bytes:\s*(\d+(?:\.\d+)?)%").unwrap(),
    ];
    static ref SPEED_PATTERN: Regex =
        Regex::new(r"at\s+~?\s*(\d+(?:\.\d+)?)\s*([KMGT]?i?B)/s").unwrap();
    static ref ETA_PATTERN: Regex = Regex::new(r"ETA\s+(\d+(?::\d+){0,2})").unwrap();
    static ref TOTAL_PATTERN: Regex =
        Regex::new(r"of\s+~?\s*(\d+(?:\.\d+)?)\s*([KMGT]?i?B)\b").unwrap();
    static ref DESTINATION_PATTERN: Regex =
        Regex::new(r"^\[(?:download|ExtractAudio)\]\s+Destination:\s*(.+?)\s*$").unwrap();
    static ref MERGER_PATTERN: Regex =
        Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"(.+)"\s*$"#).unwrap();
    static ref ALREADY_PATTERN: Regex =
        Regex::new(r"^\[download\]\s+(.+?) has already been downloaded").unwrap();
}

/// 单行输出中提取到的全部信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// 工具报告的原始百分比 (0-100)
    pub percent: Option<f64>,
    /// 速度，字节/秒
    pub speed: Option<f64>,
    /// 剩余秒数
    pub eta: Option<u64>,
    /// 当前文件总大小（字节）
    pub total_bytes: Option<u64>,
    /// 阶段标记及该阶段的进度下界
    pub phase: Option<(Phase, f64)>,
    /// 工具报告的输出文件
    pub destination: Option<PathBuf>,
}

impl Observation {
    pub fn is_empty(&self) -> bool {
        self == &Observation::default()
    }
}

/// 解析一行输出
pub fn observe(line: &str) -> Observation {
    let line = line.trim();
    if line.is_empty() {
        return Observation::default();
    }

    let percent = parse_percent(line);
    let (speed, eta, total_bytes) = if percent.is_some() {
        (parse_speed(line), parse_eta(line), parse_total_bytes(line))
    } else {
        (None, None, None)
    };

    Observation {
        percent,
        speed,
        eta,
        total_bytes,
        phase: detect_phase(line),
        destination: parse_destination(line),
    }
}

/// 提取百分比，超出 0-100 的值视为噪声。
/// 报告输出文件的行不含进度，文件名里的 `%` 不算。
pub fn parse_percent(line: &str) -> Option<f64> {
    let line = line.trim();
    if parse_destination(line).is_some() {
        return None;
    }
    PERCENT_PATTERNS.iter().find_map(|re| {
        re.captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|v| (0.0..=100.0).contains(v))
    })
}

/// 提取速度（字节/秒）
pub fn parse_speed(line: &str) -> Option<f64> {
    let caps = SPEED_PATTERN.captures(line)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let bytes = value * unit_multiplier(caps.get(2)?.as_str())?;
    (bytes > 0.0).then_some(bytes)
}

/// 提取 `ETA 01:02:03` / `ETA 00:09` / `ETA 9`
pub fn parse_eta(line: &str) -> Option<u64> {
    let caps = ETA_PATTERN.captures(line)?;
    caps.get(1)?
        .as_str()
        .split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|v| acc * 60 + v))
}

/// 提取 `of ~10.50MiB` 中的总大小
pub fn parse_total_bytes(line: &str) -> Option<u64> {
    let caps = TOTAL_PATTERN.captures(line)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let bytes = value * unit_multiplier(caps.get(2)?.as_str())?;
    (bytes > 0.0).then_some(bytes as u64)
}

/// 十进制与二进制单位都按 1024 进位
fn unit_multiplier(unit: &str) -> Option<f64> {
    let prefix = unit.trim_end_matches('B').trim_end_matches('i');
    let exp = match prefix {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        _ => return None,
    };
    Some(1024f64.powi(exp))
}

/// 工具报告的输出文件
pub fn parse_destination(line: &str) -> Option<PathBuf> {
    [&*MERGER_PATTERN, &*DESTINATION_PATTERN, &*ALREADY_PATTERN]
        .iter()
        .find_map(|re| re.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| PathBuf::from(m.as_str().trim()))
        .filter(|p| !p.as_os_str().is_empty())
}

/// 识别阶段标记，返回 (阶段, 该标记对应的进度下界)
pub fn detect_phase(line: &str) -> Option<(Phase, f64)> {
    let lower = line.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("writing metadata")
        || has("[metadata]")
        || has("[embedthumbnail]")
        || has("[embedsubtitle]")
    {
        return Some((Phase::WritingMetadata, Phase::WritingMetadata.floor()));
    }
    if has("merging") || has("[extractaudio]") || has("[fixup") || has("[videoconvertor]") {
        return Some((Phase::Merging, Phase::Merging.floor()));
    }
    if has("destination:") || has("has already been downloaded") {
        return Some((Phase::Downloading, Phase::Downloading.floor()));
    }
    if has("extracting url") {
        return Some((Phase::Probing, 10.0));
    }
    if has("downloading webpage") {
        return Some((Phase::FetchingMetadata, 12.0));
    }
    if has("downloading initial data")
        || has("downloading m3u8")
        || has("downloading api json")
        || has("player api json")
        || has("client config")
    {
        return Some((Phase::FetchingMetadata, 13.0));
    }
    if has("downloading metadata") || has("downloading thumbnail") {
        return Some((Phase::FetchingMetadata, 14.0));
    }
    None
}

/// 把工具的下载百分比映射到界面进度带 15-95
pub fn map_download_percent(raw: f64) -> f64 {
    let raw = raw.clamp(0.0, 100.0);
    (DOWNLOAD_BAND_START + (raw * 0.8).floor()).clamp(DOWNLOAD_BAND_START, DOWNLOAD_BAND_END)
}
