use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::common::utils::{exe_name, find_in_path, is_executable};
use crate::config::FfmpegConfig;

const SYSTEM_DIRS: &[&str] = &[
    "/usr/bin",
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/opt/local/bin",
];

/// 按顺序列出要检查的位置
pub fn candidates(config: &FfmpegConfig) -> Vec<PathBuf> {
    let binary = exe_name("ffmpeg");
    let mut paths = Vec::new();

    if let Some(explicit) = &config.path {
        paths.push(explicit.clone());
    }

    let install_dir = &config.install_dir;
    paths.push(install_dir.join("bin").join(&binary));
    paths.push(install_dir.join(&binary));
    // 解压后常见的 `ffmpeg-6.0-essentials_build/bin/ffmpeg.exe`
    if let Ok(entries) = std::fs::read_dir(install_dir) {
        let mut nested: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.file_name().is_some_and(|n| n != std::ffi::OsStr::new("bin")))
            .map(|p| p.join("bin").join(&binary))
            .collect();
        nested.sort();
        paths.extend(nested);
    }

    if config.probe_system {
        paths.extend(SYSTEM_DIRS.iter().map(|dir| Path::new(dir).join(&binary)));
    }
    paths
}

/// 在本地查找 ffmpeg，不做任何下载
pub fn probe(config: &FfmpegConfig) -> Option<PathBuf> {
    for candidate in candidates(config) {
        if is_executable(&candidate) {
            debug!("在 {} 找到 ffmpeg", candidate.display());
            return Some(candidate);
        }
    }
    if config.probe_system {
        if let Some(found) = find_in_path("ffmpeg") {
            debug!("在 PATH 中找到 ffmpeg: {}", found.display());
            return Some(found);
        }
    }
    None
}

/// `ffmpeg -version` 的第一行，仅用于日志
pub async fn version(path: &Path) -> Option<String> {
    let output = Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_comes_first() {
        let config = FfmpegConfig {
            path: Some(PathBuf::from("/custom/ffmpeg")),
            install_dir: PathBuf::from("/nonexistent-install"),
            probe_system: false,
            ..FfmpegConfig::default()
        };
        let list = candidates(&config);
        assert_eq!(list[0], PathBuf::from("/custom/ffmpeg"));
        assert_eq!(list.len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn finds_binary_in_install_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let ffmpeg = bin.join("ffmpeg");
        std::fs::write(&ffmpeg, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = FfmpegConfig {
            install_dir: dir.path().to_path_buf(),
            probe_system: false,
            ..FfmpegConfig::default()
        };
        assert_eq!(probe(&config), Some(ffmpeg));
    }
}
