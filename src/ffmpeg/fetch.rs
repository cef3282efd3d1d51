use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::error::ResolveError;
use crate::common::format::format_size;
use crate::common::utils::exe_name;
use crate::config::FfmpegConfig;

const WINDOWS_ARCHIVE: &str = "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";
const WINDOWS_BACKUP_ARCHIVE: &str =
    "https://github.com/GyanD/codexffmpeg/releases/download/2023-07-16/ffmpeg-6.0-essentials_build.zip";

/// 获取 ffmpeg 发布包并解压到 `bin_dir`
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    /// 返回解压后的 ffmpeg 路径
    async fn fetch(&self, bin_dir: &Path) -> Result<PathBuf, ResolveError>;
}

/// 通过 HTTP 下载 zip 发布包
pub struct HttpArchiveFetcher {
    client: reqwest::Client,
    urls: Vec<String>,
    sha256: Option<String>,
}

impl HttpArchiveFetcher {
    pub fn from_config(config: &FfmpegConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            urls: archive_urls(config),
            sha256: config
                .archive_sha256
                .as_ref()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty()),
        }
    }

    async fn download(&self, url: &str, target: &Path) -> Result<String, ResolveError> {
        use futures::StreamExt;

        let response = self.client.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| ResolveError::Fetch(e.to_string()))?;
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| ResolveError::Fetch(e.to_string()))?;
            downloaded += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| ResolveError::Fetch(e.to_string()))?;

        debug!("ffmpeg 发布包下载完成: {}", format_size(downloaded));
        Ok(hex(&hasher.finalize()))
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    async fn fetch(&self, bin_dir: &Path) -> Result<PathBuf, ResolveError> {
        if self.urls.is_empty() {
            return Err(ResolveError::unavailable("当前平台没有可自动下载的 ffmpeg 发布包"));
        }

        let staging = bin_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| bin_dir.to_path_buf());
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| ResolveError::Fetch(e.to_string()))?;
        let archive = staging.join("ffmpeg-download.zip");

        let mut last_error = ResolveError::unavailable("没有尝试任何下载地址");
        for url in &self.urls {
            info!("正在下载 ffmpeg: {}", url);
            let digest = match self.download(url, &archive).await {
                Ok(digest) => digest,
                Err(e) => {
                    warn!("下载 ffmpeg 失败 ({}): {}", url, e);
                    last_error = e;
                    continue;
                }
            };

            if let Some(expected) = &self.sha256 {
                if *expected != digest {
                    last_error = ResolveError::Checksum {
                        expected: expected.clone(),
                        actual: digest,
                    };
                    warn!("{}", last_error);
                    continue;
                }
            }

            let archive_path = archive.clone();
            let bin = bin_dir.to_path_buf();
            let extracted = tokio::task::spawn_blocking(move || extract_binaries(&archive_path, &bin))
                .await
                .map_err(|e| ResolveError::Extract(e.to_string()))?;
            let _ = tokio::fs::remove_file(&archive).await;

            match extracted {
                Ok(path) => return Ok(path),
                Err(e) => {
                    warn!("解压 ffmpeg 失败: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// 配置的地址优先，否则只有 Windows 有默认发布包
pub fn archive_urls(config: &FfmpegConfig) -> Vec<String> {
    match &config.archive_url {
        Some(primary) => std::iter::once(primary.clone())
            .chain(config.backup_archive_url.clone())
            .collect(),
        None if cfg!(windows) => vec![
            WINDOWS_ARCHIVE.to_string(),
            WINDOWS_BACKUP_ARCHIVE.to_string(),
        ],
        None => Vec::new(),
    }
}

/// 从 zip 中取出 ffmpeg 和 ffprobe（忽略目录层级），返回 ffmpeg 路径
pub fn extract_binaries(archive: &Path, bin_dir: &Path) -> Result<PathBuf, ResolveError> {
    let file = File::open(archive).map_err(|e| ResolveError::Extract(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(bin_dir).map_err(|e| ResolveError::Extract(e.to_string()))?;

    let wanted = [exe_name("ffmpeg"), exe_name("ffprobe")];
    let mut ffmpeg = None;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        else {
            continue;
        };
        if !wanted.contains(&name) {
            continue;
        }

        let target = bin_dir.join(&name);
        let mut out = File::create(&target).map_err(|e| ResolveError::Extract(e.to_string()))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| ResolveError::Extract(e.to_string()))?;
        mark_executable(&target)?;
        debug!("已解压 {}", target.display());

        if name == wanted[0] {
            ffmpeg = Some(target);
        }
    }

    ffmpeg.ok_or_else(|| ResolveError::Extract("发布包中没有 ffmpeg".to_string()))
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<(), ResolveError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| ResolveError::Extract(e.to_string()))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<(), ResolveError> {
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn configured_urls_take_priority() {
        let config = FfmpegConfig {
            archive_url: Some("https://example.com/a.zip".to_string()),
            backup_archive_url: Some("https://example.com/b.zip".to_string()),
            ..FfmpegConfig::default()
        };
        assert_eq!(
            archive_urls(&config),
            vec!["https://example.com/a.zip", "https://example.com/b.zip"]
        );
    }

    #[test]
    fn extracts_nested_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = SimpleFileOptions::default();
            zip.start_file(format!("ffmpeg-6.0/bin/{}", exe_name("ffmpeg")), options)
                .unwrap();
            zip.write_all(b"#!/bin/sh\n").unwrap();
            zip.start_file(format!("ffmpeg-6.0/bin/{}", exe_name("ffprobe")), options)
                .unwrap();
            zip.write_all(b"#!/bin/sh\n").unwrap();
            zip.start_file("ffmpeg-6.0/README.txt", options).unwrap();
            zip.write_all(b"readme").unwrap();
            zip.finish().unwrap();
        }

        let bin = dir.path().join("bin");
        let path = extract_binaries(&archive, &bin).unwrap();
        assert_eq!(path, bin.join(exe_name("ffmpeg")));
        assert!(bin.join(exe_name("ffprobe")).exists());
        assert!(!bin.join("README.txt").exists());
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
