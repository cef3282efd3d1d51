use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use yt_downloader::config::FfmpegConfig;
use yt_downloader::ffmpeg::fetch::extract_binaries;
use yt_downloader::ffmpeg::{ArchiveFetcher, FfmpegResolver, ResolveError};

/// 计数的假下载器：先等一会儿，保证并发调用能赶上同一次解析
struct CountingFetcher {
    calls: AtomicUsize,
    succeed: bool,
}

impl CountingFetcher {
    fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            succeed,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveFetcher for CountingFetcher {
    async fn fetch(&self, bin_dir: &Path) -> Result<PathBuf, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !self.succeed {
            return Err(ResolveError::Fetch("connection refused".to_string()));
        }
        std::fs::create_dir_all(bin_dir).unwrap();
        let path = bin_dir.join("ffmpeg");
        std::fs::write(&path, b"fake").unwrap();
        Ok(path)
    }
}

/// 把内存中构造的 zip 交给真正的解压逻辑
struct ZipFetcher {
    archive: PathBuf,
}

#[async_trait]
impl ArchiveFetcher for ZipFetcher {
    async fn fetch(&self, bin_dir: &Path) -> Result<PathBuf, ResolveError> {
        extract_binaries(&self.archive, bin_dir)
    }
}

fn isolated_config(install_dir: &Path) -> FfmpegConfig {
    FfmpegConfig {
        path: None,
        install_dir: install_dir.to_path_buf(),
        probe_system: false,
        ..FfmpegConfig::default()
    }
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(true);
    let resolver = FfmpegResolver::with_fetcher(isolated_config(dir.path()), fetcher.clone());

    assert!(resolver.cached().is_none());
    let (a, b, c) = tokio::join!(resolver.resolve(), resolver.resolve(), resolver.resolve());
    let expected = dir.path().join("bin").join("ffmpeg");
    assert_eq!(a.unwrap(), expected);
    assert_eq!(b.unwrap(), expected);
    assert_eq!(c.unwrap(), expected);
    assert_eq!(fetcher.calls(), 1);

    // 之后走缓存
    assert_eq!(resolver.resolve().await.unwrap(), expected);
    assert_eq!(resolver.cached(), Some(expected));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_failures_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(false);
    let resolver = FfmpegResolver::with_fetcher(isolated_config(dir.path()), fetcher.clone());

    let (a, b) = tokio::join!(resolver.resolve(), resolver.resolve());
    for result in [a, b] {
        match result {
            Err(ResolveError::Unavailable { reason }) => {
                assert!(reason.contains("connection refused"), "reason: {}", reason)
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }
    assert_eq!(fetcher.calls(), 1);
    assert!(resolver.cached().is_none());

    // 失败不缓存，下一次会重新尝试
    assert!(resolver.resolve().await.is_err());
    assert_eq!(fetcher.calls(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_binary_skips_fetch() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    let binary = bin_dir.join("ffmpeg");
    std::fs::write(&binary, "#!/bin/sh\necho 'ffmpeg version test'\n").unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    let fetcher = CountingFetcher::new(true);
    let resolver = FfmpegResolver::with_fetcher(isolated_config(dir.path()), fetcher.clone());
    assert_eq!(resolver.resolve().await.unwrap(), binary);
    assert_eq!(fetcher.calls(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_explicit_path_wins() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let explicit = dir.path().join("custom-ffmpeg");
    std::fs::write(&explicit, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&explicit, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = isolated_config(&dir.path().join("install"));
    config.path = Some(explicit.clone());
    let fetcher = CountingFetcher::new(false);
    let resolver = FfmpegResolver::with_fetcher(config, fetcher.clone());
    assert_eq!(resolver.resolve().await.unwrap(), explicit);
    assert_eq!(fetcher.calls(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_archive_is_extracted_into_install_dir() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("ffmpeg-release.zip");
    {
        let file = std::fs::File::create(&archive).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("ffmpeg-7.0-static/bin/ffmpeg", options).unwrap();
        zip.write_all(b"#!/bin/sh\necho 'ffmpeg version 7.0'\n").unwrap();
        zip.start_file("ffmpeg-7.0-static/bin/ffprobe", options).unwrap();
        zip.write_all(b"#!/bin/sh\n").unwrap();
        zip.start_file("ffmpeg-7.0-static/README.txt", options).unwrap();
        zip.write_all(b"readme").unwrap();
        zip.finish().unwrap();
    }

    let install_dir = dir.path().join("install");
    let resolver = FfmpegResolver::with_fetcher(
        isolated_config(&install_dir),
        Arc::new(ZipFetcher { archive }),
    );
    let path = resolver.resolve().await.unwrap();
    assert_eq!(path, install_dir.join("bin").join("ffmpeg"));
    assert!(install_dir.join("bin").join("ffprobe").is_file());
    assert!(!install_dir.join("bin").join("README.txt").exists());
}
