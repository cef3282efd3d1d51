//! ffmpeg 依赖解析
//!
//! 先探测本地位置和 `PATH`，找不到时下载发布包解压到安装目录。
//! 结果在进程生命周期内缓存；并发调用共享同一次在途解析，不会重复下载。

pub mod error;
pub mod fetch;
pub mod probe;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{info, warn};

pub use error::{install_hint, ResolveError};
pub use fetch::{ArchiveFetcher, HttpArchiveFetcher};

use crate::config::FfmpegConfig;

type SharedResolve = Shared<BoxFuture<'static, Result<PathBuf, ResolveError>>>;

pub struct FfmpegResolver {
    config: FfmpegConfig,
    fetcher: Arc<dyn ArchiveFetcher>,
    cache: OnceLock<PathBuf>,
    inflight: Mutex<Option<SharedResolve>>,
}

impl FfmpegResolver {
    pub fn new(config: FfmpegConfig) -> Self {
        let fetcher = Arc::new(HttpArchiveFetcher::from_config(&config));
        Self::with_fetcher(config, fetcher)
    }

    pub fn with_fetcher(config: FfmpegConfig, fetcher: Arc<dyn ArchiveFetcher>) -> Self {
        Self {
            config,
            fetcher,
            cache: OnceLock::new(),
            inflight: Mutex::new(None),
        }
    }

    /// 已解析的路径，不触发探测
    pub fn cached(&self) -> Option<PathBuf> {
        self.cache.get().cloned()
    }

    /// 解析 ffmpeg 路径
    pub async fn resolve(&self) -> Result<PathBuf, ResolveError> {
        if let Some(path) = self.cache.get() {
            return Ok(path.clone());
        }

        let pending = {
            let mut slot = self
                .inflight
                .lock()
                .map_err(|_| ResolveError::unavailable("依赖解析状态异常"))?;
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let pending = resolve_uncached(self.config.clone(), self.fetcher.clone())
                        .boxed()
                        .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;
        if let Ok(path) = &result {
            let _ = self.cache.set(path.clone());
        }
        // 只清理自己等待的那一次，不能误删后来者新建的解析
        if let Ok(mut slot) = self.inflight.lock() {
            if slot.as_ref().is_some_and(|s| s.ptr_eq(&pending)) {
                *slot = None;
            }
        }
        result
    }
}

async fn resolve_uncached(
    config: FfmpegConfig,
    fetcher: Arc<dyn ArchiveFetcher>,
) -> Result<PathBuf, ResolveError> {
    if let Some(path) = probe::probe(&config) {
        match probe::version(&path).await {
            Some(version) => info!("使用 ffmpeg: {} ({})", path.display(), version),
            None => info!("使用 ffmpeg: {}", path.display()),
        }
        return Ok(path);
    }

    info!("未找到 ffmpeg，尝试自动下载...");
    let bin_dir = config.install_dir.join("bin");
    match fetcher.fetch(&bin_dir).await {
        Ok(path) => {
            info!("✅ ffmpeg 已安装: {}", path.display());
            Ok(path)
        }
        Err(ResolveError::Unavailable { reason }) => {
            warn!("❌ ffmpeg 不可用: {}", reason);
            Err(ResolveError::Unavailable { reason })
        }
        Err(e) => {
            warn!("❌ 自动下载 ffmpeg 失败: {}", e);
            Err(ResolveError::unavailable(e.to_string()))
        }
    }
}
