use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::debug;

use yt_downloader::common::format::format_size;
use yt_downloader::common::logger::{PrettyLogger, init_tracing};
use yt_downloader::config::Settings;
use yt_downloader::downloader::history::JsonLinesHistory;
use yt_downloader::{DownloadManager, SubmitRequest, ViewStatus};

mod cli;

struct Submitted {
    task_id: String,
    url: String,
    bar: ProgressBar,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing(args.verbose);

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(max_attempts) = args.max_attempts {
        settings.retry.max_attempts = max_attempts.max(1);
    }
    if let Some(dir) = &args.output_dir {
        settings.default_output_dir = dir.clone();
    }
    debug!("配置: {:?}", settings);

    let history = Arc::new(JsonLinesHistory::new(&args.history));
    let manager = DownloadManager::new(settings, history);
    let _sweeper = manager.spawn_sweeper();

    PrettyLogger::title("ytdl");

    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}",
    )?
    .progress_chars("#>-");

    let mut submitted = Vec::new();
    for url in &args.urls {
        let request = SubmitRequest::new(url.as_str())
            .with_quality(args.quality.as_str())
            .with_format(args.format.as_str())
            .packaged(args.zip);
        match manager.submit(request).await {
            Ok(task_id) => {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(style.clone());
                bar.enable_steady_tick(Duration::from_millis(120));
                submitted.push(Submitted {
                    task_id,
                    url: url.clone(),
                    bar,
                });
            }
            Err(e) => PrettyLogger::error(format!("{}: {}", url, e)),
        }
    }
    if submitted.is_empty() {
        anyhow::bail!("没有可执行的下载任务");
    }
    PrettyLogger::info(format!("已提交 {} 个下载任务", submitted.len()));

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                let running = manager.running();
                multi.suspend(|| {
                    PrettyLogger::warning(format!("收到 Ctrl-C，正在取消 {} 个任务...", running))
                });
                manager.cancel_all();
            }
        }

        let mut all_done = true;
        for item in &submitted {
            let view = manager.snapshot(&item.task_id);
            item.bar.set_position(view.progress.floor() as u64);
            item.bar.set_message(view.message.clone());
            if view.is_terminal() {
                if !item.bar.is_finished() {
                    item.bar.finish();
                }
            } else {
                all_done = false;
            }
        }
        if all_done {
            break;
        }
    }

    PrettyLogger::separator();
    let mut summary = Vec::new();
    for item in &submitted {
        let view = manager.snapshot(&item.task_id);
        match view.status {
            ViewStatus::Completed => {
                let path = view
                    .output_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| item.url.clone());
                let size = view
                    .output_path
                    .as_ref()
                    .and_then(|p| std::fs::metadata(p).ok())
                    .map(|m| format!(" ({})", format_size(m.len())))
                    .unwrap_or_default();
                summary.push(format!("{} {}{}", "✓".green().bold(), path, size));
            }
            _ if view.cancelled => {
                summary.push(format!("{} {} - 已取消", "⚠".yellow().bold(), item.url));
            }
            _ => {
                let reason = view.error.unwrap_or(view.message);
                summary.push(format!("{} {} - {}", "✗".red().bold(), item.url, reason));
            }
        }
    }
    PrettyLogger::completion_summary(summary);
    PrettyLogger::file_info("下载历史", args.history.display().to_string());

    Ok(())
}
