use colored::*;
use tracing_subscriber::EnvFilter;

/// 初始化 tracing 日志，`RUST_LOG` 优先于命令行的 verbose 开关
pub fn init_tracing(verbose: bool) {
    let default_directive = if verbose {
        "info,yt_downloader=debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// 漂亮的终端输出工具
pub struct PrettyLogger;

impl PrettyLogger {
    /// 显示信息消息
    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    /// 显示警告消息
    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    /// 显示错误消息
    pub fn error(message: impl AsRef<str>) {
        println!("{} {}", "✗".red().bold(), message.as_ref());
    }

    /// 显示文件信息
    pub fn file_info(label: impl AsRef<str>, path: impl AsRef<str>) {
        println!(
            "{} {}: {}",
            "📁".blue().bold(),
            label.as_ref().bold(),
            path.as_ref()
        );
    }

    /// 显示分割线
    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    /// 显示标题
    pub fn title(text: impl AsRef<str>) {
        let text = text.as_ref();
        let width = text.chars().count().min(48);
        let padding = (48 - width) / 2;
        println!(
            "{} {} {}",
            "─".repeat(padding).bright_black(),
            text.bold(),
            "─".repeat(48 - padding - width).bright_black()
        );
    }

    /// 显示完成总结
    pub fn completion_summary(items: Vec<impl AsRef<str>>) {
        println!("\n{}", "🎉 全部任务结束".green().bold());
        for item in items {
            println!("  {}", item.as_ref());
        }
    }
}
