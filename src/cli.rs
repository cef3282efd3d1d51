use clap::Parser;
use std::path::PathBuf;

/// yt-dlp 批量下载器
#[derive(Parser, Debug)]
#[command(name = "ytdl")]
#[command(version = "0.1")]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "并发下载 YouTube 视频，实时显示进度", long_about = None)]
pub struct Cli {
    /// 视频链接，可以一次提交多个
    #[arg(value_name = "URL", required = true)]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub urls: Vec<String>,

    /// 视频质量
    #[arg(long, value_name = "QUALITY")]
    #[arg(default_value = "best")]
    #[arg(help = "视频质量: best, 2160, 1440, 1080, 720, 480, 360")]
    pub quality: String,

    /// 输出格式
    #[arg(long, value_name = "FORMAT")]
    #[arg(default_value = "video")]
    #[arg(help = "输出格式: video, audio (mp3), video_webm, video_mkv")]
    pub format: String,

    /// 视频保存目录（默认使用配置中的目录）
    #[arg(long, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,

    /// 下载完成后打包为 zip
    #[arg(long)]
    pub zip: bool,

    /// JSON 配置文件
    #[arg(long, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// 最大尝试次数（覆盖配置）
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// 下载历史文件 (JSON Lines)
    #[arg(long, value_name = "FILE", default_value = "download_history.jsonl")]
    pub history: PathBuf,

    /// 输出调试日志
    #[arg(short, long)]
    pub verbose: bool,
}
