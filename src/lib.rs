pub mod common;
pub mod config;
pub mod downloader;
pub mod ffmpeg;
pub mod progress;
pub mod retry;
pub mod task;

pub use downloader::DownloadManager;
pub use task::{SubmitRequest, TaskView, ViewStatus};
