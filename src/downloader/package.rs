use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use super::error::DownloadError;

/// 把与输出文件同名（stem 相同）的所有文件打包到 `<destination>/<stem>.zip`，
/// 成功后删除临时下载目录
pub async fn package_output(
    file: &Path,
    working_dir: &Path,
    destination: &Path,
) -> Result<PathBuf, DownloadError> {
    let file = file.to_path_buf();
    let working_dir = working_dir.to_path_buf();
    let destination = destination.to_path_buf();

    let archive = tokio::task::spawn_blocking(move || write_archive(&file, &working_dir, &destination))
        .await
        .map_err(|e| DownloadError::Io(std::io::Error::other(e)))??;
    info!("✅ 已打包: {}", archive.display());
    Ok(archive)
}

fn write_archive(
    file: &Path,
    working_dir: &Path,
    destination: &Path,
) -> Result<PathBuf, DownloadError> {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| DownloadError::InvalidInput(format!("无效的文件名: {}", file.display())))?;

    let mut members: Vec<PathBuf> = std::fs::read_dir(working_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&stem))
                .unwrap_or(false)
        })
        .collect();
    if members.is_empty() && file.is_file() {
        members.push(file.to_path_buf());
    }
    members.sort();

    let archive_path = destination.join(format!("{}.zip", stem));
    let mut zip = zip::ZipWriter::new(File::create(&archive_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for member in &members {
        let name = member
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("打包 {}", name);
        zip.start_file(name, options)
            .map_err(|e| DownloadError::Io(std::io::Error::other(e)))?;
        let data = std::fs::read(member)?;
        zip.write_all(&data)?;
    }
    zip.finish()
        .map_err(|e| DownloadError::Io(std::io::Error::other(e)))?;

    if working_dir != destination {
        std::fs::remove_dir_all(working_dir)?;
    }
    Ok(archive_path)
}
