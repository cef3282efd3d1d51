//! 面向用户的数值格式化：文件大小、速度、剩余时间

/// 格式化字节数，例如 `1.5 MB`
pub fn format_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let size = size_bytes as f64;
    if size < KB {
        format!("{} B", size_bytes)
    } else if size < KB * KB {
        format!("{:.1} KB", size / KB)
    } else if size < KB * KB * KB {
        format!("{:.1} MB", size / (KB * KB))
    } else {
        format!("{:.2} GB", size / (KB * KB * KB))
    }
}

/// 格式化传输速度，例如 `3.2 MB/s`
pub fn format_speed(bytes_per_sec: f64) -> String {
    let speed = bytes_per_sec.abs();
    if speed < 1024.0 {
        format!("{:.1} B/s", speed)
    } else if speed < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", speed / 1024.0)
    } else {
        format!("{:.1} MB/s", speed / (1024.0 * 1024.0))
    }
}

/// 格式化剩余时间
pub fn format_eta(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}秒", seconds)
    } else if seconds < 3600 {
        format!("{}分{}秒", seconds / 60, seconds % 60)
    } else {
        format!("{}时{}分", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn eta_buckets() {
        assert_eq!(format_eta(42), "42秒");
        assert_eq!(format_eta(125), "2分5秒");
        assert_eq!(format_eta(3720), "1时2分");
    }

    #[test]
    fn speed_units() {
        assert_eq!(format_speed(100.0), "100.0 B/s");
        assert_eq!(format_speed(2048.0), "2.0 KB/s");
        assert_eq!(format_speed(3.0 * 1024.0 * 1024.0), "3.0 MB/s");
    }
}
