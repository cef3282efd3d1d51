use std::env;
use std::path::{Path, PathBuf};

/// 可执行文件名（Windows 下追加 `.exe`）
pub fn exe_name(stem: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", stem)
    } else {
        stem.to_string()
    }
}

/// 在 `PATH` 中查找可执行文件，行为类似 `which`
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = env::var_os("PATH")?;
    let name = if cfg!(windows) && candidate.extension().is_none() {
        exe_name(program)
    } else {
        program.to_string()
    };
    env::split_paths(&path_var)
        .map(|dir| dir.join(&name))
        .find(|p| is_executable(p))
}

/// 文件存在且（unix 下）带有执行权限
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn explicit_path_requires_exec_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        assert!(find_in_path(tool.to_str().unwrap()).is_none());

        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_in_path(tool.to_str().unwrap()), Some(tool));
    }

    #[test]
    fn missing_program_is_none() {
        assert!(find_in_path("definitely-not-a-real-program-7f3a").is_none());
    }
}
