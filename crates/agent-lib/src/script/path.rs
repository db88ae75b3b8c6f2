//! Script path confinement

use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};

/// Resolve `script` to a canonical path inside `root`
///
/// Both `/` and `\` count as separators regardless of platform, so a
/// Windows-style `..\..\x.ps1` is rejected everywhere. Absolute paths, drive
/// prefixes and `..` segments are violations, as is any symlink whose target
/// leaves the canonical root.
pub async fn resolve_script_path(root: &Path, script: &str) -> Result<PathBuf> {
    let violation = || EngineError::PathViolation {
        script: script.to_string(),
        root: root.to_path_buf(),
    };

    if script.starts_with('/') || script.starts_with('\\') || script.contains(':') {
        return Err(violation());
    }

    let mut relative = PathBuf::new();
    for segment in script.split(|c| c == '/' || c == '\\') {
        match segment {
            "" | "." => continue,
            ".." => return Err(violation()),
            s => relative.push(s),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(violation());
    }

    let spawn_error = |source| EngineError::ScriptSpawn {
        script: script.to_string(),
        source,
    };

    let root = tokio::fs::canonicalize(root).await.map_err(spawn_error)?;
    let resolved = tokio::fs::canonicalize(root.join(&relative))
        .await
        .map_err(spawn_error)?;

    if !resolved.starts_with(&root) {
        return Err(violation());
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn scripts_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("ok.ps1"), "exit 0").await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub").join("nested.ps1"), "exit 0")
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_resolves_inside_root() {
        let dir = scripts_dir().await;
        let path = resolve_script_path(dir.path(), "ok.ps1").await.unwrap();
        assert!(path.ends_with("ok.ps1"));

        let nested = resolve_script_path(dir.path(), "sub\\nested.ps1").await.unwrap();
        assert!(nested.ends_with("nested.ps1"));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = scripts_dir().await;
        for script in [
            "..\\..\\Windows\\System32\\x.ps1",
            "../../etc/passwd",
            "sub/../../ok.ps1",
            "/etc/passwd",
            "\\\\server\\share\\x.ps1",
            "C:\\Windows\\x.ps1",
            "",
            "./",
        ] {
            let err = resolve_script_path(dir.path(), script).await.unwrap_err();
            assert!(
                matches!(err, EngineError::PathViolation { .. }),
                "{script:?} should be a path violation, got {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_script_is_spawn_error() {
        let dir = scripts_dir().await;
        let err = resolve_script_path(dir.path(), "absent.ps1").await.unwrap_err();
        assert_eq!(err.kind(), "script_spawn_error");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejects_symlink_escape() {
        let dir = scripts_dir().await;
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("evil.sh");
        tokio::fs::write(&target, "exit 0").await.unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link.sh")).unwrap();

        let err = resolve_script_path(dir.path(), "link.sh").await.unwrap_err();
        assert!(matches!(err, EngineError::PathViolation { .. }));
    }
}
