//! Filesystem helpers for per-branch scratch directories.

use std::path::Path;

use anyhow::{Context, Result};

/// Remove the directory (if present) and create it fresh. Refuses the
/// filesystem root.
pub async fn recreate_dir(path: &Path) -> Result<()> {
    let display = path.display().to_string();
    if display.trim().is_empty() || display.trim() == "/" {
        anyhow::bail!("Refusing to recreate directory: {}", display);
    }
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove directory {}", display));
        }
    }
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", display))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("scratch");
        recreate_dir(&target).await.unwrap();
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn wipes_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("scratch");
        std::fs::create_dir_all(target.join("nested")).unwrap();
        std::fs::write(target.join("nested/file"), b"old").unwrap();

        recreate_dir(&target).await.unwrap();
        assert!(target.is_dir());
        assert!(!target.join("nested").exists());
    }

    #[tokio::test]
    async fn refuses_filesystem_root() {
        assert!(recreate_dir(Path::new("/")).await.is_err());
    }
}
