// Local execution for commands marked `local`

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use super::{cancellable, Executor};
use crate::output::errors::SpotError;

const LOCAL_HOST: &str = "localhost";

/// Runs commands and file operations on the machine spot runs on
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        LocalExecutor
    }
}

async fn copy_file(src: &str, dst: &str, mkdir: bool) -> Result<(), SpotError> {
    if mkdir {
        if let Some(parent) = Path::new(dst).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SpotError::io(parent, e))?;
        }
    }
    tokio::fs::copy(src, dst)
        .await
        .map(|_| ())
        .map_err(|e| SpotError::transport("copy", LOCAL_HOST, format!("{} -> {}: {}", src, dst, e)))
}

fn relative_files(root: &Path) -> Result<Vec<PathBuf>, SpotError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| SpotError::transport("sync", LOCAL_HOST, e))?;
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(root) {
                files.push(rel.to_path_buf());
            }
        }
    }
    Ok(files)
}

fn needs_copy(src: &Path, dst: &Path) -> Result<bool, SpotError> {
    let src_meta = std::fs::metadata(src).map_err(|e| SpotError::io(src, e))?;
    let dst_meta = match std::fs::metadata(dst) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(SpotError::io(dst, e)),
    };
    if src_meta.len() != dst_meta.len() {
        return Ok(true);
    }
    match (src_meta.modified(), dst_meta.modified()) {
        (Ok(s), Ok(d)) => Ok(d < s),
        _ => Ok(true),
    }
}

/// Mirror `src_dir` into `dst_dir`, returning changed relative paths
fn sync_dirs(src_dir: &Path, dst_dir: &Path, delete: bool) -> Result<Vec<String>, SpotError> {
    let mut changed = Vec::new();
    let src_files = relative_files(src_dir)?;

    for rel in &src_files {
        let src = src_dir.join(rel);
        let dst = dst_dir.join(rel);
        if !needs_copy(&src, &dst)? {
            continue;
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SpotError::io(parent, e))?;
        }
        std::fs::copy(&src, &dst).map_err(|e| SpotError::io(&dst, e))?;
        changed.push(rel.display().to_string());
    }

    if delete && dst_dir.exists() {
        let keep: HashSet<&PathBuf> = src_files.iter().collect();
        for rel in relative_files(dst_dir)? {
            if keep.contains(&rel) {
                continue;
            }
            let dst = dst_dir.join(&rel);
            std::fs::remove_file(&dst).map_err(|e| SpotError::io(&dst, e))?;
            debug!("removed {}", dst.display());
            changed.push(rel.display().to_string());
        }
    }

    Ok(changed)
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(&self, cancel: &CancellationToken, cmd: &str) -> Result<Vec<String>, SpotError> {
        let output = cancellable(cancel, async {
            Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .await
                .map_err(|e| SpotError::transport("run", LOCAL_HOST, format!("can't start sh: {}", e)))
        })
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SpotError::transport(
                "run",
                LOCAL_HOST,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        local: &str,
        remote: &str,
        mkdir: bool,
    ) -> Result<(), SpotError> {
        cancellable(cancel, copy_file(local, remote, mkdir)).await
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &str,
        mkdir: bool,
    ) -> Result<(), SpotError> {
        cancellable(cancel, copy_file(remote, local, mkdir)).await
    }

    async fn sync(
        &self,
        cancel: &CancellationToken,
        local_dir: &str,
        remote_dir: &str,
        delete: bool,
    ) -> Result<Vec<String>, SpotError> {
        let src = PathBuf::from(local_dir);
        let dst = PathBuf::from(remote_dir);
        let job = tokio::task::spawn_blocking(move || sync_dirs(&src, &dst, delete));
        cancellable(cancel, async {
            job.await
                .map_err(|e| SpotError::transport("sync", LOCAL_HOST, e))?
        })
        .await
    }

    async fn delete(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        recursive: bool,
    ) -> Result<(), SpotError> {
        cancellable(cancel, async {
            let meta = match tokio::fs::symlink_metadata(remote).await {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(SpotError::io(remote, e)),
            };
            let res = if !meta.is_dir() {
                tokio::fs::remove_file(remote).await
            } else if recursive {
                tokio::fs::remove_dir_all(remote).await
            } else {
                tokio::fs::remove_dir(remote).await
            };
            res.map_err(|e| SpotError::transport("delete", LOCAL_HOST, format!("{}: {}", remote, e)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_run() {
        let cancel = CancellationToken::new();
        let out = LocalExecutor::new()
            .run(&cancel, "echo one; echo two")
            .await
            .unwrap();
        assert_eq!(out, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_local_run_failure() {
        let cancel = CancellationToken::new();
        let err = LocalExecutor::new().run(&cancel, "echo oops >&2; exit 3").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("oops"), "{msg}");
    }

    #[tokio::test]
    async fn test_local_run_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = LocalExecutor::new().run(&cancel, "sleep 5").await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_local_upload_with_mkdir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, "payload").unwrap();
        let dst = dir.path().join("nested/deeper/dst.txt");

        let cancel = CancellationToken::new();
        let exec = LocalExecutor::new();
        let err = exec
            .upload(&cancel, src.to_str().unwrap(), dst.to_str().unwrap(), false)
            .await;
        assert!(err.is_err());

        exec.upload(&cancel, src.to_str().unwrap(), dst.to_str().unwrap(), true)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_local_sync_and_delete() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.txt"), "a").unwrap();
        std::fs::write(src.path().join("sub/b.txt"), "b").unwrap();
        std::fs::write(dst.path().join("stale.txt"), "old").unwrap();

        let cancel = CancellationToken::new();
        let exec = LocalExecutor::new();
        let src_dir = src.path().to_str().unwrap();
        let dst_dir = dst.path().to_str().unwrap();

        let mut changed = exec.sync(&cancel, src_dir, dst_dir, true).await.unwrap();
        changed.sort();
        assert_eq!(changed, vec!["a.txt", "stale.txt", "sub/b.txt"]);
        assert!(!dst.path().join("stale.txt").exists());
        assert_eq!(std::fs::read_to_string(dst.path().join("sub/b.txt")).unwrap(), "b");

        let changed = exec.sync(&cancel, src_dir, dst_dir, true).await.unwrap();
        assert!(changed.is_empty());

        exec.delete(&cancel, dst.path().join("sub").to_str().unwrap(), true)
            .await
            .unwrap();
        assert!(!dst.path().join("sub").exists());

        // missing path is not an error
        exec.delete(&cancel, dst.path().join("nope").to_str().unwrap(), false)
            .await
            .unwrap();
    }
}
