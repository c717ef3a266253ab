//! Scoped scratch files that are removed unless explicitly persisted.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// A temporary path owned by one transfer.
///
/// The file at `path` is deleted when the guard is dropped, so every terminal
/// path (success, failure, cancellation, panic) releases it. Call
/// [`persist`](Self::persist) to move it into place instead.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    /// Reserves a scratch path named `.<stem>.<tag>.part` inside `dir`.
    pub fn in_dir(dir: &Path, stem: &str, tag: &str) -> Self {
        Self {
            path: dir.join(format!(".{stem}.{tag}.part")),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renames the scratch file to `target`, disarming the guard.
    pub async fn persist(mut self, target: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, target).await?;
        self.armed = false;
        debug!(path = %target.display(), "scratch file persisted");
        Ok(())
    }

    /// Links the scratch file to `target` only if nothing exists there, then
    /// drops the scratch name. Fails with `AlreadyExists` and keeps the guard
    /// armed when `target` is taken.
    pub async fn persist_new(&mut self, target: &Path) -> std::io::Result<()> {
        tokio::fs::hard_link(&self.path, target).await?;
        self.armed = false;
        remove_quietly(&self.path).await;
        debug!(path = %target.display(), "scratch file linked into place");
        Ok(())
    }

    /// Removes the scratch file now.
    pub async fn discard(mut self) {
        self.armed = false;
        remove_quietly(&self.path).await;
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "scratch file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove scratch file"),
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "scratch file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove scratch file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn drop_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = {
            let scratch = ScratchFile::in_dir(dir.path(), "a.bin", "t1");
            std::fs::write(scratch.path(), b"partial").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn drop_without_file_is_quiet() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchFile::in_dir(dir.path(), "a.bin", "t1");
        drop(scratch);
    }

    #[tokio::test]
    async fn persist_moves_file_into_place() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchFile::in_dir(dir.path(), "a.bin", "t1");
        let scratch_path = scratch.path().to_path_buf();
        std::fs::write(&scratch_path, b"done").unwrap();

        let target = dir.path().join("a.bin");
        scratch.persist(&target).await.unwrap();

        assert!(!scratch_path.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"done");
    }

    #[tokio::test]
    async fn persist_new_refuses_taken_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.bin");
        std::fs::write(&target, b"first").unwrap();

        let mut scratch = ScratchFile::in_dir(dir.path(), "a.bin", "t1");
        let scratch_path = scratch.path().to_path_buf();
        std::fs::write(&scratch_path, b"second").unwrap();

        let err = scratch.persist_new(&target).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&target).unwrap(), b"first");
        assert!(scratch_path.exists());

        let other = dir.path().join("b.bin");
        scratch.persist_new(&other).await.unwrap();
        assert_eq!(std::fs::read(&other).unwrap(), b"second");
        drop(scratch);
        assert!(!scratch_path.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn discard_removes_file() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchFile::in_dir(dir.path(), "a.bin", "t1");
        let path = scratch.path().to_path_buf();
        std::fs::write(&path, b"x").unwrap();
        scratch.discard().await;
        assert!(!path.exists());
    }

    #[test]
    fn scratch_name_is_hidden_part_file() {
        let scratch = ScratchFile::in_dir(Path::new("/data"), "movie.mkv", "abc");
        assert_eq!(scratch.path(), Path::new("/data/.movie.mkv.abc.part"));
    }
}
