//! Sink that stores uploads in a local directory (a mounted storage volume).
//!
//! Bytes are written to a hidden `.part` scratch file next to the target and
//! moved into place on finalize, so readers never observe a partial file.
//! Under [`NameConflict::Unique`] the move is a hard link that fails on an
//! existing name, so concurrent uploads of the same name never replace each
//! other.

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::TransferError;
use crate::naming::{numbered_name, validate_name};
use crate::scratch::ScratchFile;
use crate::sink::{Sink, UploadSession};

/// Characters kept verbatim in public references.
const NAME_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// Highest ` (n)` suffix tried before giving up on a unique name.
const MAX_UNIQUE_SUFFIX: u32 = 10_000;

/// What to do when the target name already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameConflict {
    /// Keep both: store as `name (n).ext` (case-sensitive comparison).
    #[default]
    Unique,
    /// Replace the existing file.
    Overwrite,
}

/// Stores uploads under `root`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    public_base_url: Option<String>,
    on_conflict: NameConflict,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
            on_conflict: NameConflict::default(),
        }
    }

    /// References become `<base>/<percent-encoded name>` instead of paths.
    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        self.public_base_url = Some(base.into());
        self
    }

    pub fn with_conflict_policy(mut self, policy: NameConflict) -> Self {
        self.on_conflict = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Sink for DirectorySink {
    fn begin_upload<'a>(
        &'a self,
        name: &'a str,
        total_bytes: Option<u64>,
    ) -> BoxFuture<'a, Result<Box<dyn UploadSession>, TransferError>> {
        Box::pin(async move {
            validate_name(name)?;
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| TransferError::from_sink_io(&e))?;

            let tag = uuid::Uuid::new_v4().simple().to_string();
            let scratch = ScratchFile::in_dir(&self.root, name, &tag[..12]);
            let file = tokio::fs::File::create(scratch.path())
                .await
                .map_err(|e| TransferError::from_sink_io(&e))?;

            debug!(name, ?total_bytes, scratch = %scratch.path().display(), "directory upload started");

            Ok(Box::new(DirectoryUpload {
                file,
                scratch,
                root: self.root.clone(),
                name: name.to_string(),
                public_base_url: self.public_base_url.clone(),
                on_conflict: self.on_conflict,
                written: 0,
            }) as Box<dyn UploadSession>)
        })
    }
}

struct DirectoryUpload {
    file: tokio::fs::File,
    scratch: ScratchFile,
    root: PathBuf,
    name: String,
    public_base_url: Option<String>,
    on_conflict: NameConflict,
    written: u64,
}

/// Claims the first free name among `name`, `name (1)`, ... by linking the
/// scratch file to it. The link fails if another upload took the name first.
async fn store_unique(
    scratch: &mut ScratchFile,
    root: &Path,
    name: &str,
) -> Result<String, TransferError> {
    let mut candidate = name.to_string();
    for n in 1..=MAX_UNIQUE_SUFFIX {
        match scratch.persist_new(&root.join(&candidate)).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(name = %candidate, "name taken");
            }
            Err(e) => return Err(TransferError::from_sink_io(&e)),
        }
        candidate = numbered_name(name, n);
    }
    Err(TransferError::SinkRejected(format!("no free name for {name}")))
}

/// Public URL when a base is configured, otherwise the canonical path.
async fn reference_for(public_base_url: Option<&str>, stored_name: &str, path: &Path) -> String {
    match public_base_url {
        Some(base) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            utf8_percent_encode(stored_name, NAME_ENCODE)
        ),
        None => tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string(),
    }
}

impl UploadSession for DirectoryUpload {
    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move {
            self.file
                .write_all(chunk)
                .await
                .map_err(|e| TransferError::from_sink_io(&e))?;
            self.written += chunk.len() as u64;
            Ok(chunk.len())
        })
    }

    fn finalize(self: Box<Self>) -> BoxFuture<'static, Result<String, TransferError>> {
        Box::pin(async move {
            let mut this = *self;
            this.file
                .flush()
                .await
                .map_err(|e| TransferError::from_sink_io(&e))?;
            this.file
                .sync_all()
                .await
                .map_err(|e| TransferError::from_sink_io(&e))?;

            let DirectoryUpload {
                file,
                mut scratch,
                root,
                name,
                public_base_url,
                on_conflict,
                written,
            } = this;
            drop(file);

            let stored_name = match on_conflict {
                NameConflict::Overwrite => {
                    scratch
                        .persist(&root.join(&name))
                        .await
                        .map_err(|e| TransferError::from_sink_io(&e))?;
                    name
                }
                NameConflict::Unique => store_unique(&mut scratch, &root, &name).await?,
            };

            let reference =
                reference_for(public_base_url.as_deref(), &stored_name, &root.join(&stored_name)).await;
            info!(name = %stored_name, bytes = written, "file stored");
            Ok(reference)
        })
    }

    fn abort(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let DirectoryUpload {
                file,
                scratch,
                name,
                written,
                ..
            } = *self;
            drop(file);
            scratch.discard().await;
            debug!(name = %name, written, "directory upload aborted");
        })
    }

    fn confirmed_bytes(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    async fn store(sink: &DirectorySink, name: &str, data: &[u8]) -> String {
        let mut upload = sink.begin_upload(name, Some(data.len() as u64)).await.unwrap();
        for chunk in data.chunks(3) {
            assert_eq!(upload.write(chunk).await.unwrap(), chunk.len());
        }
        assert_eq!(upload.confirmed_bytes(), data.len() as u64);
        upload.finalize().await.unwrap()
    }

    fn part_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".part"))
            .collect()
    }

    #[tokio::test]
    async fn stores_file_and_returns_path() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path());

        let reference = store(&sink, "notes.txt", b"hello world").await;

        let stored = dir.path().join("notes.txt");
        assert_eq!(std::fs::read(&stored).unwrap(), b"hello world");
        assert_eq!(
            Path::new(&reference),
            std::fs::canonicalize(&stored).unwrap()
        );
        assert!(part_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn public_reference_is_percent_encoded() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path()).with_public_base_url("https://files.example.com/");

        let reference = store(&sink, "My Movie.mkv", b"abc").await;
        assert_eq!(reference, "https://files.example.com/My%20Movie.mkv");
    }

    #[tokio::test]
    async fn unique_policy_keeps_both_files() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path()).with_public_base_url("https://f");

        store(&sink, "report.pdf", b"one").await;
        let second = store(&sink, "report.pdf", b"two").await;

        assert_eq!(second, "https://f/report%20%281%29.pdf");
        assert_eq!(std::fs::read(dir.path().join("report.pdf")).unwrap(), b"one");
        assert_eq!(
            std::fs::read(dir.path().join("report (1).pdf")).unwrap(),
            b"two"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_uploads_never_share_a_name() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path());

        for round in 0..20 {
            let name = format!("r{round}.bin");
            let mut a = sink.begin_upload(&name, None).await.unwrap();
            let mut b = sink.begin_upload(&name, None).await.unwrap();
            a.write(b"from a").await.unwrap();
            b.write(b"from b").await.unwrap();

            let (ra, rb) = tokio::join!(tokio::spawn(a.finalize()), tokio::spawn(b.finalize()));
            let (ra, rb) = (ra.unwrap().unwrap(), rb.unwrap().unwrap());
            assert_ne!(ra, rb);

            let mut contents = vec![
                std::fs::read(dir.path().join(&name)).unwrap(),
                std::fs::read(dir.path().join(format!("r{round} (1).bin"))).unwrap(),
            ];
            contents.sort();
            assert_eq!(contents, vec![b"from a".to_vec(), b"from b".to_vec()]);
        }
        assert!(part_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn overwrite_policy_replaces_file() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path()).with_conflict_policy(NameConflict::Overwrite);

        store(&sink, "a.bin", b"old").await;
        store(&sink, "a.bin", b"new").await;

        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"new");
        assert!(!dir.path().join("a (1).bin").exists());
    }

    #[tokio::test]
    async fn abort_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path());

        let mut upload = sink.begin_upload("big.iso", None).await.unwrap();
        upload.write(b"partial").await.unwrap();
        assert_eq!(part_files(dir.path()).len(), 1);

        upload.abort().await;

        assert!(part_files(dir.path()).is_empty());
        assert!(!dir.path().join("big.iso").exists());
    }

    #[tokio::test]
    async fn dropped_session_removes_scratch() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path());

        let mut upload = sink.begin_upload("x.bin", None).await.unwrap();
        upload.write(b"abc").await.unwrap();
        drop(upload);

        assert!(part_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path());

        let err = sink.begin_upload("../escape", None).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SinkRejected);
    }

    #[tokio::test]
    async fn creates_missing_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("nested").join("store");
        let sink = DirectorySink::new(&root);

        store(&sink, "a.txt", b"1").await;
        assert!(root.join("a.txt").exists());
    }

    #[test]
    fn conflict_policy_parses_from_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            on_conflict: NameConflict,
        }
        let w: Wrapper = serde_json::from_str(r#"{"on_conflict":"overwrite"}"#).unwrap();
        assert_eq!(w.on_conflict, NameConflict::Overwrite);
    }
}
