//! Result packaging and upload.
//!
//! A successful task's workspace is zipped into a single deterministic
//! archive and PUT to the destination the orchestrator handed out. Upload
//! problems are logged and never change the task's terminal status.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use matcha_core::TaskId;

use crate::error::PackageError;
use crate::workspace::sanitize;

/// Transfers an archive to a destination reference.
#[async_trait]
pub trait ResultUploader: Send + Sync {
    async fn upload(&self, archive: &Path, destination: &str) -> Result<(), PackageError>;
}

/// Single PUT of the archive bytes to a (usually pre-signed) URL.
#[derive(Debug, Clone, Default)]
pub struct HttpUploader {
    inner: reqwest::Client,
}

impl HttpUploader {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultUploader for HttpUploader {
    async fn upload(&self, archive: &Path, destination: &str) -> Result<(), PackageError> {
        let bytes = tokio::fs::read(archive).await?;
        let size = bytes.len();
        let response = self
            .inner
            .put(destination)
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PackageError::Rejected(status.as_u16()));
        }
        info!(bytes = size, "Results uploaded");
        Ok(())
    }
}

/// Zip the contents of `dir` into `archive_path`.
///
/// Returns `Ok(None)` without creating anything when `dir` is empty. Entries
/// are written in sorted order with fixed timestamps and permissions, so the
/// same tree always yields the same bytes.
pub fn package(dir: &Path, archive_path: &Path) -> Result<Option<PathBuf>, PackageError> {
    let mut entries = Vec::new();
    collect_entries(dir, dir, &mut entries)?;
    if entries.is_empty() {
        return Ok(None);
    }
    entries.sort();

    let mut zip = ZipWriter::new(File::create(archive_path)?);
    for entry in &entries {
        let full = dir.join(&entry.relative);
        let name = entry.archive_name();
        if entry.is_dir {
            zip.add_directory(name, entry_options(0o755))?;
        } else {
            zip.start_file(name, entry_options(0o644))?;
            let mut file = File::open(&full)?;
            io::copy(&mut file, &mut zip)?;
        }
    }
    zip.finish()?;

    Ok(Some(archive_path.to_path_buf()))
}

fn entry_options(mode: u32) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(mode)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    relative: PathBuf,
    is_dir: bool,
}

impl Entry {
    fn archive_name(&self) -> String {
        let joined = self
            .relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if self.is_dir {
            format!("{}/", joined)
        } else {
            joined
        }
    }
}

fn collect_entries(root: &Path, dir: &Path, out: &mut Vec<Entry>) -> io::Result<()> {
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let path = item.path();
        let file_type = item.file_type()?;
        let relative = path
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .to_path_buf();

        if file_type.is_dir() {
            out.push(Entry {
                relative,
                is_dir: true,
            });
            collect_entries(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(Entry {
                relative,
                is_dir: false,
            });
        }
        // Symlinks and special files written by the container are skipped.
    }
    Ok(())
}

/// Stable reference to an uploaded object: the destination without its
/// query string or fragment.
pub fn result_reference(destination: &str) -> String {
    match reqwest::Url::parse(destination) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => destination.to_string(),
    }
}

/// Packages a workspace and ships it.
#[derive(Clone)]
pub struct ResultPackager {
    archive_dir: PathBuf,
    uploader: Arc<dyn ResultUploader>,
}

impl ResultPackager {
    pub fn new(archive_dir: impl Into<PathBuf>, uploader: Arc<dyn ResultUploader>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            uploader,
        }
    }

    /// Archive, upload, and delete the local archive.
    ///
    /// Returns the result reference only when the upload succeeded. An empty
    /// workspace produces no archive and no upload.
    pub async fn deliver(
        &self,
        task_id: &TaskId,
        workspace: &Path,
        destination: &str,
    ) -> Option<String> {
        let archive_path = self
            .archive_dir
            .join(format!("results_{}.zip", sanitize(task_id.as_str())));

        let dir = workspace.to_path_buf();
        let target = archive_path.clone();
        let packaged = match tokio::task::spawn_blocking(move || package(&dir, &target)).await {
            Ok(result) => result,
            Err(e) => Err(PackageError::Io(io::Error::new(io::ErrorKind::Other, e))),
        };

        let archive = match packaged {
            Ok(Some(archive)) => archive,
            Ok(None) => {
                info!(task_id = %task_id, "Workspace empty, nothing to upload");
                return None;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to package results");
                remove_archive(&archive_path).await;
                return None;
            }
        };

        let outcome = self.uploader.upload(&archive, destination).await;
        remove_archive(&archive).await;

        match outcome {
            Ok(()) => {
                info!(task_id = %task_id, "Results delivered");
                Some(result_reference(destination))
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Result upload failed");
                None
            }
        }
    }
}

async fn remove_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove local archive"),
    }
}
