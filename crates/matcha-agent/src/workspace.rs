//! Task-scoped output directory.

use std::io;
use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, warn};

use matcha_core::TaskId;

/// A fresh, uniquely named directory bound into one sandbox as its output
/// directory. Removed by [`Workspace::close`], or on drop if never closed.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create an empty workspace for `task_id` under `parent`.
    pub fn acquire_in(task_id: &TaskId, parent: &Path) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("matcha-task-{}-", sanitize(task_id.as_str())))
            .tempdir_in(parent)?;
        debug!(task_id = %task_id, path = %dir.path().display(), "Workspace acquired");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Delete the directory and everything in it. Errors are logged.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "Workspace removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove workspace"),
        }
    }
}

/// Keep task ids usable as a path component.
pub(crate) fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect()
}
