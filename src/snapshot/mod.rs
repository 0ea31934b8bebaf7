// SPDX-License-Identifier: MIT
//! C1 — Snapshot Reader.
//!
//! Exposes an immutable view of a project's files for the duration of one
//! deployment. Implementations must satisfy this by reading inside a single
//! transaction or by buffering; the in-memory implementation here buffers by
//! construction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One file (or directory marker) in a project snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectFile {
    pub path: String,
    pub content: Vec<u8>,
    pub size: u64,
    pub mime_type: String,
    pub is_dir: bool,
    /// Project-policy marker; excluded from non-privileged reads.
    pub protected: bool,
}

impl ProjectFile {
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>, mime_type: &str) -> Self {
        let content = content.into();
        let size = content.len() as u64;
        Self {
            path: path.into(),
            content,
            size,
            mime_type: mime_type.to_string(),
            is_dir: false,
            protected: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("reading project snapshot from disk: {0}")]
    Io(String),
}

/// A stable view of a project's files, as seen by one deployment.
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    /// Read the full file set for `project_id`. `privileged` controls
    /// whether files marked `protected` are included.
    async fn read(
        &self,
        project_id: &str,
        privileged: bool,
    ) -> Result<Vec<ProjectFile>, SnapshotError>;
}

/// In-memory reader backed by a fixed map, used by tests and by the fake
/// end-to-end scenarios. Buffers the whole set at construction time so a
/// `read()` call is always a consistent snapshot regardless of later
/// mutation through `put`. Returns every file regardless of `privileged` —
/// the protected-file exclusion lives in [`PolicyFilteringReader`], not
/// here, so a reader implementation never has to reimplement the policy.
#[derive(Default)]
pub struct InMemorySnapshotReader {
    projects: tokio::sync::RwLock<std::collections::HashMap<String, Vec<ProjectFile>>>,
}

impl InMemorySnapshotReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, project_id: impl Into<String>, files: Vec<ProjectFile>) {
        self.projects.write().await.insert(project_id.into(), files);
    }
}

#[async_trait]
impl SnapshotReader for InMemorySnapshotReader {
    async fn read(
        &self,
        project_id: &str,
        _privileged: bool,
    ) -> Result<Vec<ProjectFile>, SnapshotError> {
        let projects = self.projects.read().await;
        projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(project_id.to_string()))
    }
}

/// Real-backed reader: `project_id` is a subdirectory of `root`, walked
/// recursively. A path component starting with `.` (`.env`, `.git/…`) is
/// marked `protected` — the filesystem convention this crate relies on in
/// place of a separate policy file, since the projects it deploys are
/// ordinary web/service source trees where dotfiles are exactly the
/// category of thing (secrets, CI credentials) that should never reach a
/// non-privileged caller.
pub struct DirectorySnapshotReader {
    root: std::path::PathBuf,
}

impl DirectorySnapshotReader {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn is_protected(rel_path: &str) -> bool {
        rel_path.split('/').any(|segment| !segment.is_empty() && segment.starts_with('.'))
    }

    fn guess_mime_type(rel_path: &str) -> &'static str {
        match rel_path.rsplit('.').next() {
            Some("html" | "htm") => "text/html",
            Some("json") => "application/json",
            Some("js" | "mjs") => "text/javascript",
            Some("css") => "text/css",
            Some("svg") => "image/svg+xml",
            Some("png") => "image/png",
            Some("jpg" | "jpeg") => "image/jpeg",
            Some("txt" | "md" | "toml" | "yaml" | "yml") => "text/plain",
            _ => "application/octet-stream",
        }
    }
}

#[async_trait]
impl SnapshotReader for DirectorySnapshotReader {
    async fn read(&self, project_id: &str, _privileged: bool) -> Result<Vec<ProjectFile>, SnapshotError> {
        let project_root = self.root.join(project_id);
        if !tokio::fs::try_exists(&project_root).await.unwrap_or(false) {
            return Err(SnapshotError::NotFound(project_id.to_string()));
        }

        let mut files = Vec::new();
        let mut dirs = vec![project_root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| SnapshotError::Io(e.to_string()))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| SnapshotError::Io(e.to_string()))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| SnapshotError::Io(e.to_string()))?;
                if file_type.is_dir() {
                    dirs.push(path);
                    continue;
                }

                let rel_path = path
                    .strip_prefix(&project_root)
                    .expect("walked path is always under project_root")
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");
                let content = tokio::fs::read(&path).await.map_err(|e| SnapshotError::Io(e.to_string()))?;
                let size = content.len() as u64;
                let mime_type = Self::guess_mime_type(&rel_path);
                let protected = Self::is_protected(&rel_path);

                files.push(ProjectFile {
                    path: format!("/{rel_path}"),
                    content,
                    size,
                    mime_type: mime_type.to_string(),
                    is_dir: false,
                    protected,
                });
            }
        }
        Ok(files)
    }
}

/// Wraps any [`SnapshotReader`] and enforces the protected-file exclusion
/// policy: a non-privileged `read()` drops files marked `protected`,
/// regardless of whether the inner reader already filters them. Orchestrator
/// deployments always go through this wrapper rather than a bare reader.
pub struct PolicyFilteringReader<R: SnapshotReader> {
    inner: R,
}

impl<R: SnapshotReader> PolicyFilteringReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: SnapshotReader> SnapshotReader for PolicyFilteringReader<R> {
    async fn read(
        &self,
        project_id: &str,
        privileged: bool,
    ) -> Result<Vec<ProjectFile>, SnapshotError> {
        let files = self.inner.read(project_id, privileged).await?;
        if privileged {
            Ok(files)
        } else {
            Ok(files.into_iter().filter(|f| !f.protected).collect())
        }
    }
}
