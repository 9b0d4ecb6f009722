//! Per-session working directories.

use crate::error::{QueueError, Result};
use crate::process::Application;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Subdirectories every session tree is created with.
pub const SESSION_SUBDIRS: [&str; 4] = ["excel", "powerpoint", "pdf", "temp"];

/// The directory tree owned by a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirs {
    root: PathBuf,
}

impl SessionDirs {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn excel(&self) -> PathBuf {
        self.root.join("excel")
    }

    pub fn powerpoint(&self) -> PathBuf {
        self.root.join("powerpoint")
    }

    pub fn pdf(&self) -> PathBuf {
        self.root.join("pdf")
    }

    pub fn temp(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn for_application(&self, application: Application) -> PathBuf {
        match application {
            Application::Excel => self.excel(),
            Application::PowerPoint => self.powerpoint(),
        }
    }

    /// Resolve a path inside the tree. A leading `/` is treated as the tree root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(QueueError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

/// Allocates and removes session trees under a common base directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create a fresh tree for the session, replacing any leftover at the same path.
    pub async fn create(&self, user_id: &str, session_id: &str) -> Result<SessionDirs> {
        let root = self
            .base
            .join(format!("{}-{}", sanitize(user_id), session_id));

        if fs::try_exists(&root).await? {
            debug!(path = %root.display(), "Removing leftover session directory");
            remove_tree(&root).await?;
        }

        for sub in SESSION_SUBDIRS {
            fs::create_dir_all(root.join(sub)).await?;
        }
        info!(path = %root.display(), user_id, session_id, "Created session directory");

        Ok(SessionDirs { root })
    }

    /// Delete a session tree. Missing trees are fine.
    pub async fn destroy(&self, dirs: &SessionDirs) -> Result<()> {
        remove_tree(dirs.root()).await?;
        debug!(path = %dirs.root().display(), "Removed session directory");
        Ok(())
    }
}

/// Write a file into the session tree, creating parent directories.
pub async fn write_artifact(dirs: &SessionDirs, path: &str, content: &[u8]) -> Result<PathBuf> {
    let full_path = dirs.resolve(path)?;
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&full_path, content).await?;
    Ok(full_path)
}

/// Read a file from the session tree.
pub async fn read_artifact(dirs: &SessionDirs, path: &str) -> Result<Vec<u8>> {
    let full_path = dirs.resolve(path)?;
    Ok(fs::read(&full_path).await?)
}

async fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn sanitize(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
