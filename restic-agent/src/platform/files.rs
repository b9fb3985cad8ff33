//! Rendered job configuration files, one `<job>.env` per job.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::model::ValidJob;
use crate::render::render_config;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.env", name))
    }

    pub async fn write(&self, job: &ValidJob) -> std::io::Result<()> {
        write_atomic(&self.path(&job.name), &render_config(job)).await
    }

    pub async fn read(&self, name: &str) -> std::io::Result<Option<String>> {
        read_optional(&self.path(name)).await
    }

    pub async fn remove(&self, name: &str) -> std::io::Result<()> {
        remove_optional(&self.path(name)).await
    }

    /// Names of every job with a config file on disk.
    pub async fn names(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        let Some(mut entries) = read_dir_optional(&self.dir).await? else {
            return Ok(names);
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str().and_then(|f| f.strip_suffix(".env")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Write through a temporary file and rename so readers never see half a file.
pub async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

pub async fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Directory listing, `None` when the directory does not exist yet.
pub async fn read_dir_optional(path: &Path) -> std::io::Result<Option<tokio::fs::ReadDir>> {
    match tokio::fs::read_dir(path).await {
        Ok(entries) => Ok(Some(entries)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn remove_optional(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
