use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::codec::{decode_rows, encode_rows};
use super::{WindowStore, is_window_key, window_key};
use crate::events::AircraftEvent;
use crate::window::ClosedWindow;

/// Window store backed by a local directory tree
///
/// Writes go to a hidden temp file that is renamed over the final path, so a
/// reader never sees a partially written batch and a re-emitted window simply
/// replaces the previous file.
#[derive(Debug, Clone)]
pub struct FsWindowStore {
    root: PathBuf,
    prefix: String,
}

impl FsWindowStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a key
    pub fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl WindowStore for FsWindowStore {
    async fn put_window(&self, window: &ClosedWindow) -> Result<String> {
        let key = window_key(&self.prefix, window.window_end());
        let final_path = self.path_for(&key);
        let events = window.events.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let payload = encode_rows(&events)?;

            let parent = final_path
                .parent()
                .context("Window path has no parent directory")?;
            fs::create_dir_all(parent).context(format!(
                "Failed to create window directory: {}",
                parent.display()
            ))?;

            let file_name = final_path
                .file_name()
                .and_then(|name| name.to_str())
                .context("Window path has no file name")?;
            let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

            fs::write(&temp_path, &payload)
                .context(format!("Failed to write {}", temp_path.display()))?;
            fs::rename(&temp_path, &final_path).context(format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                final_path.display()
            ))?;

            debug!(
                "Wrote {} bytes to {}",
                payload.len(),
                final_path.display()
            );
            Ok(())
        })
        .await??;

        info!(
            "Stored window ending {} ({} events) at {}",
            window.window_end(),
            window.event_count(),
            key
        );
        Ok(key)
    }

    async fn list_window_keys(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = self.prefix.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let base = if prefix.is_empty() {
                root.clone()
            } else {
                prefix.split('/').fold(root.clone(), |p, s| p.join(s))
            };
            if !base.exists() {
                return Ok(Vec::new());
            }

            let mut keys = Vec::new();
            collect_files(&root, &base, &mut keys)?;
            keys.retain(|key| is_window_key(&prefix, key));
            keys.sort();
            Ok(keys)
        })
        .await?
    }

    async fn get_window(&self, key: &str) -> Result<Vec<AircraftEvent>> {
        let path = self.path_for(key);
        let bytes = tokio::fs::read(&path)
            .await
            .context(format!("Failed to read window batch {}", path.display()))?;
        tokio::task::spawn_blocking(move || decode_rows(&bytes)).await?
    }

    fn describe(&self) -> String {
        if self.prefix.is_empty() {
            self.root.display().to_string()
        } else {
            format!("{}/{}", self.root.display(), self.prefix)
        }
    }
}

/// Recursively collect files under `dir` as '/'-separated keys relative to `root`
fn collect_files(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir).context(format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, keys)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }
    Ok(())
}
