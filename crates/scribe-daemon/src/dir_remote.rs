//! RemoteStore implementation over a local directory using tokio::fs.
//!
//! Entity ids are slash-joined paths relative to the base directory. They
//! are cheap and human-readable but not stable across renames: after a
//! rename the entity surfaces under a new id and the reconciler's claim
//! matching re-links it on the next sync.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

use scribe_sync::remote::{RemoteEntry, RemoteError, RemoteStore, Result};

/// A notes "remote" backed by a directory tree.
pub struct DirRemote {
    base_path: PathBuf,
}

impl DirRemote {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, id: &str) -> PathBuf {
        if id.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(id)
        }
    }

    fn child_id(parent_id: &str, name: &str) -> String {
        if parent_id.is_empty() {
            name.to_string()
        } else {
            format!("{parent_id}/{name}")
        }
    }

    fn io_err(e: std::io::Error, id: &str) -> RemoteError {
        if e.kind() == std::io::ErrorKind::NotFound {
            RemoteError::NotFound(id.to_string())
        } else {
            RemoteError::Unavailable(e.to_string())
        }
    }
}

fn system_time_ms(time: std::io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl RemoteStore for DirRemote {
    fn is_configured(&self) -> bool {
        self.base_path.is_dir()
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>> {
        let full = self.full_path(folder_id);
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full)
            .await
            .map_err(|e| Self::io_err(e, folder_id))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Self::io_err(e, folder_id))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            // Dotfiles (including the cache directory) are not content.
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| Self::io_err(e, folder_id))?;
            entries.push(RemoteEntry {
                id: Self::child_id(folder_id, &name),
                name,
                is_folder: metadata.is_dir(),
                created_at: system_time_ms(metadata.created()),
                updated_at: system_time_ms(metadata.modified()),
            });
        }
        Ok(entries)
    }

    async fn get_document(&self, id: &str) -> Result<String> {
        fs::read_to_string(self.full_path(id))
            .await
            .map_err(|e| Self::io_err(e, id))
    }

    async fn get_documents_bulk(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let mut contents = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.get_document(id).await {
                Ok(content) => {
                    contents.insert(id.clone(), content);
                }
                Err(e) => {
                    tracing::warn!("skipping unreadable document {id}: {e}");
                }
            }
        }
        Ok(contents)
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        let id = Self::child_id(parent_id.unwrap_or(""), name);
        fs::create_dir_all(self.full_path(&id))
            .await
            .map_err(|e| Self::io_err(e, &id))?;
        Ok(id)
    }

    async fn put_document(&self, name: &str, parent_id: &str, content: &str) -> Result<String> {
        let id = Self::child_id(parent_id, name);
        let full = self.full_path(&id);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(e, &id))?;
        }
        fs::write(&full, content)
            .await
            .map_err(|e| Self::io_err(e, &id))?;
        Ok(id)
    }

    async fn rename_entity(&self, id: &str, new_name: &str) -> Result<()> {
        let full = self.full_path(id);
        let target = full
            .parent()
            .unwrap_or(Path::new(""))
            .join(new_name);
        fs::rename(&full, &target)
            .await
            .map_err(|e| Self::io_err(e, id))
    }

    async fn delete_entity(&self, id: &str) -> Result<()> {
        let full = self.full_path(id);
        let metadata = fs::metadata(&full).await.map_err(|e| Self::io_err(e, id))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&full)
                .await
                .map_err(|e| Self::io_err(e, id))
        } else {
            fs::remove_file(&full)
                .await
                .map_err(|e| Self::io_err(e, id))
        }
    }

    async fn find_or_create_root(&self, name: &str) -> Result<String> {
        fs::create_dir_all(self.base_path.join(name))
            .await
            .map_err(|e| Self::io_err(e, name))?;
        Ok(name.to_string())
    }

    // A directory has no credentials to refresh.
    async fn reauthenticate(&self) -> Result<()> {
        Ok(())
    }
}
