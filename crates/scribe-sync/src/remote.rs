//! RemoteStore trait abstraction over the remote file backend.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing
//! - `DirRemote` (in scribe-daemon) - A local directory via tokio::fs
//!
//! Concrete network backends (cloud document stores) implement the same
//! surface; the engine only ever talks to this trait, and only through the
//! request queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Remote credentials expired")]
    AuthExpired,

    #[error("Remote store not configured: {0}")]
    NotConfigured(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// One child entry of a remote folder listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Opaque backend identifier.
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

/// The remote file/document backend the engine synchronizes against.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether the backend has everything it needs to serve calls.
    /// Sync aborts before any network call when this is false.
    fn is_configured(&self) -> bool {
        true
    }

    /// List the children of a folder.
    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>>;

    /// Fetch one document's content.
    async fn get_document(&self, id: &str) -> Result<String>;

    /// Fetch several documents in one call.
    ///
    /// Ids missing from the returned map are per-item failures; callers log
    /// and skip them rather than failing the whole batch.
    async fn get_documents_bulk(&self, ids: &[String]) -> Result<HashMap<String, String>>;

    /// Create a folder and return its id. `None` parent means the root.
    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String>;

    /// Create or overwrite a document by name under a parent (idempotent
    /// upsert). Returns the document id.
    async fn put_document(&self, name: &str, parent_id: &str, content: &str) -> Result<String>;

    /// Rename a folder or document in place.
    async fn rename_entity(&self, id: &str, new_name: &str) -> Result<()>;

    /// Delete a folder (recursively) or document.
    async fn delete_entity(&self, id: &str) -> Result<()>;

    /// Find the well-known top-level notes folder by name, creating it if
    /// absent. Idempotent.
    async fn find_or_create_root(&self, name: &str) -> Result<String>;

    /// Re-establish credentials after an `AuthExpired` failure.
    async fn reauthenticate(&self) -> Result<()>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    fn is_configured(&self) -> bool {
        (**self).is_configured()
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>> {
        (**self).list_children(folder_id).await
    }

    async fn get_document(&self, id: &str) -> Result<String> {
        (**self).get_document(id).await
    }

    async fn get_documents_bulk(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        (**self).get_documents_bulk(ids).await
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        (**self).create_folder(name, parent_id).await
    }

    async fn put_document(&self, name: &str, parent_id: &str, content: &str) -> Result<String> {
        (**self).put_document(name, parent_id, content).await
    }

    async fn rename_entity(&self, id: &str, new_name: &str) -> Result<()> {
        (**self).rename_entity(id, new_name).await
    }

    async fn delete_entity(&self, id: &str) -> Result<()> {
        (**self).delete_entity(id).await
    }

    async fn find_or_create_root(&self, name: &str) -> Result<String> {
        (**self).find_or_create_root(name).await
    }

    async fn reauthenticate(&self) -> Result<()> {
        (**self).reauthenticate().await
    }
}

pub use in_memory::{CallCounts, InMemoryRemote};

mod in_memory {
    use super::*;
    use crate::model::now_ms;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct RemoteNode {
        name: String,
        parent: Option<String>,
        is_folder: bool,
        content: String,
        created_at: u64,
        updated_at: u64,
    }

    /// Per-method call counters, for asserting how much remote traffic an
    /// operation produced.
    #[derive(Debug, Default, Clone, PartialEq)]
    pub struct CallCounts {
        pub list_children: usize,
        pub get_document: usize,
        pub get_documents_bulk: usize,
        pub find_or_create_root: usize,
        pub mutations: usize,
        pub reauthenticate: usize,
    }

    /// In-memory remote store for testing.
    pub struct InMemoryRemote {
        nodes: Mutex<HashMap<String, RemoteNode>>,
        next_id: AtomicU64,
        list_calls: AtomicUsize,
        get_calls: AtomicUsize,
        bulk_calls: AtomicUsize,
        root_calls: AtomicUsize,
        mutation_calls: AtomicUsize,
        reauth_calls: AtomicUsize,
        /// Number of upcoming listing calls that fail with `AuthExpired`.
        auth_failures: AtomicUsize,
        /// Number of upcoming bulk fetches that fail with `AuthExpired`.
        bulk_auth_failures: AtomicUsize,
        configured: bool,
    }

    impl InMemoryRemote {
        pub fn new() -> Self {
            Self {
                nodes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                list_calls: AtomicUsize::new(0),
                get_calls: AtomicUsize::new(0),
                bulk_calls: AtomicUsize::new(0),
                root_calls: AtomicUsize::new(0),
                mutation_calls: AtomicUsize::new(0),
                reauth_calls: AtomicUsize::new(0),
                auth_failures: AtomicUsize::new(0),
                bulk_auth_failures: AtomicUsize::new(0),
                configured: true,
            }
        }

        /// A remote that reports itself as not configured.
        pub fn unconfigured() -> Self {
            Self {
                configured: false,
                ..Self::new()
            }
        }

        fn fresh_id(&self, prefix: &str) -> String {
            format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::Relaxed))
        }

        /// Seed a top-level folder directly (test setup, not counted).
        pub fn seed_root(&self, name: &str) -> String {
            let id = self.fresh_id("f");
            self.nodes.lock().unwrap().insert(
                id.clone(),
                RemoteNode {
                    name: name.to_string(),
                    parent: None,
                    is_folder: true,
                    content: String::new(),
                    created_at: now_ms(),
                    updated_at: now_ms(),
                },
            );
            id
        }

        /// Add a folder under a parent (test setup, not counted).
        pub fn add_folder(&self, parent: &str, name: &str) -> String {
            let id = self.fresh_id("f");
            self.nodes.lock().unwrap().insert(
                id.clone(),
                RemoteNode {
                    name: name.to_string(),
                    parent: Some(parent.to_string()),
                    is_folder: true,
                    content: String::new(),
                    created_at: now_ms(),
                    updated_at: now_ms(),
                },
            );
            id
        }

        /// Add a document under a parent (test setup, not counted).
        pub fn add_document(&self, parent: &str, name: &str, content: &str) -> String {
            let id = self.fresh_id("d");
            self.nodes.lock().unwrap().insert(
                id.clone(),
                RemoteNode {
                    name: name.to_string(),
                    parent: Some(parent.to_string()),
                    is_folder: false,
                    content: content.to_string(),
                    created_at: now_ms(),
                    updated_at: now_ms(),
                },
            );
            id
        }

        /// Remove an entity directly (simulates remote-side deletion).
        pub fn remove_entity(&self, id: &str) {
            let mut nodes = self.nodes.lock().unwrap();
            nodes.remove(id);
            // Drop any orphaned descendants too.
            loop {
                let orphan: Option<String> = nodes
                    .iter()
                    .find(|(_, n)| {
                        n.parent.as_deref().is_some_and(|p| !nodes.contains_key(p))
                    })
                    .map(|(id, _)| id.clone());
                match orphan {
                    Some(id) => {
                        nodes.remove(&id);
                    }
                    None => break,
                }
            }
        }

        /// Overwrite a document's content directly (simulates remote edit).
        pub fn set_content(&self, id: &str, content: &str) {
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(node) = nodes.get_mut(id) {
                node.content = content.to_string();
                node.updated_at = now_ms();
            }
        }

        /// Make the next `n` listing calls fail with `AuthExpired`.
        pub fn fail_listings_with_auth(&self, n: usize) {
            self.auth_failures.store(n, Ordering::SeqCst);
        }

        /// Make the next `n` bulk fetches fail with `AuthExpired`.
        pub fn fail_bulk_fetches_with_auth(&self, n: usize) {
            self.bulk_auth_failures.store(n, Ordering::SeqCst);
        }

        pub fn calls(&self) -> CallCounts {
            CallCounts {
                list_children: self.list_calls.load(Ordering::SeqCst),
                get_document: self.get_calls.load(Ordering::SeqCst),
                get_documents_bulk: self.bulk_calls.load(Ordering::SeqCst),
                find_or_create_root: self.root_calls.load(Ordering::SeqCst),
                mutations: self.mutation_calls.load(Ordering::SeqCst),
                reauthenticate: self.reauth_calls.load(Ordering::SeqCst),
            }
        }

        fn consume_failure(counter: &AtomicUsize) -> Result<()> {
            let mut failures = counter.load(Ordering::SeqCst);
            while failures > 0 {
                match counter.compare_exchange(
                    failures,
                    failures - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return Err(RemoteError::AuthExpired),
                    Err(current) => failures = current,
                }
            }
            Ok(())
        }
    }

    impl Default for InMemoryRemote {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RemoteStore for InMemoryRemote {
        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Self::consume_failure(&self.auth_failures)?;
            let nodes = self.nodes.lock().unwrap();
            if !nodes.contains_key(folder_id) {
                return Err(RemoteError::NotFound(folder_id.to_string()));
            }
            Ok(nodes
                .iter()
                .filter(|(_, n)| n.parent.as_deref() == Some(folder_id))
                .map(|(id, n)| RemoteEntry {
                    id: id.clone(),
                    name: n.name.clone(),
                    is_folder: n.is_folder,
                    created_at: n.created_at,
                    updated_at: n.updated_at,
                })
                .collect())
        }

        async fn get_document(&self, id: &str) -> Result<String> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let nodes = self.nodes.lock().unwrap();
            nodes
                .get(id)
                .filter(|n| !n.is_folder)
                .map(|n| n.content.clone())
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))
        }

        async fn get_documents_bulk(&self, ids: &[String]) -> Result<HashMap<String, String>> {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            Self::consume_failure(&self.bulk_auth_failures)?;
            let nodes = self.nodes.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| {
                    nodes
                        .get(id)
                        .filter(|n| !n.is_folder)
                        .map(|n| (id.clone(), n.content.clone()))
                })
                .collect())
        }

        async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            let id = self.fresh_id("f");
            self.nodes.lock().unwrap().insert(
                id.clone(),
                RemoteNode {
                    name: name.to_string(),
                    parent: parent_id.map(String::from),
                    is_folder: true,
                    content: String::new(),
                    created_at: now_ms(),
                    updated_at: now_ms(),
                },
            );
            Ok(id)
        }

        async fn put_document(&self, name: &str, parent_id: &str, content: &str) -> Result<String> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            let mut nodes = self.nodes.lock().unwrap();
            let existing = nodes
                .iter()
                .find(|(_, n)| {
                    !n.is_folder && n.name == name && n.parent.as_deref() == Some(parent_id)
                })
                .map(|(id, _)| id.clone());
            if let Some(id) = existing {
                let node = nodes.get_mut(&id).unwrap();
                node.content = content.to_string();
                node.updated_at = now_ms();
                return Ok(id);
            }
            let id = self.fresh_id("d");
            nodes.insert(
                id.clone(),
                RemoteNode {
                    name: name.to_string(),
                    parent: Some(parent_id.to_string()),
                    is_folder: false,
                    content: content.to_string(),
                    created_at: now_ms(),
                    updated_at: now_ms(),
                },
            );
            Ok(id)
        }

        async fn rename_entity(&self, id: &str, new_name: &str) -> Result<()> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            node.name = new_name.to_string();
            node.updated_at = now_ms();
            Ok(())
        }

        async fn delete_entity(&self, id: &str) -> Result<()> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            let nodes = self.nodes.lock().unwrap();
            if !nodes.contains_key(id) {
                return Err(RemoteError::NotFound(id.to_string()));
            }
            drop(nodes);
            self.remove_entity(id);
            Ok(())
        }

        async fn find_or_create_root(&self, name: &str) -> Result<String> {
            self.root_calls.fetch_add(1, Ordering::SeqCst);
            {
                let nodes = self.nodes.lock().unwrap();
                if let Some((id, _)) = nodes
                    .iter()
                    .find(|(_, n)| n.is_folder && n.parent.is_none() && n.name == name)
                {
                    return Ok(id.clone());
                }
            }
            Ok(self.seed_root(name))
        }

        async fn reauthenticate(&self) -> Result<()> {
            self.reauth_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
