//! scribe-sync: Sync and caching engine for a notes workspace backed by a
//! remote document store.
//!
//! This crate provides the core functionality for:
//! - Persistent, versioned, TTL-bounded caching of remote listings and content
//! - Rate-limited request queueing toward the remote backend
//! - Reconciling the remote folder tree into stable-identity local state
//! - Progressive note loading (structural pass, then batched content)
//! - Drift recovery (forced resync, full rebuild)
//! - RemoteStore trait abstraction over the remote backend

pub mod cache;
pub mod config;
pub mod drift;
pub mod engine;
pub mod envelope;
pub mod events;
pub mod model;
pub mod queue;
pub mod remote;
pub mod workspace;

pub use cache::{Cache, CacheStore, FileStore, MemoryStore, SCHEMA_VERSION};
pub use config::SyncConfig;
pub use engine::{EngineError, Progress, SyncEngine, SyncPhase};
pub use events::{EventBus, Subscription, SyncEvent};
pub use model::{Folder, FolderId, Note, NoteId};
pub use queue::RequestQueue;
pub use remote::{InMemoryRemote, RemoteEntry, RemoteError, RemoteStore};
pub use workspace::Workspace;
