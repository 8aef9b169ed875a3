//! The sync engine: a full structural walk of the remote tree followed by a
//! detached progressive content pass.
//!
//! The structural pass lists folders breadth-first through the request queue,
//! folds each listing into the workspace, and collects a plan of every note
//! to load. It prunes entities whose remote counterpart vanished, then hands
//! the plan to the content pass, which runs in a spawned task so callers see
//! a complete folder tree immediately while note bodies stream in batches.
//!
//! Both passes read through the persistent caches, so a sync within the TTL
//! touches the remote zero times.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{content_key, listing_key, Cache, CacheStore};
use crate::config::SyncConfig;
use crate::events::{EventBus, SyncEvent};
use crate::model::{FolderId, NoteId};
use crate::queue::{QueueError, RequestQueue};
use crate::remote::{RemoteEntry, RemoteError, RemoteStore};
use crate::workspace::{NoteContent, Workspace, WorkspaceError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("A sync run is already in progress")]
    SyncInProgress,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Where a sync run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No run started yet.
    Idle,
    /// Walking the remote folder tree.
    Structural,
    /// Folder tree complete; note bodies streaming in.
    Content,
    /// The last run finished (successfully or not).
    Settled,
}

/// Point-in-time progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub notes_loaded: usize,
    pub notes_total: usize,
    pub content_pass_running: bool,
    /// True once at least one run has settled successfully.
    pub has_synced: bool,
}

/// One note discovered by the structural pass, awaiting content.
#[derive(Debug, Clone)]
struct NotePlan {
    remote_id: String,
    title: String,
    path: String,
    created_at: u64,
    updated_at: u64,
}

pub(crate) struct EngineInner<R> {
    pub(crate) remote: R,
    pub(crate) config: SyncConfig,
    pub(crate) workspace: Mutex<Workspace>,
    pub(crate) listings: Cache<Vec<RemoteEntry>>,
    pub(crate) contents: Cache<String>,
    pub(crate) queue: RequestQueue,
    pub(crate) events: Arc<EventBus>,
    phase: watch::Sender<SyncPhase>,
    /// Remote ids with a content fetch already underway; a batch claims its
    /// ids before fetching and releases them after folding.
    in_flight: Mutex<HashSet<String>>,
    /// Guards against overlapping runs; an engine runs one sync at a time.
    sync_running: AtomicBool,
    /// Outcome of the last settled run. The content pass runs detached, so
    /// its failure is parked here for callers that await settlement.
    pub(crate) last_error: Mutex<Option<EngineError>>,
    notes_loaded: AtomicUsize,
    notes_total: AtomicUsize,
    content_pass_running: AtomicBool,
    pub(crate) has_synced: AtomicBool,
}

/// Handle to the sync engine. Cheap to clone; clones share all state.
pub struct SyncEngine<R: RemoteStore> {
    pub(crate) inner: Arc<EngineInner<R>>,
}

impl<R: RemoteStore> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteStore + 'static> SyncEngine<R> {
    pub fn new(remote: R, store: Arc<dyn CacheStore>, config: SyncConfig) -> Self {
        let listings = Cache::new(
            Arc::clone(&store),
            config.cache_ttl,
            config.max_entry_bytes,
            config.max_cache_bytes,
        );
        let contents = Cache::new(
            store,
            config.cache_ttl,
            config.max_entry_bytes,
            config.max_cache_bytes,
        );
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            inner: Arc::new(EngineInner {
                workspace: Mutex::new(Workspace::new(&config.root_folder_name)),
                queue: RequestQueue::new(config.concurrency_limit, config.request_delay),
                events: Arc::new(EventBus::new()),
                remote,
                config,
                listings,
                contents,
                phase,
                in_flight: Mutex::new(HashSet::new()),
                sync_running: AtomicBool::new(false),
                last_error: Mutex::new(None),
                notes_loaded: AtomicUsize::new(0),
                notes_total: AtomicUsize::new(0),
                content_pass_running: AtomicBool::new(false),
                has_synced: AtomicBool::new(false),
            }),
        }
    }

    /// The bus sync events are published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// A clone of the current workspace state.
    pub fn snapshot(&self) -> Workspace {
        self.inner.workspace.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            notes_loaded: self.inner.notes_loaded.load(Ordering::SeqCst),
            notes_total: self.inner.notes_total.load(Ordering::SeqCst),
            content_pass_running: self.inner.content_pass_running.load(Ordering::SeqCst),
            has_synced: self.inner.has_synced.load(Ordering::SeqCst),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    /// Wait until the current run settles. Returns immediately when no run
    /// is underway.
    pub async fn settled(&self) {
        if !self.inner.sync_running.load(Ordering::SeqCst) {
            return;
        }
        let mut rx = self.inner.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == SyncPhase::Settled).await;
    }

    /// Run a sync: structural pass inline, content pass detached.
    ///
    /// Returns once the folder tree is complete locally; use [`settled`]
    /// (or the event bus) to observe the content pass. A call while a run
    /// is already underway fails with [`EngineError::SyncInProgress`].
    ///
    /// [`settled`]: SyncEngine::settled
    pub async fn sync(&self) -> Result<()> {
        if !self.inner.remote.is_configured() {
            return Err(RemoteError::NotConfigured(
                "remote store missing configuration".to_string(),
            )
            .into());
        }
        if self
            .inner
            .sync_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync requested while a run is in progress");
            return Err(EngineError::SyncInProgress);
        }

        let _ = self.inner.phase.send(SyncPhase::Structural);
        self.inner.events.emit(SyncEvent::StructuralStarted);

        let plan = match self.structural_pass().await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("structural pass failed: {e}");
                // The caller receives the error directly; nothing is parked.
                *self.inner.last_error.lock().unwrap() = None;
                self.settle(Some(e.to_string()));
                return Err(e);
            }
        };

        self.inner.notes_total.store(plan.len(), Ordering::SeqCst);
        self.inner.notes_loaded.store(0, Ordering::SeqCst);
        let folders = self.inner.workspace.lock().unwrap().folders().len();
        self.inner.events.emit(SyncEvent::StructuralComplete {
            folders,
            notes_total: plan.len(),
        });

        let _ = self.inner.phase.send(SyncPhase::Content);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.content_pass(plan).await;
        });
        Ok(())
    }

    /// Walk the remote folder tree, fold listings, prune, and return the
    /// note plan for the content pass.
    async fn structural_pass(&self) -> Result<Vec<NotePlan>> {
        // Take the id out before matching so the workspace guard is dropped;
        // the miss arm locks the workspace again (and awaits).
        let known_root = {
            let workspace = self.inner.workspace.lock().unwrap();
            workspace.root_remote_id()
        };
        let root_remote_id = match known_root {
            Some(id) => id,
            None => {
                let inner = Arc::clone(&self.inner);
                let name = self.inner.config.root_folder_name.clone();
                let id = self
                    .inner
                    .queue
                    .submit(async move { inner.remote.find_or_create_root(&name).await })
                    .await??;
                self.inner
                    .workspace
                    .lock()
                    .unwrap()
                    .attach_root_remote_id(&id);
                id
            }
        };

        let mut worklist = vec![(FolderId::ROOT, root_remote_id.clone())];
        let mut plan = Vec::new();
        let mut seen_folders = HashSet::from([root_remote_id]);
        let mut seen_files = HashSet::new();

        while let Some((folder_id, remote_id)) = worklist.pop() {
            let entries = self.list_children_cached(&remote_id).await?;

            let folder_entries: Vec<RemoteEntry> = entries
                .iter()
                .filter(|e| e.is_folder && e.name != self.inner.config.attachments_dir)
                .cloned()
                .collect();

            let (children, folder_path) = {
                let mut workspace = self.inner.workspace.lock().unwrap();
                let children = workspace.fold_folder_listing(folder_id, &folder_entries)?;
                let path = workspace
                    .folder(folder_id)
                    .map(|f| f.path.clone())
                    .unwrap_or_default();
                (children, path)
            };

            for child in children {
                seen_folders.insert(child.remote_id.clone());
                worklist.push((child.folder_id, child.remote_id));
            }

            for entry in entries.iter().filter(|e| !e.is_folder) {
                let Some(title) = entry.name.strip_suffix(".md") else {
                    // Non-markdown files never become notes.
                    continue;
                };
                seen_files.insert(entry.id.clone());
                plan.push(NotePlan {
                    remote_id: entry.id.clone(),
                    title: title.to_string(),
                    path: folder_path.clone(),
                    created_at: entry.created_at,
                    updated_at: entry.updated_at,
                });
            }
        }

        let (folders_gone, notes_gone) = self
            .inner
            .workspace
            .lock()
            .unwrap()
            .prune_missing(&seen_folders, &seen_files);
        if folders_gone + notes_gone > 0 {
            info!("pruned {folders_gone} folders and {notes_gone} notes removed remotely");
        }

        Ok(plan)
    }

    /// Fetch note bodies in batches and fold them in, publishing progress.
    /// Per-batch failures are logged and skipped; the pass keeps going, and
    /// the first failure is parked for callers awaiting settlement.
    async fn content_pass(&self, plan: Vec<NotePlan>) {
        self.inner.content_pass_running.store(true, Ordering::SeqCst);
        let total = plan.len();
        let mut loaded = 0;
        let mut first_error: Option<EngineError> = None;

        let batches: Vec<&[NotePlan]> = plan.chunks(self.inner.config.batch_size.max(1)).collect();
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let claimed: Vec<&NotePlan> = {
                let mut in_flight = self.inner.in_flight.lock().unwrap();
                batch
                    .iter()
                    .filter(|note| in_flight.insert(note.remote_id.clone()))
                    .collect()
            };

            let mut folded = 0;
            if !claimed.is_empty() {
                match self.load_batch(&claimed).await {
                    Ok(count) => folded = count,
                    Err(e) => {
                        warn!("content batch failed, skipping: {e}");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
                let mut in_flight = self.inner.in_flight.lock().unwrap();
                for note in &claimed {
                    in_flight.remove(&note.remote_id);
                }
            }

            // Only notes actually folded move the counter; a failed batch
            // must not report progress it did not make.
            loaded = (loaded + folded).min(total);
            self.inner.notes_loaded.store(loaded, Ordering::SeqCst);
            self.inner
                .events
                .emit(SyncEvent::NotesLoaded { loaded, total });

            if index + 1 < batch_count && !self.inner.config.batch_delay.is_zero() {
                tokio::time::sleep(self.inner.config.batch_delay).await;
            }
        }

        self.inner.content_pass_running.store(false, Ordering::SeqCst);
        let message = first_error.as_ref().map(|e| e.to_string());
        if first_error.is_none() {
            self.inner.has_synced.store(true, Ordering::SeqCst);
        }
        *self.inner.last_error.lock().unwrap() = first_error;
        self.settle(message);
    }

    /// Resolve one batch of note bodies, cache-first, and fold them in.
    /// Returns how many notes were actually folded.
    async fn load_batch(&self, batch: &[&NotePlan]) -> Result<usize> {
        let mut resolved: Vec<(String, String)> = Vec::with_capacity(batch.len());
        let mut missing: Vec<String> = Vec::new();
        for note in batch {
            match self.inner.contents.get(&content_key(&note.remote_id)) {
                Some(content) => resolved.push((note.remote_id.clone(), content)),
                None => missing.push(note.remote_id.clone()),
            }
        }

        if !missing.is_empty() {
            let inner = Arc::clone(&self.inner);
            let ids = missing.clone();
            let fetched = self
                .inner
                .queue
                .submit(async move { inner.remote.get_documents_bulk(&ids).await })
                .await??;
            for id in &missing {
                match fetched.get(id) {
                    Some(content) => {
                        self.inner.contents.set(&content_key(id), content);
                        resolved.push((id.clone(), content.clone()));
                    }
                    None => warn!("document {id} missing from bulk fetch, skipping"),
                }
            }
        }

        let contents: Vec<NoteContent> = batch
            .iter()
            .filter_map(|note| {
                resolved
                    .iter()
                    .find(|(id, _)| *id == note.remote_id)
                    .map(|(_, content)| NoteContent {
                        remote_id: note.remote_id.clone(),
                        title: note.title.clone(),
                        path: note.path.clone(),
                        content: content.clone(),
                        created_at: note.created_at,
                        updated_at: note.updated_at,
                    })
            })
            .collect();

        let folded = contents.len();
        self.inner
            .workspace
            .lock()
            .unwrap()
            .fold_content_batch(&contents);
        Ok(folded)
    }

    /// Mark the run settled and publish the outcome.
    fn settle(&self, error: Option<String>) {
        self.inner.sync_running.store(false, Ordering::SeqCst);
        let _ = self.inner.phase.send(SyncPhase::Settled);
        self.inner.events.emit(SyncEvent::Settled { error });
    }

    /// Read a folder listing through the cache, fetching on a miss.
    pub(crate) async fn list_children_cached(&self, remote_id: &str) -> Result<Vec<RemoteEntry>> {
        let key = listing_key(remote_id);
        if let Some(entries) = self.inner.listings.get(&key) {
            return Ok(entries);
        }
        let inner = Arc::clone(&self.inner);
        let id = remote_id.to_string();
        let entries = self
            .inner
            .queue
            .submit(async move { inner.remote.list_children(&id).await })
            .await??;
        self.inner.listings.set(&key, &entries);
        Ok(entries)
    }
}

// Local mutation operations. Each applies locally first, then mirrors to the
// remote when the entity's remote linkage is known; entities created while
// their parent is still local-only converge through the reconciler's claim
// matching on a later sync.
impl<R: RemoteStore + 'static> SyncEngine<R> {
    /// Create a folder under `parent`.
    pub async fn create_folder(&self, parent: FolderId, name: &str) -> Result<FolderId> {
        let (id, parent_remote) = {
            let mut workspace = self.inner.workspace.lock().unwrap();
            let parent_remote = workspace
                .folder(parent)
                .ok_or(WorkspaceError::UnknownFolder(parent))?
                .remote_folder_id
                .clone();
            (workspace.create_folder(parent, name)?, parent_remote)
        };

        if let Some(parent_remote) = parent_remote {
            let inner = Arc::clone(&self.inner);
            let name = name.to_string();
            let parent_id = parent_remote.clone();
            let remote_id = self
                .inner
                .queue
                .submit(async move {
                    inner
                        .remote
                        .create_folder(&name, Some(parent_id.as_str()))
                        .await
                })
                .await??;
            self.inner
                .workspace
                .lock()
                .unwrap()
                .set_folder_remote_id(id, &remote_id);
            self.inner.listings.invalidate(&listing_key(&parent_remote));
        }
        Ok(id)
    }

    /// Create a note in `folder` and push it to the remote.
    pub async fn create_note(
        &self,
        folder: FolderId,
        title: &str,
        content: &str,
    ) -> Result<NoteId> {
        let (id, folder_remote) = {
            let mut workspace = self.inner.workspace.lock().unwrap();
            let folder_remote = workspace
                .folder(folder)
                .ok_or(WorkspaceError::UnknownFolder(folder))?
                .remote_folder_id
                .clone();
            (workspace.create_note(folder, title, content)?, folder_remote)
        };

        if let Some(folder_remote) = folder_remote {
            let remote_id = self
                .put_document_queued(&format!("{title}.md"), &folder_remote, content)
                .await?;
            self.inner
                .workspace
                .lock()
                .unwrap()
                .set_note_remote_id(id, &remote_id);
            self.inner.contents.set(&content_key(&remote_id), &content.to_string());
            self.inner.listings.invalidate(&listing_key(&folder_remote));
        }
        Ok(id)
    }

    /// Update a note's content.
    pub async fn save_note(&self, id: NoteId, content: &str) -> Result<()> {
        let remote_target = {
            let mut workspace = self.inner.workspace.lock().unwrap();
            workspace.update_note_content(id, content)?;
            let note = workspace.note(id).ok_or(WorkspaceError::UnknownNote(id))?;
            match (&note.remote_file_id, workspace.folder_by_path(&note.path)) {
                (Some(remote_id), Some(folder)) => folder
                    .remote_folder_id
                    .clone()
                    .map(|parent| (remote_id.clone(), note.title.clone(), parent)),
                _ => None,
            }
        };

        if let Some((remote_id, title, parent_remote)) = remote_target {
            self.put_document_queued(&format!("{title}.md"), &parent_remote, content)
                .await?;
            self.inner
                .contents
                .set(&content_key(&remote_id), &content.to_string());
        }
        Ok(())
    }

    /// Rename a note.
    pub async fn rename_note(&self, id: NoteId, new_title: &str) -> Result<()> {
        let remote_id = {
            let mut workspace = self.inner.workspace.lock().unwrap();
            workspace.rename_note(id, new_title)?;
            workspace
                .note(id)
                .and_then(|n| n.remote_file_id.clone())
        };

        if let Some(remote_id) = remote_id {
            let inner = Arc::clone(&self.inner);
            let name = format!("{new_title}.md");
            let id = remote_id.clone();
            self.inner
                .queue
                .submit(async move { inner.remote.rename_entity(&id, &name).await })
                .await??;
            self.invalidate_parent_listing_of_note(&remote_id);
        }
        Ok(())
    }

    /// Rename a folder, re-pathing everything beneath it locally.
    pub async fn rename_folder(&self, id: FolderId, new_name: &str) -> Result<()> {
        let remote_id = {
            let mut workspace = self.inner.workspace.lock().unwrap();
            workspace.rename_folder(id, new_name)?;
            workspace
                .folder(id)
                .and_then(|f| f.remote_folder_id.clone())
        };

        if let Some(remote_id) = remote_id {
            let inner = Arc::clone(&self.inner);
            let name = new_name.to_string();
            let target = remote_id.clone();
            self.inner
                .queue
                .submit(async move { inner.remote.rename_entity(&target, &name).await })
                .await??;
        }
        Ok(())
    }

    /// Delete a note locally and remotely.
    pub async fn delete_note(&self, id: NoteId) -> Result<()> {
        let removed = self
            .inner
            .workspace
            .lock()
            .unwrap()
            .remove_note(id)
            .ok_or(WorkspaceError::UnknownNote(id))?;

        if let Some(remote_id) = removed.remote_file_id {
            let inner = Arc::clone(&self.inner);
            let target = remote_id.clone();
            self.inner
                .queue
                .submit(async move { inner.remote.delete_entity(&target).await })
                .await??;
            self.inner.contents.invalidate(&content_key(&remote_id));
            self.invalidate_parent_listing_of_note(&remote_id);
        }
        Ok(())
    }

    /// Delete a folder and its whole subtree, locally and remotely.
    pub async fn delete_folder(&self, id: FolderId) -> Result<()> {
        let removed = self
            .inner
            .workspace
            .lock()
            .unwrap()
            .remove_folder_tree(id)
            .ok_or(WorkspaceError::UnknownFolder(id))?;

        if let Some(remote_id) = removed.remote_folder_id {
            let inner = Arc::clone(&self.inner);
            let target = remote_id.clone();
            self.inner
                .queue
                .submit(async move { inner.remote.delete_entity(&target).await })
                .await??;
            self.inner.listings.invalidate(&listing_key(&remote_id));
        }
        Ok(())
    }

    /// Periodic cache maintenance; see [`Cache::cleanup`].
    pub fn cleanup_cache(&self) {
        self.inner.listings.cleanup();
    }

    async fn put_document_queued(
        &self,
        name: &str,
        parent_remote: &str,
        content: &str,
    ) -> Result<String> {
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        let parent = parent_remote.to_string();
        let content = content.to_string();
        Ok(self
            .inner
            .queue
            .submit(async move { inner.remote.put_document(&name, &parent, &content).await })
            .await??)
    }

    /// Drop the cached listing of the folder containing a note, found by the
    /// note's remote id. Keeps listings honest after note-level mutations.
    fn invalidate_parent_listing_of_note(&self, note_remote_id: &str) {
        let parent_remote = {
            let workspace = self.inner.workspace.lock().unwrap();
            workspace
                .note_by_remote_id(note_remote_id)
                .and_then(|note| workspace.folder_by_path(&note.path))
                .and_then(|folder| folder.remote_folder_id.clone())
        };
        match parent_remote {
            Some(id) => self.inner.listings.invalidate(&listing_key(&id)),
            // The note is already gone locally; drop every listing rather
            // than guess which folder held it.
            None => self.inner.listings.invalidate_prefix("listing:"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::envelope::LOCKED_PLACEHOLDER;
    use crate::remote::InMemoryRemote;
    use std::time::Duration;

    fn engine_with(
        remote: Arc<InMemoryRemote>,
        config: SyncConfig,
    ) -> SyncEngine<Arc<InMemoryRemote>> {
        SyncEngine::new(remote, Arc::new(MemoryStore::new()), config)
    }

    async fn sync_to_settled(engine: &SyncEngine<Arc<InMemoryRemote>>) -> Result<()> {
        engine.sync().await?;
        engine.settled().await;
        Ok(())
    }

    fn seeded_remote() -> (Arc<InMemoryRemote>, String) {
        let remote = Arc::new(InMemoryRemote::new());
        let root = remote.seed_root("Notes");
        (remote, root)
    }

    #[tokio::test]
    async fn test_first_sync_settles_without_blocking() {
        let (remote, root) = seeded_remote();
        remote.add_document(&root, "Plan.md", "body");

        // First sync resolves the root remote id; the whole run must settle
        // promptly rather than wedge on internal locking.
        let engine = engine_with(remote, SyncConfig::immediate());
        tokio::time::timeout(Duration::from_secs(5), async {
            engine.sync().await.unwrap();
            engine.settled().await;
        })
        .await
        .expect("first sync must settle");

        assert_eq!(engine.snapshot().notes().len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_sync_is_rejected() {
        let (remote, root) = seeded_remote();
        for i in 0..11 {
            remote.add_document(&root, &format!("n{i}.md"), "body");
        }

        // Two batches with a long pause between them keep the run alive
        // well past the first sync() return.
        let config = SyncConfig {
            request_delay: Duration::ZERO,
            batch_delay: Duration::from_secs(1),
            ..SyncConfig::default()
        };
        let engine = engine_with(remote, config);
        engine.sync().await.unwrap();

        let err = engine.sync().await.unwrap_err();
        assert!(matches!(err, EngineError::SyncInProgress));

        engine.settled().await;
        assert_eq!(engine.snapshot().notes().len(), 11);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_advance_progress() {
        let (remote, root) = seeded_remote();
        remote.add_document(&root, "Plan.md", "body");
        remote.fail_bulk_fetches_with_auth(1);

        let engine = engine_with(Arc::clone(&remote), SyncConfig::immediate());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = engine.events().subscribe(move |event| {
            sink.lock().unwrap().push(event);
        });

        engine.sync().await.unwrap();
        engine.settled().await;

        // Nothing was folded, so nothing is reported as loaded.
        let progress = engine.progress();
        assert_eq!(progress.notes_loaded, 0);
        assert_eq!(progress.notes_total, 1);
        assert!(!progress.has_synced);
        assert!(engine.snapshot().notes().is_empty());
        assert!(matches!(
            seen.lock().unwrap().last(),
            Some(SyncEvent::Settled { error: Some(_) })
        ));

        // The next run recovers and reports honest progress.
        engine.sync().await.unwrap();
        engine.settled().await;
        let progress = engine.progress();
        assert_eq!(progress.notes_loaded, 1);
        assert!(progress.has_synced);
    }

    #[tokio::test]
    async fn test_sync_builds_full_tree() {
        let (remote, root) = seeded_remote();
        let work = remote.add_folder(&root, "Work");
        let plans = remote.add_folder(&work, "Plans");
        remote.add_document(&root, "Inbox.md", "inbox body");
        remote.add_document(&plans, "Roadmap.md", "roadmap body");

        let engine = engine_with(remote, SyncConfig::immediate());
        sync_to_settled(&engine).await.unwrap();

        let ws = engine.snapshot();
        assert!(ws.folder_by_path("Work").is_some());
        assert!(ws.folder_by_path("Work/Plans").is_some());
        let inbox = ws.notes().iter().find(|n| n.title == "Inbox").unwrap();
        assert_eq!(inbox.content, "inbox body");
        assert_eq!(inbox.path, "");
        let roadmap = ws.notes().iter().find(|n| n.title == "Roadmap").unwrap();
        assert_eq!(roadmap.path, "Work/Plans");
        assert!(engine.progress().has_synced);
    }

    #[tokio::test]
    async fn test_second_sync_within_ttl_touches_remote_zero_times() {
        let (remote, root) = seeded_remote();
        let work = remote.add_folder(&root, "Work");
        remote.add_document(&work, "Plan.md", "body");

        let engine = engine_with(Arc::clone(&remote), SyncConfig::immediate());
        sync_to_settled(&engine).await.unwrap();
        let after_first = remote.calls();

        sync_to_settled(&engine).await.unwrap();
        assert_eq!(remote.calls(), after_first, "second sync served from cache");

        // The tree is still fully populated.
        let ws = engine.snapshot();
        assert!(ws.folder_by_path("Work").is_some());
        assert_eq!(ws.notes().len(), 1);
    }

    #[tokio::test]
    async fn test_attachments_folder_and_non_markdown_skipped() {
        let (remote, root) = seeded_remote();
        let images = remote.add_folder(&root, "Images");
        remote.add_document(&images, "photo.png", "...");
        remote.add_document(&root, "diagram.png", "...");
        remote.add_document(&root, "Note.md", "text");

        let engine = engine_with(remote, SyncConfig::immediate());
        sync_to_settled(&engine).await.unwrap();

        let ws = engine.snapshot();
        assert!(ws.folder_by_path("Images").is_none());
        assert_eq!(ws.notes().len(), 1);
        assert_eq!(ws.notes()[0].title, "Note");
    }

    #[tokio::test]
    async fn test_encrypted_note_gets_placeholder() {
        let (remote, root) = seeded_remote();
        let envelope = serde_json::json!({
            "encrypted": true,
            "data": { "ciphertext": "00ff" }
        })
        .to_string();
        remote.add_document(&root, "Secret.md", &envelope);

        let engine = engine_with(remote, SyncConfig::immediate());
        sync_to_settled(&engine).await.unwrap();

        let ws = engine.snapshot();
        let note = ws.notes().iter().find(|n| n.title == "Secret").unwrap();
        assert!(note.is_encrypted);
        assert_eq!(note.content, LOCKED_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_content_fetched_in_batches() {
        let (remote, root) = seeded_remote();
        for i in 0..25 {
            remote.add_document(&root, &format!("n{i}.md"), "body");
        }

        let engine = engine_with(Arc::clone(&remote), SyncConfig::immediate());
        sync_to_settled(&engine).await.unwrap();

        // 25 notes at batch size 10 means three bulk calls.
        assert_eq!(remote.calls().get_documents_bulk, 3);
        assert_eq!(engine.snapshot().notes().len(), 25);
        let progress = engine.progress();
        assert_eq!(progress.notes_loaded, 25);
        assert_eq!(progress.notes_total, 25);
    }

    #[tokio::test]
    async fn test_progress_events_in_order() {
        let (remote, root) = seeded_remote();
        for i in 0..12 {
            remote.add_document(&root, &format!("n{i}.md"), "body");
        }

        let engine = engine_with(remote, SyncConfig::immediate());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = engine.events().subscribe(move |event| {
            sink.lock().unwrap().push(event);
        });

        sync_to_settled(&engine).await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], SyncEvent::StructuralStarted));
        assert!(matches!(
            seen[1],
            SyncEvent::StructuralComplete { notes_total: 12, .. }
        ));
        let loads: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                SyncEvent::NotesLoaded { loaded, total } => Some((*loaded, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(loads, vec![(10, 12), (12, 12)]);
        assert!(matches!(
            seen.last(),
            Some(SyncEvent::Settled { error: None })
        ));
    }

    #[tokio::test]
    async fn test_remote_deletion_pruned_when_cache_cold() {
        let (remote, root) = seeded_remote();
        let work = remote.add_folder(&root, "Work");
        let doc = remote.add_document(&root, "Gone.md", "body");

        // Zero TTL: every lookup misses, so the second sync sees fresh state.
        let config = SyncConfig {
            cache_ttl: Duration::ZERO,
            ..SyncConfig::immediate()
        };
        let engine = engine_with(Arc::clone(&remote), config);
        sync_to_settled(&engine).await.unwrap();
        assert_eq!(engine.snapshot().notes().len(), 1);

        remote.remove_entity(&doc);
        remote.remove_entity(&work);
        sync_to_settled(&engine).await.unwrap();

        let ws = engine.snapshot();
        assert!(ws.notes().is_empty());
        assert!(ws.folder_by_path("Work").is_none());
    }

    #[tokio::test]
    async fn test_local_note_pushed_to_remote() {
        let (remote, _root) = seeded_remote();
        let engine = engine_with(Arc::clone(&remote), SyncConfig::immediate());
        sync_to_settled(&engine).await.unwrap();

        let id = engine
            .create_note(FolderId::ROOT, "Draft", "first version")
            .await
            .unwrap();

        let ws = engine.snapshot();
        let remote_id = ws.note(id).unwrap().remote_file_id.clone().unwrap();
        assert_eq!(
            remote.get_document(&remote_id).await.unwrap(),
            "first version"
        );

        engine.save_note(id, "second version").await.unwrap();
        assert_eq!(
            remote.get_document(&remote_id).await.unwrap(),
            "second version"
        );
    }

    #[tokio::test]
    async fn test_local_folder_chain_created_remotely() {
        let (remote, _root) = seeded_remote();
        let engine = engine_with(Arc::clone(&remote), SyncConfig::immediate());
        sync_to_settled(&engine).await.unwrap();

        let work = engine.create_folder(FolderId::ROOT, "Work").await.unwrap();
        let plans = engine.create_folder(work, "Plans").await.unwrap();
        engine.create_note(plans, "Roadmap", "body").await.unwrap();

        let ws = engine.snapshot();
        assert!(ws.folder(plans).unwrap().remote_folder_id.is_some());
        let note = ws.notes().iter().find(|n| n.title == "Roadmap").unwrap();
        assert_eq!(note.path, "Work/Plans");
        assert!(note.remote_file_id.is_some());
    }

    #[tokio::test]
    async fn test_delete_note_removes_remote_copy() {
        let (remote, root) = seeded_remote();
        let doc = remote.add_document(&root, "Old.md", "body");

        let engine = engine_with(Arc::clone(&remote), SyncConfig::immediate());
        sync_to_settled(&engine).await.unwrap();

        let id = engine.snapshot().note_by_remote_id(&doc).unwrap().id;
        engine.delete_note(id).await.unwrap();

        assert!(engine.snapshot().notes().is_empty());
        assert!(matches!(
            remote.get_document(&doc).await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_remote_refuses_to_sync() {
        let remote = Arc::new(InMemoryRemote::unconfigured());
        let engine = engine_with(remote, SyncConfig::immediate());

        let err = engine.sync().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Remote(RemoteError::NotConfigured(_))
        ));
        assert_eq!(engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_local_only_note_claims_remote_twin_on_sync() {
        let (remote, root) = seeded_remote();
        remote.add_document(&root, "Shared.md", "remote body");

        let engine = engine_with(Arc::clone(&remote), SyncConfig::immediate());
        // Created before any sync: the root has no remote linkage yet, so
        // the note stays local-only.
        let id = engine
            .create_note(FolderId::ROOT, "Shared", "local body")
            .await
            .unwrap();
        assert!(engine.snapshot().note(id).unwrap().remote_file_id.is_none());

        sync_to_settled(&engine).await.unwrap();

        // The reconciler claimed the remote twin instead of duplicating,
        // keeping the local content.
        let ws = engine.snapshot();
        assert_eq!(ws.notes().len(), 1);
        let note = ws.note(id).unwrap();
        assert!(note.remote_file_id.is_some());
        assert_eq!(note.content, "local body");
    }
}
