//! Workspace: the authoritative local Note/Folder collections and the fold
//! operations that merge remote state into them.
//!
//! Identity matching is three-tiered, for folders and notes alike:
//!
//! 1. By attached remote id - the entity is already known; update in place.
//! 2. By (name, path) with no remote id yet - a local-only entity matches the
//!    remote one; claim it by attaching the remote id. This is how a folder
//!    created offline and the same folder discovered remotely converge into a
//!    single record instead of a duplicate.
//! 3. No match - create a fresh local entity with a new local id.
//!
//! All mutation of the collections goes through these methods; the engine
//! serializes calls behind a single lock, which makes each fold atomic with
//! respect to the collections (including descendant re-pathing on rename).

use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

use crate::envelope::{EncryptedEnvelope, LOCKED_PLACEHOLDER};
use crate::model::{join_path, now_ms, Folder, FolderId, Note, NoteId};
use crate::remote::RemoteEntry;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Unknown folder: {0}")]
    UnknownFolder(FolderId),

    #[error("Unknown note: {0}")]
    UnknownNote(NoteId),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// A child folder to recurse into after a fold.
#[derive(Debug, Clone)]
pub struct FolderChild {
    pub folder_id: FolderId,
    pub remote_id: String,
    pub path: String,
}

/// Fetched content for one note, ready to fold.
#[derive(Debug, Clone)]
pub struct NoteContent {
    pub remote_id: String,
    pub title: String,
    /// Path of the containing folder.
    pub path: String,
    pub content: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// The local note tree. Always contains the root folder.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Workspace {
    folders: Vec<Folder>,
    notes: Vec<Note>,
}

impl Workspace {
    pub fn new(root_name: &str) -> Self {
        Self {
            folders: vec![Folder {
                id: FolderId::ROOT,
                name: root_name.to_string(),
                path: String::new(),
                parent_id: None,
                remote_folder_id: None,
                expanded: true,
            }],
            notes: Vec::new(),
        }
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn folder(&self, id: FolderId) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == id)
    }

    pub fn note(&self, id: NoteId) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn folder_by_path(&self, path: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.path == path)
    }

    pub fn note_by_remote_id(&self, remote_id: &str) -> Option<&Note> {
        self.notes
            .iter()
            .find(|n| n.remote_file_id.as_deref() == Some(remote_id))
    }

    pub fn root_remote_id(&self) -> Option<String> {
        self.folder(FolderId::ROOT)
            .and_then(|f| f.remote_folder_id.clone())
    }

    /// Attach the remote id of the well-known root folder, if not set yet.
    pub fn attach_root_remote_id(&mut self, remote_id: &str) {
        if let Some(root) = self.folders.iter_mut().find(|f| f.id == FolderId::ROOT) {
            if root.remote_folder_id.is_none() {
                root.remote_folder_id = Some(remote_id.to_string());
            }
        }
    }

    /// Create a folder from local user action. No remote id yet.
    pub fn create_folder(&mut self, parent: FolderId, name: &str) -> Result<FolderId> {
        let parent_path = self
            .folder(parent)
            .ok_or(WorkspaceError::UnknownFolder(parent))?
            .path
            .clone();
        let folder = Folder {
            id: FolderId::fresh(),
            name: name.to_string(),
            path: join_path(&parent_path, name),
            parent_id: Some(parent),
            remote_folder_id: None,
            expanded: false,
        };
        let id = folder.id;
        self.folders.push(folder);
        Ok(id)
    }

    /// Create a note from local user action. No remote id yet.
    pub fn create_note(&mut self, folder: FolderId, title: &str, content: &str) -> Result<NoteId> {
        let path = self
            .folder(folder)
            .ok_or(WorkspaceError::UnknownFolder(folder))?
            .path
            .clone();
        let now = now_ms();
        let note = Note {
            id: NoteId::fresh(),
            title: title.to_string(),
            content: content.to_string(),
            path,
            remote_file_id: None,
            created_at: now,
            updated_at: now,
            is_encrypted: false,
            encrypted_payload: None,
        };
        let id = note.id;
        self.notes.push(note);
        Ok(id)
    }

    /// Merge one remote folder listing (folder entries only) into the tree.
    ///
    /// Returns the children to recurse into, with their paths as of this
    /// fold. Callers filter out non-folder entries and skipped folders before
    /// calling.
    pub fn fold_folder_listing(
        &mut self,
        parent: FolderId,
        entries: &[RemoteEntry],
    ) -> Result<Vec<FolderChild>> {
        let parent_path = self
            .folder(parent)
            .ok_or(WorkspaceError::UnknownFolder(parent))?
            .path
            .clone();

        let mut children = Vec::with_capacity(entries.len());
        for entry in entries.iter().filter(|e| e.is_folder) {
            let folder_id = self.fold_one_folder(parent, &parent_path, entry);
            if let Some(folder) = self.folder(folder_id) {
                children.push(FolderChild {
                    folder_id,
                    remote_id: entry.id.clone(),
                    path: folder.path.clone(),
                });
            }
        }
        Ok(children)
    }

    fn fold_one_folder(
        &mut self,
        parent: FolderId,
        parent_path: &str,
        entry: &RemoteEntry,
    ) -> FolderId {
        let entry_path = join_path(parent_path, &entry.name);

        // Tier 1: known by remote id. Handle renames, re-pathing descendants.
        if let Some(pos) = self
            .folders
            .iter()
            .position(|f| f.remote_folder_id.as_deref() == Some(&entry.id))
        {
            let (id, old_path) = (self.folders[pos].id, self.folders[pos].path.clone());
            if self.folders[pos].name != entry.name {
                debug!("folder {id} renamed remotely: {old_path} -> {entry_path}");
                self.folders[pos].name = entry.name.clone();
                self.folders[pos].path = entry_path.clone();
                self.repath_descendants(&old_path, &entry_path);
            }
            return id;
        }

        // Tier 2: a local-only folder at the same spot claims the remote id.
        if let Some(folder) = self.folders.iter_mut().find(|f| {
            f.remote_folder_id.is_none() && f.name == entry.name && f.path == entry_path
        }) {
            folder.remote_folder_id = Some(entry.id.clone());
            return folder.id;
        }

        // Tier 3: genuinely new.
        let folder = Folder {
            id: FolderId::fresh(),
            name: entry.name.clone(),
            path: entry_path,
            parent_id: Some(parent),
            remote_folder_id: Some(entry.id.clone()),
            expanded: false,
        };
        let id = folder.id;
        self.folders.push(folder);
        id
    }

    /// Rewrite paths under a renamed folder, for folders and notes alike.
    fn repath_descendants(&mut self, old_path: &str, new_path: &str) {
        let old_prefix = format!("{old_path}/");
        for folder in &mut self.folders {
            if let Some(rest) = folder.path.strip_prefix(&old_prefix) {
                folder.path = format!("{new_path}/{rest}");
            }
        }
        for note in &mut self.notes {
            if note.path == old_path {
                note.path = new_path.to_string();
            } else if let Some(rest) = note.path.strip_prefix(&old_prefix) {
                note.path = format!("{new_path}/{rest}");
            }
        }
    }

    /// Merge a batch of fetched note contents.
    ///
    /// An existing note is only rewritten when a tracked field actually
    /// differs from the incoming value, so an unchanged remote tree folds to
    /// a no-op and triggers nothing downstream.
    pub fn fold_content_batch(&mut self, batch: &[NoteContent]) {
        for incoming in batch {
            let (content, is_encrypted, encrypted_payload) =
                match EncryptedEnvelope::parse(&incoming.content) {
                    Some(envelope) => (LOCKED_PLACEHOLDER.to_string(), true, Some(envelope.data)),
                    None => (incoming.content.clone(), false, None),
                };

            // Tier 1: known by remote id.
            if let Some(note) = self
                .notes
                .iter_mut()
                .find(|n| n.remote_file_id.as_deref() == Some(&incoming.remote_id))
            {
                let changed = note.content != content
                    || note.title != incoming.title
                    || note.is_encrypted != is_encrypted;
                if changed {
                    note.title = incoming.title.clone();
                    note.content = content;
                    note.updated_at = incoming.updated_at;
                    note.is_encrypted = is_encrypted;
                    note.encrypted_payload = encrypted_payload;
                }
                continue;
            }

            // Tier 2: a local-only note with the same title and path claims
            // the remote id but keeps its local content until the next pass.
            if let Some(note) = self.notes.iter_mut().find(|n| {
                n.remote_file_id.is_none()
                    && n.title == incoming.title
                    && n.path == incoming.path
            }) {
                note.remote_file_id = Some(incoming.remote_id.clone());
                continue;
            }

            // Tier 3: genuinely new.
            self.notes.push(Note {
                id: NoteId::fresh(),
                title: incoming.title.clone(),
                content,
                path: incoming.path.clone(),
                remote_file_id: Some(incoming.remote_id.clone()),
                created_at: incoming.created_at,
                updated_at: incoming.updated_at,
                is_encrypted,
                encrypted_payload,
            });
        }
    }

    /// Drop local entities whose attached remote counterpart vanished.
    ///
    /// Local-only entities (no remote id) and the root always survive.
    /// Returns (folders removed, notes removed).
    pub fn prune_missing(
        &mut self,
        remote_folder_ids: &HashSet<String>,
        remote_file_ids: &HashSet<String>,
    ) -> (usize, usize) {
        let folders_before = self.folders.len();
        self.folders.retain(|f| {
            f.id == FolderId::ROOT
                || match &f.remote_folder_id {
                    Some(remote_id) => remote_folder_ids.contains(remote_id),
                    None => true,
                }
        });

        let notes_before = self.notes.len();
        self.notes.retain(|n| match &n.remote_file_id {
            Some(remote_id) => remote_file_ids.contains(remote_id),
            None => true,
        });

        (
            folders_before - self.folders.len(),
            notes_before - self.notes.len(),
        )
    }

    /// Back to just the root folder, remote identity forgotten.
    pub fn reset(&mut self) {
        let root_name = self
            .folder(FolderId::ROOT)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| "Notes".to_string());
        *self = Self::new(&root_name);
    }

    // ---- mutation helpers for the engine's local operations ----

    pub(crate) fn set_note_remote_id(&mut self, id: NoteId, remote_id: &str) {
        if let Some(note) = self.notes.iter_mut().find(|n| n.id == id) {
            note.remote_file_id = Some(remote_id.to_string());
        }
    }

    pub(crate) fn set_folder_remote_id(&mut self, id: FolderId, remote_id: &str) {
        if let Some(folder) = self.folders.iter_mut().find(|f| f.id == id) {
            folder.remote_folder_id = Some(remote_id.to_string());
        }
    }

    pub(crate) fn update_note_content(&mut self, id: NoteId, content: &str) -> Result<()> {
        let note = self
            .notes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(WorkspaceError::UnknownNote(id))?;
        if note.content != content {
            note.content = content.to_string();
            note.updated_at = now_ms();
        }
        Ok(())
    }

    pub(crate) fn rename_note(&mut self, id: NoteId, new_title: &str) -> Result<()> {
        let note = self
            .notes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(WorkspaceError::UnknownNote(id))?;
        note.title = new_title.to_string();
        note.updated_at = now_ms();
        Ok(())
    }

    pub(crate) fn rename_folder(&mut self, id: FolderId, new_name: &str) -> Result<()> {
        let pos = self
            .folders
            .iter()
            .position(|f| f.id == id)
            .ok_or(WorkspaceError::UnknownFolder(id))?;
        let old_path = self.folders[pos].path.clone();
        let parent_path = match old_path.rfind('/') {
            Some(cut) => &old_path[..cut],
            None => "",
        };
        let new_path = join_path(parent_path, new_name);
        self.folders[pos].name = new_name.to_string();
        self.folders[pos].path = new_path.clone();
        self.repath_descendants(&old_path, &new_path);
        Ok(())
    }

    pub(crate) fn remove_note(&mut self, id: NoteId) -> Option<Note> {
        let pos = self.notes.iter().position(|n| n.id == id)?;
        Some(self.notes.remove(pos))
    }

    /// Remove a folder and everything beneath it. Returns the removed folder.
    pub(crate) fn remove_folder_tree(&mut self, id: FolderId) -> Option<Folder> {
        if id == FolderId::ROOT {
            return None;
        }
        let pos = self.folders.iter().position(|f| f.id == id)?;
        let folder = self.folders.remove(pos);
        let prefix = format!("{}/", folder.path);
        self.folders.retain(|f| !f.path.starts_with(&prefix));
        self.notes
            .retain(|n| n.path != folder.path && !n.path.starts_with(&prefix));
        Some(folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_entry(id: &str, name: &str) -> RemoteEntry {
        RemoteEntry {
            id: id.to_string(),
            name: name.to_string(),
            is_folder: true,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    fn content(remote_id: &str, title: &str, path: &str, body: &str) -> NoteContent {
        NoteContent {
            remote_id: remote_id.to_string(),
            title: title.to_string(),
            path: path.to_string(),
            content: body.to_string(),
            created_at: 1_000,
            updated_at: 2_000,
        }
    }

    #[test]
    fn test_fold_creates_new_folders() {
        let mut ws = Workspace::new("Notes");
        let children = ws
            .fold_folder_listing(FolderId::ROOT, &[folder_entry("F1", "Work")])
            .unwrap();

        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path, "Work");
        let work = ws.folder(children[0].folder_id).unwrap();
        assert_eq!(work.name, "Work");
        assert_eq!(work.remote_folder_id.as_deref(), Some("F1"));
        assert_eq!(work.parent_id, Some(FolderId::ROOT));
    }

    #[test]
    fn test_fold_is_idempotent() {
        let mut ws = Workspace::new("Notes");
        let entries = [folder_entry("F1", "Work"), folder_entry("F2", "Home")];
        ws.fold_folder_listing(FolderId::ROOT, &entries).unwrap();
        let before = ws.clone();
        ws.fold_folder_listing(FolderId::ROOT, &entries).unwrap();

        assert_eq!(ws.folders().len(), 3); // root + 2
        assert_eq!(
            serde_json::to_value(&ws).unwrap(),
            serde_json::to_value(&before).unwrap()
        );
    }

    #[test]
    fn test_local_only_folder_is_claimed_not_duplicated() {
        let mut ws = Workspace::new("Notes");
        let a = ws
            .fold_folder_listing(FolderId::ROOT, &[folder_entry("F1", "A")])
            .unwrap()[0]
            .folder_id;
        // Created offline, no remote id.
        let local = ws.create_folder(a, "X").unwrap();

        let children = ws.fold_folder_listing(a, &[folder_entry("F2", "X")]).unwrap();
        assert_eq!(children[0].folder_id, local, "existing folder claimed");
        assert_eq!(
            ws.folder(local).unwrap().remote_folder_id.as_deref(),
            Some("F2")
        );
        // No duplicate "X" appeared.
        assert_eq!(
            ws.folders().iter().filter(|f| f.name == "X").count(),
            1
        );
    }

    #[test]
    fn test_remote_rename_repaths_descendants() {
        let mut ws = Workspace::new("Notes");
        let work = ws
            .fold_folder_listing(FolderId::ROOT, &[folder_entry("F1", "Work")])
            .unwrap()[0]
            .folder_id;
        ws.fold_folder_listing(work, &[folder_entry("F2", "Plans")])
            .unwrap();
        ws.fold_content_batch(&[content("D1", "Roadmap", "Work/Plans", "body")]);

        // Remote rename: Work -> Projects.
        ws.fold_folder_listing(FolderId::ROOT, &[folder_entry("F1", "Projects")])
            .unwrap();

        assert_eq!(ws.folder(work).unwrap().path, "Projects");
        assert!(ws.folder_by_path("Projects/Plans").is_some());
        assert_eq!(ws.note_by_remote_id("D1").unwrap().path, "Projects/Plans");
    }

    #[test]
    fn test_note_identity_stable_across_updates() {
        let mut ws = Workspace::new("Notes");
        ws.fold_content_batch(&[content("D1", "Plan", "", "v1")]);
        let id = ws.note_by_remote_id("D1").unwrap().id;

        ws.fold_content_batch(&[content("D1", "Plan v2", "", "v2")]);
        let note = ws.note_by_remote_id("D1").unwrap();
        assert_eq!(note.id, id);
        assert_eq!(note.title, "Plan v2");
        assert_eq!(note.content, "v2");
    }

    #[test]
    fn test_unchanged_content_does_not_touch_note() {
        let mut ws = Workspace::new("Notes");
        ws.fold_content_batch(&[content("D1", "Plan", "", "same")]);
        let before = ws.note_by_remote_id("D1").unwrap().clone();

        let mut newer = content("D1", "Plan", "", "same");
        newer.updated_at = 9_999;
        ws.fold_content_batch(&[newer]);

        // Nothing tracked changed, so the record is untouched (including
        // updated_at, which only moves on real rewrites).
        assert_eq!(ws.note_by_remote_id("D1").unwrap(), &before);
    }

    #[test]
    fn test_local_only_note_claims_remote_id_keeps_content() {
        let mut ws = Workspace::new("Notes");
        let id = ws
            .create_note(FolderId::ROOT, "Draft", "local edits")
            .unwrap();

        ws.fold_content_batch(&[content("D1", "Draft", "", "remote version")]);

        let note = ws.note(id).unwrap();
        assert_eq!(note.remote_file_id.as_deref(), Some("D1"));
        assert_eq!(note.content, "local edits");
        assert_eq!(ws.notes().len(), 1);
    }

    #[test]
    fn test_encrypted_envelope_is_flagged_not_decrypted() {
        let mut ws = Workspace::new("Notes");
        let envelope = serde_json::json!({
            "encrypted": true,
            "data": { "ciphertext": "deadbeef" }
        })
        .to_string();
        ws.fold_content_batch(&[content("D1", "Secret", "", &envelope)]);

        let note = ws.note_by_remote_id("D1").unwrap();
        assert!(note.is_encrypted);
        assert_eq!(note.content, LOCKED_PLACEHOLDER);
        assert_eq!(
            note.encrypted_payload.as_ref().unwrap()["ciphertext"],
            "deadbeef"
        );
    }

    #[test]
    fn test_prune_missing_keeps_local_only_and_root() {
        let mut ws = Workspace::new("Notes");
        ws.fold_folder_listing(FolderId::ROOT, &[folder_entry("F1", "Work")])
            .unwrap();
        ws.fold_content_batch(&[content("R1", "Synced", "", "x")]);
        let local = ws.create_note(FolderId::ROOT, "Scratch", "y").unwrap();

        // Remote no longer knows R1 or F1.
        let (folders_gone, notes_gone) =
            ws.prune_missing(&HashSet::new(), &HashSet::new());

        assert_eq!((folders_gone, notes_gone), (1, 1));
        assert!(ws.note_by_remote_id("R1").is_none());
        assert!(ws.note(local).is_some(), "local-only note survives");
        assert!(ws.folder(FolderId::ROOT).is_some());
    }

    #[test]
    fn test_remove_folder_tree_takes_descendants() {
        let mut ws = Workspace::new("Notes");
        let work = ws
            .fold_folder_listing(FolderId::ROOT, &[folder_entry("F1", "Work")])
            .unwrap()[0]
            .folder_id;
        ws.fold_folder_listing(work, &[folder_entry("F2", "Plans")])
            .unwrap();
        ws.fold_content_batch(&[
            content("D1", "InWork", "Work", "a"),
            content("D2", "InPlans", "Work/Plans", "b"),
            content("D3", "AtRoot", "", "c"),
        ]);

        ws.remove_folder_tree(work).unwrap();

        assert!(ws.folder_by_path("Work").is_none());
        assert!(ws.folder_by_path("Work/Plans").is_none());
        assert!(ws.note_by_remote_id("D1").is_none());
        assert!(ws.note_by_remote_id("D2").is_none());
        assert!(ws.note_by_remote_id("D3").is_some());
    }
}
