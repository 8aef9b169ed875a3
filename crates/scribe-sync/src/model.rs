//! Local data model: notes, folders and their identifiers.
//!
//! Local ids are assigned once at first observation and never change,
//! regardless of what happens to the remote counterpart. Remote ids are
//! attached opportunistically when the reconciler finds a match.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable local identifier for a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(Uuid);

impl NoteId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable local identifier for a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderId(Uuid);

impl FolderId {
    /// The root folder. Always present in a workspace.
    pub const ROOT: FolderId = FolderId(Uuid::nil());

    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A single note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub content: String,
    /// Slash-joined ancestor folder names. Empty for notes at the root.
    /// Derived, not an identity field.
    pub path: String,
    /// Attached once a remote counterpart is known. Absent for local-only notes.
    pub remote_file_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
    /// True when the remote content arrived wrapped in an encrypted envelope.
    pub is_encrypted: bool,
    /// Opaque encrypted payload, kept verbatim for the encryption collaborator.
    pub encrypted_payload: Option<serde_json::Value>,
}

/// A folder in the note tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    /// Slash-joined ancestor names including this folder's own name.
    pub path: String,
    /// Local id of the parent. `None` only for the root record.
    pub parent_id: Option<FolderId>,
    pub remote_folder_id: Option<String>,
    /// UI state carried along for snapshots; never consulted by the engine.
    pub expanded: bool,
}

/// Join a parent path and a child name into a slash path.
pub fn join_path(parent_path: &str, name: &str) -> String {
    if parent_path.is_empty() {
        name.to_string()
    } else {
        format!("{parent_path}/{name}")
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
