//! Encrypted-envelope detection.
//!
//! Remote backends may hand us note content that was encrypted client-side
//! before upload. Such content is a JSON marker object rather than plain
//! markdown: `{"encrypted": true, "data": {...}}`. The engine never decrypts;
//! it only recognizes the envelope, keeps the payload verbatim and substitutes
//! a placeholder body until the (external) encryption collaborator unlocks it.

use serde::{Deserialize, Serialize};

/// Placeholder shown in place of encrypted content.
pub const LOCKED_PLACEHOLDER: &str = "\
# Encrypted note

This note is stored in encrypted form.

To view the content, select \"Decrypt Note\" on this note and enter your
password. The original content will then be available for viewing and editing.";

/// The structured marker object wrapping encrypted note content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EncryptedEnvelope {
    /// Parse content as an encrypted envelope.
    ///
    /// Returns `None` for anything that is not the marker object: plain text,
    /// arbitrary JSON, or a marker with `encrypted` unset or no payload.
    pub fn parse(content: &str) -> Option<Self> {
        let envelope: Self = serde_json::from_str(content).ok()?;
        (envelope.encrypted && !envelope.data.is_null()).then_some(envelope)
    }
}
