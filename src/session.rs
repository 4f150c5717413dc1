// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-file session persistence.
//!
//! One file per session under the data directory.  The format is private to
//! this binary — the core only sees the [`SessionStore`] trait.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use otto_core::{Conversation, SessionStore, SessionSummary};
use otto_model::Message;

#[derive(Serialize, Deserialize)]
struct SessionFile {
    id: String,
    title: String,
    messages: Vec<Message>,
}

pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Default location: `~/.local/share/otto/sessions` (platform dependent).
    pub fn default_location() -> Self {
        let dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("otto/sessions");
        Self::new(dir)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Session ids are uuids; strip anything path-hostile anyway.
        let safe: String = id.chars().filter(|c| c.is_alphanumeric() || *c == '-').collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, id: &str) -> Option<Conversation> {
        let text = std::fs::read_to_string(self.path_for(id)).ok()?;
        let file: SessionFile = serde_json::from_str(&text).ok()?;
        let mut conv = Conversation::new();
        conv.id = file.id;
        conv.replace_messages(file.messages);
        Some(conv)
    }

    fn save(&self, id: &str, conversation: &Conversation, title: &str) {
        let file = SessionFile {
            id: id.to_string(),
            title: title.to_string(),
            messages: conversation.messages().to_vec(),
        };
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            let json = serde_json::to_string_pretty(&file)?;
            std::fs::write(self.path_for(id), json)
        };
        if let Err(e) = write() {
            warn!(id, error = %e, "failed to save session");
        }
    }

    fn list(&self) -> Vec<SessionSummary> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out: Vec<SessionSummary> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
            .filter_map(|e| {
                let text = std::fs::read_to_string(e.path()).ok()?;
                let file: SessionFile = serde_json::from_str(&text).ok()?;
                Some(SessionSummary {
                    id: file.id,
                    title: file.title,
                    message_count: file.messages.len(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
