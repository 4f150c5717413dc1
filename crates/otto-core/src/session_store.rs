// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use crate::Conversation;

/// One saved session as shown in a picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub message_count: usize,
}

/// Session persistence supplied by the embedder.  The on-disk format is the
/// embedder's choice; the core only needs these three operations.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &str) -> Option<Conversation>;
    fn save(&self, id: &str, conversation: &Conversation, title: &str);
    fn list(&self) -> Vec<SessionSummary>;
}

/// In-memory store used by tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, (Conversation, String)>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, id: &str) -> Option<Conversation> {
        self.sessions.lock().unwrap().get(id).map(|(c, _)| c.clone())
    }

    fn save(&self, id: &str, conversation: &Conversation, title: &str) {
        self.sessions
            .lock()
            .unwrap()
            .insert(id.to_string(), (conversation.clone(), title.to_string()));
    }

    fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (c, title))| SessionSummary {
                id: id.clone(),
                title: title.clone(),
                message_count: c.len(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
