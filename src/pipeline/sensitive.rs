//! Per-session store of redacted values
//!
//! Each redacted value is replaced in the outgoing request by a placeholder of
//! the form `#<uuid>#`. The mapping lives only in memory and only for the
//! session (one request/response exchange) that created it.

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// A value removed from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitiveData {
    pub original: String,
    /// Pipeline service that found it, e.g. `pii`
    pub service: String,
    /// Detector specific type, e.g. `EMAIL_ADDRESS`
    pub kind: String,
}

type Session = HashMap<String, SensitiveData>;

#[derive(Debug, Default)]
pub struct SensitiveDataManager {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SensitiveDataManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value for a session and return its placeholder
    ///
    /// Storing the same original twice in one session returns the same
    /// placeholder.
    pub fn store(&self, session_id: &str, data: SensitiveData) -> String {
        let Ok(mut sessions) = self.sessions.write() else {
            // A poisoned lock leaves nothing to restore later; still hide the value.
            return placeholder(Uuid::new_v4());
        };
        let session = sessions.entry(session_id.to_string()).or_default();

        if let Some((existing, _)) = session.iter().find(|(_, d)| d.original == data.original) {
            return existing.clone();
        }

        let marker = placeholder(Uuid::new_v4());
        debug!(session_id, kind = %data.kind, "Stored sensitive value");
        session.insert(marker.clone(), data);
        marker
    }

    pub fn get_original_value(&self, session_id: &str, placeholder: &str) -> Option<String> {
        let sessions = self.sessions.read().ok()?;
        sessions
            .get(session_id)?
            .get(placeholder)
            .map(|d| d.original.clone())
    }

    pub fn cleanup_session(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if sessions.remove(session_id).is_some() {
                debug!(session_id, "Cleaned up sensitive data session");
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}

fn placeholder(id: Uuid) -> String {
    format!("#{}#", id)
}
