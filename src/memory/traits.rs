//! Core types shared by the four memory stores (session, project,
//! correction, solution).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which store an entry lives in; stores share an implementation but keep
/// separate on-disk directories and enforce type-specific lookup semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Session,
    Project,
    Correction,
    Solution,
}

impl MemoryKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            MemoryKind::Session => "session",
            MemoryKind::Project => "project",
            MemoryKind::Correction => "correction",
            MemoryKind::Solution => "solution",
        }
    }
}

/// A single record in any of the four stores.
///
/// `expires_at` is `None` for entries without a TTL; `use_count` is
/// incremented by [`crate::memory::store::MemoryStore::increment_use_count`]
/// and, for the correction store, by `Learn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub use_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Correction-store only: running weighted success rate in [0, 1].
    #[serde(default)]
    pub success_rate: f64,
}

impl MemoryEntry {
    pub fn new(id: impl Into<String>, kind: MemoryKind, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            content: content.into(),
            metadata: HashMap::new(),
            use_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
            success_rate: 0.0,
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.expires_at = Some(self.created_at + ttl);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| now >= e)
    }
}

/// Deterministic id for the correction store: `hash(trigger || problem)`.
pub fn correction_id(trigger: &str, problem: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(trigger.as_bytes());
    hasher.update(b"\0");
    hasher.update(problem.as_bytes());
    hex::encode(hasher.finalize())
}
