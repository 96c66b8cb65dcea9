//! Persistent memory: four layered stores (session, project, correction,
//! solution) sharing one LRU/TTL/disk-capped JSON-backed implementation.
//!
//! ```text
//! MemoryLayer
//!   ├── session:    MemoryStore     — this run's working notes
//!   ├── project:    MemoryStore     — durable facts about the repo/goal
//!   ├── correction: CorrectionStore — "when X fails, do Y" (use_count × success_rate ranked)
//!   └── solution:   SolutionStore   — "a request like this was solved by Z" (Jaccard + length similarity)
//! ```

pub mod correction;
pub mod solution;
pub mod store;
pub mod traits;

use std::path::Path;

use crate::config::MemoryConfig;

pub use correction::{CorrectionStore, RankedCorrection};
pub use solution::{SimilarSolution, SolutionStore};
pub use store::{MemoryStore, StoreLimits};
pub use traits::{MemoryEntry, MemoryKind, correction_id};

/// Bundles all four stores under a single memory root directory
/// (`<home>/.vecai/memory/<kind>/memory.json`), sized from [`MemoryConfig`].
pub struct MemoryLayer {
    pub session: MemoryStore,
    pub project: MemoryStore,
    pub correction: CorrectionStore,
    pub solution: SolutionStore,
}

impl MemoryLayer {
    pub fn open(root: &Path, config: &MemoryConfig) -> std::io::Result<Self> {
        let limits = StoreLimits {
            max_entries: config.max_entries,
            max_disk_bytes: config.max_disk_bytes,
            flush_debounce: std::time::Duration::from_secs(config.flush_debounce_secs),
            auto_prune_interval: std::time::Duration::from_secs(config.auto_prune_interval_secs),
        };

        let session = MemoryStore::open(root, MemoryKind::Session, limits)?;
        let project = MemoryStore::open(root, MemoryKind::Project, limits)?;
        let correction = MemoryStore::open(root, MemoryKind::Correction, limits)?;
        let solution = MemoryStore::open(root, MemoryKind::Solution, limits)?;

        Ok(Self {
            session,
            project,
            correction: CorrectionStore::new(correction),
            solution: SolutionStore::new(solution, config.solution_similarity_threshold),
        })
    }

    /// Build the enrichment block the agent loop prepends to a user message:
    /// the latest project summary, latest session summary, and any
    /// corrections relevant to the user's text. Returns `None` if none of
    /// those layers contributed anything.
    pub fn enrich(&self, user_message: &str) -> Option<String> {
        let mut sections = Vec::new();

        if let Some(project) = self.project.list().into_iter().max_by_key(|e| e.updated_at) {
            sections.push(format!("Project context:\n{}", project.content));
        }
        if let Some(session) = self.session.list().into_iter().max_by_key(|e| e.updated_at) {
            sections.push(format!("Session context:\n{}", session.content));
        }

        let corrections = self.correction.find_relevant(user_message, user_message);
        if !corrections.is_empty() {
            let lines: Vec<String> = corrections
                .iter()
                .take(3)
                .map(|c| format!("- {}", c.entry.content.lines().next().unwrap_or("")))
                .collect();
            sections.push(format!("Relevant corrections:\n{}", lines.join("\n")));
        }

        if sections.is_empty() { None } else { Some(sections.join("\n\n")) }
    }

    /// Flush and stop background tasks on all four stores. Must be awaited
    /// before process exit to honor the durability guarantee.
    pub async fn close(&self) {
        self.session.close().await;
        self.project.close().await;
        self.correction.close().await;
        self.solution.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn enrich_concatenates_available_layers() {
        let dir = TempDir::new().unwrap();
        let layer = MemoryLayer::open(dir.path(), &MemoryConfig::default()).unwrap();

        layer.project.add(MemoryEntry::new("p1", MemoryKind::Project, "Building a CLI tool in Rust."));
        layer.session.add(MemoryEntry::new("s1", MemoryKind::Session, "User is debugging a panic in main.rs."));
        layer.correction.learn("panic", "unwrap on None", "use ? instead of unwrap", "rust");

        let block = layer.enrich("I got a panic unwrap on None again").unwrap();
        assert!(block.contains("Building a CLI tool"));
        assert!(block.contains("debugging a panic"));
        assert!(block.contains("use ? instead of unwrap"));

        layer.close().await;
    }

    #[tokio::test]
    async fn enrich_returns_none_when_empty() {
        let dir = TempDir::new().unwrap();
        let layer = MemoryLayer::open(dir.path(), &MemoryConfig::default()).unwrap();
        assert!(layer.enrich("hello").is_none());
        layer.close().await;
    }
}
