//! Correction store: durable "when X goes wrong, do Y" records learned
//! across sessions.

use super::store::MemoryStore;
use super::traits::{MemoryEntry, MemoryKind, correction_id};

/// A candidate correction ranked by [`CorrectionStore::find_relevant`].
#[derive(Debug, Clone)]
pub struct RankedCorrection {
    pub entry: MemoryEntry,
    pub score: f64,
}

/// Wraps a [`MemoryStore`] with the correction-specific `Learn` /
/// `FindRelevant` / success-rate bookkeeping described in §4.6.
pub struct CorrectionStore {
    inner: MemoryStore,
}

impl CorrectionStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self { inner }
    }

    /// Record that `trigger` + `problem` was resolved by `solution` in
    /// `context`. A second `Learn` call with the same (trigger, problem)
    /// increments `use_count` on the existing entry instead of duplicating
    /// it.
    pub fn learn(&self, trigger: &str, problem: &str, solution: &str, context: &str) -> String {
        let id = correction_id(trigger, problem);
        if let Some(existing) = self.inner.get(&id) {
            self.inner.increment_use_count(&existing.id);
            // Content may have drifted (a better solution found) — keep it current.
            self.inner.update(&id, format!("{solution}\n---\n{context}"));
        } else {
            let entry = MemoryEntry::new(id.clone(), MemoryKind::Correction, format!("{solution}\n---\n{context}"))
                .with_metadata("trigger", trigger)
                .with_metadata("problem", problem);
            self.inner.add(entry);
            self.inner.increment_use_count(&id);
        }
        id
    }

    /// Case-insensitive substring match of `trigger`/`problem` metadata
    /// against `error`/`context`, ranked by `use_count * success_rate`
    /// descending.
    pub fn find_relevant(&self, error: &str, context: &str) -> Vec<RankedCorrection> {
        let error_lc = error.to_lowercase();
        let context_lc = context.to_lowercase();

        let mut ranked: Vec<RankedCorrection> = self
            .inner
            .list()
            .into_iter()
            .filter(|e| {
                let trigger = e.metadata.get("trigger").map(|s| s.to_lowercase()).unwrap_or_default();
                let problem = e.metadata.get("problem").map(|s| s.to_lowercase()).unwrap_or_default();
                (!trigger.is_empty() && (error_lc.contains(&trigger) || trigger.contains(&error_lc)))
                    || (!problem.is_empty() && (context_lc.contains(&problem) || problem.contains(&context_lc)))
            })
            .map(|e| {
                let score = e.use_count as f64 * e.success_rate.max(0.01);
                RankedCorrection { entry: e, score }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    /// Update the running weighted success rate after the correction was
    /// applied and worked.
    pub fn record_success(&self, id: &str) {
        self.update_success_rate(id, 1.0);
    }

    pub fn record_failure(&self, id: &str) {
        self.update_success_rate(id, 0.0);
    }

    fn update_success_rate(&self, id: &str, outcome: f64) {
        const ALPHA: f64 = 0.3;
        if let Some(mut entry) = self.inner.get(id) {
            entry.success_rate = if entry.use_count <= 1 {
                outcome
            } else {
                entry.success_rate + ALPHA * (outcome - entry.success_rate)
            };
            // update() only touches content; reinsert to persist the rate.
            self.inner.add(entry);
        }
    }

    pub fn get(&self, id: &str) -> Option<MemoryEntry> {
        self.inner.get(id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::StoreLimits;
    use tempfile::TempDir;

    fn store() -> (TempDir, CorrectionStore) {
        let dir = TempDir::new().unwrap();
        let inner = MemoryStore::open(dir.path(), MemoryKind::Correction, StoreLimits::default()).unwrap();
        (dir, CorrectionStore::new(inner))
    }

    #[tokio::test]
    async fn learn_twice_increments_use_count_once_entry() {
        let (_dir, store) = store();
        let id1 = store.learn("NullPointerException", "missing null check", "add guard", "ctx");
        let id2 = store.learn("NullPointerException", "missing null check", "add guard v2", "ctx2");
        assert_eq!(id1, id2);
        assert_eq!(store.get(&id1).unwrap().use_count, 2);
        store.close().await;
    }

    #[tokio::test]
    async fn find_relevant_matches_substring_and_ranks_by_score() {
        let (_dir, store) = store();
        let id = store.learn("connection refused", "db down", "retry with backoff", "networking");
        store.record_success(&id);
        store.record_success(&id);

        let results = store.find_relevant("got connection refused error", "some networking context");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.id, id);
        store.close().await;
    }

    #[tokio::test]
    async fn unrelated_error_not_matched() {
        let (_dir, store) = store();
        store.learn("OOM", "heap exhausted", "increase heap", "jvm");
        let results = store.find_relevant("timeout waiting for socket", "http client");
        assert!(results.is_empty());
        store.close().await;
    }
}
