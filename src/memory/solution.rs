//! Solution store: durable "a request like this was solved by X" records,
//! retrieved by similarity rather than exact key.

use std::collections::HashSet;

use uuid::Uuid;

use super::store::MemoryStore;
use super::traits::{MemoryEntry, MemoryKind};

const DEFAULT_THRESHOLD: f64 = 0.85;

/// A past (request, solution) pair plus the similarity score against the
/// query that matched it.
#[derive(Debug, Clone)]
pub struct SimilarSolution {
    pub entry: MemoryEntry,
    pub score: f64,
}

pub struct SolutionStore {
    inner: MemoryStore,
    threshold: f64,
}

impl SolutionStore {
    pub fn new(inner: MemoryStore, threshold: f64) -> Self {
        Self { inner, threshold }
    }

    pub fn with_default_threshold(inner: MemoryStore) -> Self {
        Self::new(inner, DEFAULT_THRESHOLD)
    }

    /// Record that `request` was solved by `solution`.
    pub fn record(&self, request: &str, solution: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = MemoryEntry::new(id.clone(), MemoryKind::Solution, solution)
            .with_metadata("request", request);
        self.inner.add(entry);
        id
    }

    /// Find the best-matching prior solution for `request`, scored
    /// `0.7 * jaccard(tokens) + 0.3 * length_ratio` against every entry's
    /// stored request. Returns `None` if nothing clears `threshold`.
    pub fn find_similar(&self, request: &str) -> Option<SimilarSolution> {
        let query_tokens = tokenize(request);
        let mut best: Option<SimilarSolution> = None;

        for entry in self.inner.list() {
            let Some(stored_request) = entry.metadata.get("request") else {
                continue;
            };
            let candidate_tokens = tokenize(stored_request);
            let score = similarity(&query_tokens, request.len(), &candidate_tokens, stored_request.len());
            if score >= self.threshold && best.as_ref().is_none_or(|b| score > b.score) {
                best = Some(SimilarSolution { entry: entry.clone(), score });
            }
        }

        if let Some(ref found) = best {
            self.inner.increment_use_count(&found.entry.id);
        }
        best
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

/// Lowercase runs of `[a-z0-9]` as the token alphabet.
fn tokenize(s: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut current = String::new();
    for ch in s.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 { 0.0 } else { intersection / union }
}

fn length_ratio(a_len: usize, b_len: usize) -> f64 {
    let (a, b) = (a_len as f64, b_len as f64);
    if a == 0.0 && b == 0.0 {
        return 1.0;
    }
    a.min(b) / a.max(b)
}

fn similarity(a_tokens: &HashSet<String>, a_len: usize, b_tokens: &HashSet<String>, b_len: usize) -> f64 {
    0.7 * jaccard(a_tokens, b_tokens) + 0.3 * length_ratio(a_len, b_len)
}
