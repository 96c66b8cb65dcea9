//! Generic JSON-backed memory store shared by all four memory kinds.
//!
//! Entries live in a `RwLock<HashMap<id, MemoryEntry>>`; the whole map is
//! serialized to `<dir>/memory.json` (mode 0644) via a debounced timer.
//! Capacity and disk-quota enforcement run on every `add`; a background
//! auto-prune task removes TTL-expired entries on an interval.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration as StdDuration,
};

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::traits::{MemoryEntry, MemoryKind};

/// Caps and timers governing a single store.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_entries: usize,
    pub max_disk_bytes: u64,
    pub flush_debounce: StdDuration,
    pub auto_prune_interval: StdDuration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_disk_bytes: 10 * 1024 * 1024,
            flush_debounce: StdDuration::from_secs(5),
            auto_prune_interval: StdDuration::from_secs(3600),
        }
    }
}

/// A single persisted memory store (one per [`MemoryKind`]).
///
/// Cheap to clone: internal state is `Arc`-shared, so a clone can be handed
/// to the debounce-flush and auto-prune background tasks.
#[derive(Clone)]
pub struct MemoryStore {
    kind: MemoryKind,
    dir: PathBuf,
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    limits: StoreLimits,
    flush_requested: Arc<Notify>,
    prune_stop: Arc<Notify>,
    flush_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    prune_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl MemoryStore {
    /// Open (or create) the store directory and load `memory.json` if
    /// present. Spawns the debounced-flush and auto-prune background tasks.
    pub fn open(base_dir: &Path, kind: MemoryKind, limits: StoreLimits) -> std::io::Result<Self> {
        let dir = base_dir.join(kind.dir_name());
        fs::create_dir_all(&dir)?;

        let entries = load_entries(&dir.join("memory.json")).unwrap_or_default();

        let store = Self {
            kind,
            dir,
            entries: Arc::new(RwLock::new(entries)),
            limits,
            flush_requested: Arc::new(Notify::new()),
            prune_stop: Arc::new(Notify::new()),
            flush_task: Arc::new(std::sync::Mutex::new(None)),
            prune_task: Arc::new(std::sync::Mutex::new(None)),
        };

        store.spawn_flush_task();
        store.spawn_prune_task();
        Ok(store)
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    // ── CRUD ──────────────────────────────────────────────────────────────

    /// Insert or overwrite an entry, enforcing the `max_entries` LRU cap.
    pub fn add(&self, entry: MemoryEntry) {
        {
            let mut guard = self.entries.write().expect("memory store lock poisoned");
            guard.insert(entry.id.clone(), entry);
            enforce_entry_cap(&mut guard, self.limits.max_entries);
        }
        self.schedule_flush();
    }

    pub fn get(&self, id: &str) -> Option<MemoryEntry> {
        let guard = self.entries.read().expect("memory store lock poisoned");
        guard
            .get(id)
            .filter(|e| !e.is_expired(Utc::now()))
            .cloned()
    }

    /// Replace the content/metadata of an existing entry, bumping
    /// `updated_at`. Returns `false` if no entry with that id exists.
    pub fn update(&self, id: &str, content: impl Into<String>) -> bool {
        let updated = {
            let mut guard = self.entries.write().expect("memory store lock poisoned");
            match guard.get_mut(id) {
                Some(e) => {
                    e.content = content.into();
                    e.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.schedule_flush();
        }
        updated
    }

    pub fn delete(&self, id: &str) -> bool {
        let removed = self
            .entries
            .write()
            .expect("memory store lock poisoned")
            .remove(id)
            .is_some();
        if removed {
            self.schedule_flush();
        }
        removed
    }

    /// All non-expired entries, most-recently-updated first.
    pub fn list(&self) -> Vec<MemoryEntry> {
        let now = Utc::now();
        let guard = self.entries.read().expect("memory store lock poisoned");
        let mut all: Vec<MemoryEntry> = guard.values().filter(|e| !e.is_expired(now)).cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all
    }

    /// Case-insensitive substring search over entry content.
    pub fn search(&self, query: &str) -> Vec<MemoryEntry> {
        let needle = query.to_lowercase();
        self.list()
            .into_iter()
            .filter(|e| e.content.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn increment_use_count(&self, id: &str) {
        let found = {
            let mut guard = self.entries.write().expect("memory store lock poisoned");
            if let Some(e) = guard.get_mut(id) {
                e.use_count += 1;
                e.updated_at = Utc::now();
                true
            } else {
                false
            }
        };
        if found {
            self.schedule_flush();
        }
    }

    /// Remove all TTL-expired entries. Returns the number removed.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut guard = self.entries.write().expect("memory store lock poisoned");
            let before = guard.len();
            guard.retain(|_, e| !e.is_expired(now));
            before - guard.len()
        };
        if removed > 0 {
            self.schedule_flush();
        }
        removed
    }

    /// Remove entries older than `max_age` with fewer than `min_use_count`
    /// uses. Returns the number removed.
    pub fn prune(&self, max_age: chrono::Duration, min_use_count: u64) -> usize {
        let cutoff = Utc::now() - max_age;
        let removed = {
            let mut guard = self.entries.write().expect("memory store lock poisoned");
            let before = guard.len();
            guard.retain(|_, e| e.updated_at >= cutoff || e.use_count >= min_use_count);
            before - guard.len()
        };
        if removed > 0 {
            self.schedule_flush();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("memory store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Persistence ──────────────────────────────────────────────────────

    fn schedule_flush(&self) {
        self.flush_requested.notify_one();
    }

    fn spawn_flush_task(&self) {
        let entries = self.entries.clone();
        let dir = self.dir.clone();
        let notify = self.flush_requested.clone();
        let debounce = self.limits.flush_debounce;
        let max_disk_bytes = self.limits.max_disk_bytes;

        let handle = tokio::spawn(async move {
            loop {
                notify.notified().await;
                // Debounce: a burst of mutations coalesces into one write —
                // keep resetting the timer while new requests keep arriving.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => break,
                        _ = notify.notified() => continue,
                    }
                }
                flush_to_disk(&entries, &dir, max_disk_bytes);
            }
        });
        *self.flush_task.lock().expect("flush task lock poisoned") = Some(handle);
    }

    fn spawn_prune_task(&self) {
        let store = self.clone();
        let interval = self.limits.auto_prune_interval;
        let stop = self.prune_stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        store.prune_expired();
                    }
                    _ = stop.notified() => break,
                }
            }
        });
        *self.prune_task.lock().expect("prune task lock poisoned") = Some(handle);
    }

    /// Stop background tasks and flush synchronously. Must be called before
    /// the store is dropped to guarantee durability (§5 ordering guarantee
    /// (iv)).
    pub async fn close(&self) {
        self.prune_stop.notify_one();
        if let Some(handle) = self.prune_task.lock().expect("prune task lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.flush_task.lock().expect("flush task lock poisoned").take() {
            handle.abort();
        }
        flush_to_disk(&self.entries, &self.dir, self.limits.max_disk_bytes);
    }
}

// ─── Free functions ─────────────────────────────────────────────────────────

fn enforce_entry_cap(entries: &mut HashMap<String, MemoryEntry>, max_entries: usize) {
    while entries.len() > max_entries {
        let victim = entries
            .values()
            .min_by_key(|e| e.updated_at)
            .map(|e| e.id.clone());
        match victim {
            Some(id) => {
                entries.remove(&id);
            }
            None => break,
        }
    }
}

fn load_entries(path: &Path) -> Option<HashMap<String, MemoryEntry>> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Serialize the map and write it to `<dir>/memory.json`, evicting the
/// oldest-updated entry repeatedly if the serialized size exceeds
/// `max_disk_bytes`.
fn flush_to_disk(entries: &Arc<RwLock<HashMap<String, MemoryEntry>>>, dir: &Path, max_disk_bytes: u64) {
    let mut guard = entries.write().expect("memory store lock poisoned");
    loop {
        let serialized = match serde_json::to_vec_pretty(&*guard) {
            Ok(v) => v,
            Err(_) => return,
        };
        if (serialized.len() as u64) <= max_disk_bytes || guard.is_empty() {
            let path = dir.join("memory.json");
            if fs::write(&path, &serialized).is_ok() {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(meta) = fs::metadata(&path) {
                        let mut perm = meta.permissions();
                        perm.set_mode(0o644);
                        let _ = fs::set_permissions(&path, perm);
                    }
                }
            }
            return;
        }
        let victim = guard.values().min_by_key(|e| e.updated_at).map(|e| e.id.clone());
        match victim {
            Some(id) => {
                guard.remove(&id);
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn limits(max_entries: usize) -> StoreLimits {
        StoreLimits {
            max_entries,
            max_disk_bytes: 10 * 1024 * 1024,
            flush_debounce: StdDuration::from_millis(20),
            auto_prune_interval: StdDuration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn add_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path(), MemoryKind::Session, limits(100)).unwrap();
        store.add(MemoryEntry::new("a", MemoryKind::Session, "hello"));
        let got = store.get("a").unwrap();
        assert_eq!(got.content, "hello");
        store.close().await;
    }

    #[tokio::test]
    async fn max_entries_enforced_as_lru() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path(), MemoryKind::Project, limits(3)).unwrap();
        for i in 0..5 {
            let mut e = MemoryEntry::new(format!("id{i}"), MemoryKind::Project, "x");
            e.updated_at = Utc::now() + chrono::Duration::seconds(i);
            store.add(e);
        }
        assert!(store.len() <= 3);
        // Oldest-updated (id0, id1) should be gone; most recent remain.
        assert!(store.get("id4").is_some());
        store.close().await;
    }

    #[tokio::test]
    async fn expired_entries_not_returned_before_sweep() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path(), MemoryKind::Correction, limits(100)).unwrap();
        let mut e = MemoryEntry::new("exp", MemoryKind::Correction, "x");
        e.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.add(e);
        assert!(store.get("exp").is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn prune_expired_removes_entries() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path(), MemoryKind::Solution, limits(100)).unwrap();
        let mut e = MemoryEntry::new("exp", MemoryKind::Solution, "x");
        e.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.add(e);
        store.add(MemoryEntry::new("fresh", MemoryKind::Solution, "y"));
        let removed = store.prune_expired();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn close_flushes_synchronously() {
        let dir = TempDir::new().unwrap();
        {
            let store = MemoryStore::open(dir.path(), MemoryKind::Session, limits(100)).unwrap();
            store.add(MemoryEntry::new("a", MemoryKind::Session, "durable"));
            store.close().await;
        }
        let reopened = MemoryStore::open(dir.path(), MemoryKind::Session, limits(100)).unwrap();
        assert_eq!(reopened.get("a").unwrap().content, "durable");
    }

    #[tokio::test]
    async fn update_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path(), MemoryKind::Session, limits(100)).unwrap();
        store.add(MemoryEntry::new("a", MemoryKind::Session, "v1"));
        assert!(store.update("a", "v2"));
        assert_eq!(store.get("a").unwrap().content, "v2");
        assert!(store.delete("a"));
        assert!(store.get("a").is_none());
        assert!(!store.delete("a"));
        store.close().await;
    }

    #[tokio::test]
    async fn search_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path(), MemoryKind::Session, limits(100)).unwrap();
        store.add(MemoryEntry::new("a", MemoryKind::Session, "The Quick Brown Fox"));
        assert_eq!(store.search("quick").len(), 1);
        assert_eq!(store.search("slow").len(), 0);
        store.close().await;
    }
}
