//! Session persistence: one JSON file per session under
//! `<home>/.vecai/sessions/`, a `current.json` symlink pointing at the
//! active one, and 10-session retention (§6, §2.2 supplemented feature).
//!
//! This is the simplest schema that satisfies the round-trip law in §8 —
//! no forward/backward-compatibility machinery is attempted.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::types::Message;

const MAX_RETAINED_SESSIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self { id: id.into(), model: model.into(), messages: Vec::new(), created_at: now, updated_at: now }
    }
}

/// Default sessions directory: `<home>/.vecai/sessions`.
pub fn default_sessions_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".vecai").join("sessions"))
}

fn session_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

/// Save `session` under `dir`, relink `current.json` to point at it, and
/// enforce the 10-session retention cap (oldest-updated evicted).
///
/// Files are written mode 0600 (session content may include tool output
/// from the user's filesystem).
pub fn save(dir: &Path, session: &SessionRecord) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;

    let path = session_path(dir, &session.id);
    let content = serde_json::to_vec_pretty(session)?;
    fs::write(&path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perm = fs::metadata(&path)?.permissions();
        perm.set_mode(0o600);
        fs::set_permissions(&path, perm)?;
    }

    relink_current(dir, &session.id);
    enforce_retention(dir)?;
    Ok(())
}

/// Load a session by id from `dir`.
pub fn load(dir: &Path, id: &str) -> std::io::Result<SessionRecord> {
    let content = fs::read_to_string(session_path(dir, id))?;
    serde_json::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Load whatever session `current.json` points at, if any.
pub fn load_current(dir: &Path) -> std::io::Result<SessionRecord> {
    let content = fs::read_to_string(dir.join("current.json"))?;
    serde_json::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn relink_current(dir: &Path, id: &str) {
    let current = dir.join("current.json");
    let _ = fs::remove_file(&current);
    #[cfg(unix)]
    {
        let _ = std::os::unix::fs::symlink(format!("{id}.json"), &current);
    }
    #[cfg(not(unix))]
    {
        let _ = fs::copy(session_path(dir, id), &current);
    }
}

/// Evict the oldest-updated session files beyond [`MAX_RETAINED_SESSIONS`].
fn enforce_retention(dir: &Path) -> std::io::Result<()> {
    let mut sessions: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some("current.json") {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(record) = serde_json::from_str::<SessionRecord>(&content) {
                sessions.push((path, record.updated_at));
            }
        }
    }

    if sessions.len() <= MAX_RETAINED_SESSIONS {
        return Ok(());
    }

    sessions.sort_by_key(|(_, updated_at)| *updated_at);
    let excess = sessions.len() - MAX_RETAINED_SESSIONS;
    for (path, _) in sessions.into_iter().take(excess) {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut session = SessionRecord::new("abc123", "qwen2.5-coder:7b");
        session.messages.push(Message::user("hello"));
        session.messages.push(Message::assistant("hi there"));

        save(dir.path(), &session).unwrap();
        let loaded = load(dir.path(), "abc123").unwrap();

        assert_eq!(loaded.model, session.model);
        assert_eq!(loaded.messages.len(), session.messages.len());
        for (a, b) in loaded.messages.iter().zip(session.messages.iter()) {
            assert_eq!(a.content, b.content);
        }
    }

    #[test]
    fn current_symlink_points_at_latest_saved() {
        let dir = TempDir::new().unwrap();
        let first = SessionRecord::new("first", "m");
        let second = SessionRecord::new("second", "m");
        save(dir.path(), &first).unwrap();
        save(dir.path(), &second).unwrap();

        let current = load_current(dir.path()).unwrap();
        assert_eq!(current.id, "second");
    }

    #[test]
    fn retention_caps_at_ten_sessions() {
        let dir = TempDir::new().unwrap();
        for i in 0..15 {
            let mut session = SessionRecord::new(format!("s{i}"), "m");
            session.updated_at = Utc::now() + chrono::Duration::seconds(i);
            save(dir.path(), &session).unwrap();
        }

        let count = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                let path = e.as_ref().unwrap().path();
                path.extension().and_then(|x| x.to_str()) == Some("json")
                    && path.file_name().and_then(|n| n.to_str()) != Some("current.json")
            })
            .count();
        assert!(count <= MAX_RETAINED_SESSIONS);
        // The most recently saved session must have survived eviction.
        assert!(load(dir.path(), "s14").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let session = SessionRecord::new("perm-test", "m");
        save(dir.path(), &session).unwrap();
        let meta = fs::metadata(dir.path().join("perm-test.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
