//! Synchronous permission policy mediating every tool invocation.
//!
//! Runs before a tool's `execute` is called. Four modes trade off autonomy
//! against safety; `allow-session` decisions are cached per (tool-name,
//! capability) tuple for the remainder of the process.

use std::{
    collections::{HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::backend::Capability;
use crate::config::PermissionMode;

/// What the caller should do about a tool call the policy did not outright
/// allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalChoice {
    AllowOnce,
    AllowSession,
    Deny,
}

/// Decision returned by [`SecurityPolicy::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The operation may proceed immediately.
    Allowed,
    /// The caller must obtain an [`ApprovalChoice`] from the user before
    /// proceeding; `strict` prompts even for reads.
    NeedsApproval,
    /// The operation is prohibited; the reason explains why.
    Denied(String),
}

/// Risk tier of a shell command, used only for audit-log annotation — the
/// permission decision itself is driven by [`Capability`], not risk tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One entry in the immutable audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub risk_level: RiskLevel,
    pub decision: String,
    pub result: Option<String>,
}

// ─── Rate limiter ──────────────────────────────────────────────────────────

struct SlidingWindow {
    window: Duration,
    max_actions: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    fn new(window_secs: u64, max_actions: usize) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_actions,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    fn try_record(&self) -> bool {
        let mut ts = self.timestamps.lock().expect("rate-limiter lock poisoned");
        let now = Instant::now();
        ts.retain(|&t| now.duration_since(t) < self.window);
        if ts.len() >= self.max_actions {
            return false;
        }
        ts.push_back(now);
        true
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        let mut ts = self.timestamps.lock().expect("lock");
        let now = Instant::now();
        ts.retain(|&t| now.duration_since(t) < self.window);
        ts.len()
    }
}

// ─── SecurityPolicy ────────────────────────────────────────────────────────

/// Enforces the permission policy and path/command validation for all tool
/// executions. Shared across the agent loop via `Arc<SecurityPolicy>`; all
/// mutable state is interior-mutex-guarded.
pub struct SecurityPolicy {
    pub mode: PermissionMode,
    /// If `Some`, paths outside this root are denied.
    pub workspace_root: Option<PathBuf>,
    /// Directories from which access is always denied.
    pub blocked_dirs: Vec<PathBuf>,
    rate_limiter: SlidingWindow,
    action_log: Mutex<Vec<AuditEntry>>,
    /// (tool_name, capability) pairs approved for the rest of the session.
    session_allowed: Mutex<HashSet<(String, Capability)>>,
}

impl SecurityPolicy {
    pub fn new(
        mode: PermissionMode,
        workspace_root: Option<PathBuf>,
        blocked_dirs: Vec<PathBuf>,
        rate_window_secs: u64,
        max_actions_per_window: usize,
    ) -> Self {
        Self {
            mode,
            workspace_root,
            blocked_dirs,
            rate_limiter: SlidingWindow::new(rate_window_secs, max_actions_per_window),
            action_log: Mutex::new(Vec::new()),
            session_allowed: Mutex::new(HashSet::new()),
        }
    }

    pub fn default_policy() -> Self {
        Self::new(PermissionMode::Ask, None, default_blocked_dirs(), 3600, 600)
    }

    // ── Permission evaluation ────────────────────────────────────────────

    /// Evaluate whether a tool call may proceed, before consulting any
    /// previously cached `allow-session` decision.
    pub fn evaluate(&self, tool_name: &str, capability: Capability) -> PolicyDecision {
        if self
            .session_allowed
            .lock()
            .expect("session-allow lock poisoned")
            .contains(&(tool_name.to_owned(), capability))
        {
            return PolicyDecision::Allowed;
        }

        match (self.mode, capability) {
            (PermissionMode::Auto, _) => PolicyDecision::Allowed,
            (PermissionMode::Ask, Capability::Read) => PolicyDecision::Allowed,
            (PermissionMode::Ask, _) => PolicyDecision::NeedsApproval,
            (PermissionMode::Strict, _) => PolicyDecision::NeedsApproval,
            (PermissionMode::Analysis, Capability::Read) => PolicyDecision::Allowed,
            (PermissionMode::Analysis, _) => {
                PolicyDecision::Denied("analysis mode denies write/execute unconditionally".into())
            }
        }
    }

    /// Record an `allow-session` decision so future calls to the same
    /// (tool, capability) pair skip approval for the rest of the session.
    pub fn remember_session_allow(&self, tool_name: &str, capability: Capability) {
        self.session_allowed
            .lock()
            .expect("session-allow lock poisoned")
            .insert((tool_name.to_owned(), capability));
    }

    // ── Risk classification (shell-specific, used by the audit log) ─────

    pub fn classify_command_risk(&self, command: &str) -> RiskLevel {
        let executable = extract_executable(command);
        classify_executable_risk(&executable)
    }

    // ── Validation ───────────────────────────────────────────────────────

    /// Validate a shell command for injection patterns and blocked
    /// executables, independent of the permission mode.
    pub fn validate_command(&self, command: &str) -> PolicyDecision {
        if let Some(reason) = detect_injection(command) {
            return PolicyDecision::Denied(reason);
        }

        let executable = extract_executable(command);
        if BLOCKED_EXECUTABLES.contains(&executable.as_str()) {
            return PolicyDecision::Denied(format!("executable '{executable}' is not permitted"));
        }

        if !self.rate_limiter.try_record() {
            return PolicyDecision::Denied("rate limit exceeded".into());
        }

        PolicyDecision::Allowed
    }

    /// Validate a filesystem path against blocked directories and the
    /// configured workspace root.
    pub fn validate_path(&self, path: &Path) -> PolicyDecision {
        let path_str = path.to_string_lossy();

        if path_str.contains('\0') {
            return PolicyDecision::Denied("path contains null byte".into());
        }

        if path_str.contains("..") {
            return PolicyDecision::Denied("path traversal ('..') is not allowed".into());
        }

        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let canonical_str = canonical.to_string_lossy();

        for blocked in &self.blocked_dirs {
            if canonical.starts_with(blocked) || canonical_str.starts_with(&*blocked.to_string_lossy()) {
                return PolicyDecision::Denied(format!("access to '{}' is blocked", blocked.display()));
            }
        }

        if let Some(ref root) = self.workspace_root {
            if !canonical.starts_with(root) {
                return PolicyDecision::Denied(format!(
                    "path is outside the workspace root '{}'",
                    root.display()
                ));
            }
        }

        PolicyDecision::Allowed
    }

    // ── Audit ────────────────────────────────────────────────────────────

    pub fn log_action(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        risk_level: RiskLevel,
        decision: &str,
        result: Option<&str>,
    ) {
        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            tool_name: tool_name.to_owned(),
            args,
            risk_level,
            decision: decision.to_owned(),
            result: result.map(str::to_owned),
        };
        self.action_log.lock().expect("audit-log lock poisoned").push(entry);
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.action_log.lock().expect("audit-log lock poisoned").clone()
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn extract_executable(command: &str) -> String {
    command.trim().split_whitespace().next().unwrap_or("").to_owned()
}

fn classify_executable_risk(executable: &str) -> RiskLevel {
    const LOW: &[&str] = &[
        "ls", "cat", "grep", "git", "echo", "pwd", "which", "file", "head", "tail", "wc", "sort",
        "uniq", "diff", "find", "stat", "type", "env", "printenv", "date", "uptime",
    ];
    const MEDIUM: &[&str] = &[
        "touch", "mkdir", "cp", "mv", "npm", "yarn", "pnpm", "bun", "pip", "pip3", "cargo", "make",
        "cmake", "gcc", "clang", "rustc", "python", "python3", "node", "tee", "ln",
    ];

    if LOW.contains(&executable) {
        RiskLevel::Low
    } else if MEDIUM.contains(&executable) {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

const BLOCKED_EXECUTABLES: &[&str] = &[
    "rm", "sudo", "su", "shutdown", "reboot", "halt", "poweroff", "dd", "mkfs", "fdisk", "parted",
    "format", "del", "rmdir",
];

fn detect_injection(command: &str) -> Option<String> {
    let patterns: &[(&str, &str)] = &[
        ("`", "backtick command substitution"),
        ("$(", "command substitution $()"),
        ("${", "variable substitution ${}"),
        (" >> ", "output append redirection"),
        (" > ", "output redirection"),
        (">", "output redirection"),
        ("&&", "command chaining &&"),
        ("||", "command chaining ||"),
        (";", "command separator ;"),
        ("|", "pipe operator"),
    ];
    for (pat, desc) in patterns {
        if command.contains(pat) {
            return Some(format!("shell injection pattern detected: {desc}"));
        }
    }
    None
}

fn default_blocked_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![
        PathBuf::from("/etc"),
        PathBuf::from("/proc"),
        PathBuf::from("/sys"),
        PathBuf::from("/dev"),
    ];
    if let Some(home) = dirs::home_dir() {
        for sub in &[".ssh", ".aws", ".gnupg", ".config/gcloud"] {
            dirs.push(home.join(sub));
        }
        #[cfg(unix)]
        dirs.push(PathBuf::from("/root"));
    }
    dirs
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: PermissionMode) -> SecurityPolicy {
        SecurityPolicy::new(mode, None, vec![], 3600, 600)
    }

    #[test]
    fn auto_allows_everything() {
        let p = policy(PermissionMode::Auto);
        assert_eq!(p.evaluate("shell", Capability::Execute), PolicyDecision::Allowed);
        assert_eq!(p.evaluate("file_write", Capability::Write), PolicyDecision::Allowed);
    }

    #[test]
    fn ask_allows_read_prompts_write() {
        let p = policy(PermissionMode::Ask);
        assert_eq!(p.evaluate("file_read", Capability::Read), PolicyDecision::Allowed);
        assert_eq!(p.evaluate("file_write", Capability::Write), PolicyDecision::NeedsApproval);
        assert_eq!(p.evaluate("shell", Capability::Execute), PolicyDecision::NeedsApproval);
    }

    #[test]
    fn strict_prompts_for_read_too() {
        let p = policy(PermissionMode::Strict);
        assert_eq!(p.evaluate("file_read", Capability::Read), PolicyDecision::NeedsApproval);
    }

    #[test]
    fn analysis_denies_write_and_execute() {
        let p = policy(PermissionMode::Analysis);
        assert_eq!(p.evaluate("file_read", Capability::Read), PolicyDecision::Allowed);
        assert!(matches!(p.evaluate("file_write", Capability::Write), PolicyDecision::Denied(_)));
        assert!(matches!(p.evaluate("shell", Capability::Execute), PolicyDecision::Denied(_)));
    }

    #[test]
    fn allow_session_is_cached_per_tool_and_capability() {
        let p = policy(PermissionMode::Ask);
        assert_eq!(p.evaluate("file_write", Capability::Write), PolicyDecision::NeedsApproval);
        p.remember_session_allow("file_write", Capability::Write);
        assert_eq!(p.evaluate("file_write", Capability::Write), PolicyDecision::Allowed);
        // A different tool name is unaffected.
        assert_eq!(p.evaluate("shell", Capability::Execute), PolicyDecision::NeedsApproval);
    }

    #[test]
    fn injection_patterns_denied_regardless_of_mode() {
        let p = policy(PermissionMode::Auto);
        assert!(matches!(p.validate_command("ls `whoami`"), PolicyDecision::Denied(_)));
        assert!(matches!(p.validate_command("echo $(cat /etc/passwd)"), PolicyDecision::Denied(_)));
        assert!(matches!(p.validate_command("ls; rm -rf /"), PolicyDecision::Denied(_)));
    }

    #[test]
    fn blocked_executables_denied() {
        let p = policy(PermissionMode::Auto);
        assert!(matches!(p.validate_command("rm -rf /tmp/foo"), PolicyDecision::Denied(_)));
        assert!(matches!(p.validate_command("sudo apt install vim"), PolicyDecision::Denied(_)));
    }

    #[test]
    fn rate_limit_enforced() {
        let policy = SecurityPolicy::new(PermissionMode::Auto, None, vec![], 60, 3);
        assert_eq!(policy.validate_command("echo a"), PolicyDecision::Allowed);
        assert_eq!(policy.validate_command("echo b"), PolicyDecision::Allowed);
        assert_eq!(policy.validate_command("echo c"), PolicyDecision::Allowed);
        assert!(matches!(policy.validate_command("echo d"), PolicyDecision::Denied(_)));
    }

    #[test]
    fn path_traversal_denied() {
        let p = policy(PermissionMode::Auto);
        assert!(matches!(p.validate_path(&PathBuf::from("../../secret")), PolicyDecision::Denied(_)));
    }

    #[test]
    fn path_inside_workspace_allowed() {
        let dir = tempfile::TempDir::new().unwrap();
        let policy = SecurityPolicy::new(PermissionMode::Auto, Some(dir.path().to_path_buf()), vec![], 60, 100);
        let target = dir.path().join("file.txt");
        std::fs::write(&target, "x").unwrap();
        assert_eq!(policy.validate_path(&target), PolicyDecision::Allowed);
    }

    #[test]
    fn path_outside_workspace_denied() {
        let workspace = tempfile::TempDir::new().unwrap();
        let outside = tempfile::TempDir::new().unwrap();
        let policy = SecurityPolicy::new(PermissionMode::Auto, Some(workspace.path().to_path_buf()), vec![], 60, 100);
        let target = outside.path().join("file.txt");
        std::fs::write(&target, "x").unwrap();
        assert!(matches!(policy.validate_path(&target), PolicyDecision::Denied(_)));
    }

    #[test]
    fn audit_log_records_entries() {
        let p = policy(PermissionMode::Ask);
        p.log_action("shell", serde_json::json!({"command": "ls"}), RiskLevel::Low, "allowed", Some("ok"));
        let log = p.audit_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tool_name, "shell");
    }
}
