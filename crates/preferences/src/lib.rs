//! Preference Store (C2): learns per-user approve/deny patterns and
//! persists them to disk.
//!
//! Persistence is a single JSON document per the wire schema in §6,
//! written by a single owner task using atomic replace (write to a sibling
//! temp file, then rename over the target) — the file is never corrupted
//! by a partial write.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use {
    chrono::{DateTime, Utc},
    fd_lock::RwLock as FileRwLock,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tracing::{info, warn},
};

const MAX_APPROVAL_HISTORY: usize = 1000;
const PATTERN_MIN_SAMPLES: u64 = 3;
const PATTERN_APPROVE_THRESHOLD: f64 = 0.8;
const PATTERN_DENY_THRESHOLD: f64 = 0.2;

/// Keyed by (user id, command fingerprint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferenceEntry {
    pub command: String,
    pub approved: bool,
    pub note: String,
    pub learned_at: DateTime<Utc>,
    pub usage_count: u64,
}

/// Keyed by (user id, head-command token); tracks counts for probabilistic
/// matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub approved: u64,
    pub rejected: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalHistoryEntry {
    pub user_id: String,
    pub command: String,
    pub approved: bool,
    pub note: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of [`PreferenceStore::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum PreferenceLookup {
    AlwaysApprove { confidence: f64, evidence: String },
    AlwaysDeny { confidence: f64, evidence: String },
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedDocument {
    #[serde(default)]
    preferences: HashMap<String, HashMap<String, UserPreferenceEntry>>,
    #[serde(default)]
    command_patterns: HashMap<String, HashMap<String, PatternEntry>>,
    #[serde(default)]
    approval_history: Vec<ApprovalHistoryEntry>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// Aggregate statistics for a single user (§ original_source supplement —
/// `get_user_statistics`).
#[derive(Debug, Clone, Serialize)]
pub struct UserStatistics {
    pub total_preferences: usize,
    pub approved_count: usize,
    pub rejected_count: usize,
    pub approval_rate: f64,
    pub most_common_commands: Vec<(String, usize)>,
    pub learned_patterns: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Aggregate statistics across all users (supplement — `get_global_statistics`).
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatistics {
    pub total_users: usize,
    pub total_preferences: usize,
    pub total_patterns: usize,
    pub total_approval_history: usize,
    pub most_common_commands_global: Vec<(String, usize)>,
    pub average_preferences_per_user: f64,
}

/// In-memory preference state with disk persistence. Mutating methods take
/// `&mut self` — callers serialize access through a single owner (§5).
pub struct PreferenceStore {
    path: PathBuf,
    doc: PersistedDocument,
}

impl PreferenceStore {
    /// Load preferences from `path`. A missing or unreadable file falls
    /// back to empty state — load failure is never fatal (§4.2).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = read_document(&path).unwrap_or_else(|err| {
            if path.exists() {
                warn!(path = %path.display(), error = %err, "failed to load preferences, starting empty");
            } else {
                info!("no existing preferences file found");
            }
            PersistedDocument::default()
        });
        Self { path, doc }
    }

    /// Write the current state atomically: a sibling temp file is written
    /// then renamed over the target, guarded by an `fd-lock` so concurrent
    /// writers within the process can't interleave.
    pub fn save(&mut self) -> anyhow::Result<()> {
        self.doc.last_updated = Some(Utc::now());
        if self.doc.approval_history.len() > MAX_APPROVAL_HISTORY {
            let excess = self.doc.approval_history.len() - MAX_APPROVAL_HISTORY;
            self.doc.approval_history.drain(0..excess);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let tmp_file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        let mut lock = FileRwLock::new(tmp_file);
        {
            let mut guard = lock.write().map_err(|e| anyhow::anyhow!("lock preferences temp file: {e}"))?;
            serde_json::to_writer_pretty(&mut *guard, &self.doc)?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        info!(path = %self.path.display(), "preferences saved");
        Ok(())
    }

    /// Exact fingerprint first; falls back to head-command-token pattern
    /// statistics (§4.2).
    #[must_use]
    pub fn lookup(&self, user_id: &str, command: &str) -> PreferenceLookup {
        let fp = fingerprint(command);
        if let Some(entry) = self.doc.preferences.get(user_id).and_then(|m| m.get(&fp)) {
            return if entry.approved {
                PreferenceLookup::AlwaysApprove { confidence: 1.0, evidence: format!("exact match for '{command}'") }
            } else {
                PreferenceLookup::AlwaysDeny { confidence: 1.0, evidence: format!("exact match for '{command}'") }
            };
        }

        let Some(main) = extract_main_command(command) else {
            return PreferenceLookup::None;
        };
        let Some(pattern) = self.doc.command_patterns.get(user_id).and_then(|m| m.get(main)) else {
            return PreferenceLookup::None;
        };

        if pattern.total < PATTERN_MIN_SAMPLES {
            return PreferenceLookup::None;
        }

        let rate = pattern.approved as f64 / pattern.total as f64;
        let evidence = format!("pattern match for '{main}' ({} examples)", pattern.total);
        if rate >= PATTERN_APPROVE_THRESHOLD {
            PreferenceLookup::AlwaysApprove { confidence: rate, evidence }
        } else if rate <= PATTERN_DENY_THRESHOLD {
            PreferenceLookup::AlwaysDeny { confidence: 1.0 - rate, evidence }
        } else {
            PreferenceLookup::None
        }
    }

    /// Record an approve/deny decision: updates the fingerprint map
    /// (including usage count), the pattern counters, and appends to the
    /// approval history ring.
    pub fn learn(&mut self, user_id: &str, command: &str, approved: bool, note: &str) {
        let fp = fingerprint(command);
        let user_prefs = self.doc.preferences.entry(user_id.to_string()).or_default();
        let usage_count = user_prefs.get(&fp).map_or(0, |e| e.usage_count) + 1;
        user_prefs.insert(
            fp,
            UserPreferenceEntry {
                command: command.to_string(),
                approved,
                note: note.to_string(),
                learned_at: Utc::now(),
                usage_count,
            },
        );

        if let Some(main) = extract_main_command(command) {
            let pattern = self.doc.command_patterns.entry(user_id.to_string()).or_default().entry(main.to_string()).or_default();
            if approved {
                pattern.approved += 1;
            } else {
                pattern.rejected += 1;
            }
            pattern.total += 1;
        }

        self.doc.approval_history.push(ApprovalHistoryEntry {
            user_id: user_id.to_string(),
            command: command.to_string(),
            approved,
            note: note.to_string(),
            timestamp: Utc::now(),
        });
    }

    #[must_use]
    pub fn stats(&self, user_id: &str) -> UserStatistics {
        let empty = HashMap::new();
        let user_prefs = self.doc.preferences.get(user_id).unwrap_or(&empty);
        let user_patterns = self.doc.command_patterns.get(user_id).map_or(0, HashMap::len);

        let approved_count = user_prefs.values().filter(|e| e.approved).count();
        let rejected_count = user_prefs.len() - approved_count;

        let mut command_counts: HashMap<String, usize> = HashMap::new();
        for entry in user_prefs.values() {
            let main = extract_main_command(&entry.command).unwrap_or("").to_string();
            *command_counts.entry(main).or_default() += 1;
        }
        let mut most_common: Vec<(String, usize)> = command_counts.into_iter().collect();
        most_common.sort_by(|a, b| b.1.cmp(&a.1));
        most_common.truncate(10);

        let last_activity = user_prefs.values().map(|e| e.learned_at).max();

        UserStatistics {
            total_preferences: user_prefs.len(),
            approved_count,
            rejected_count,
            approval_rate: if user_prefs.is_empty() { 0.0 } else { approved_count as f64 / user_prefs.len() as f64 },
            most_common_commands: most_common,
            learned_patterns: user_patterns,
            last_activity,
        }
    }

    #[must_use]
    pub fn global_stats(&self) -> GlobalStatistics {
        let total_users = self.doc.preferences.len();
        let total_preferences: usize = self.doc.preferences.values().map(HashMap::len).sum();
        let total_patterns: usize = self.doc.command_patterns.values().map(HashMap::len).sum();

        let mut all_commands: HashMap<String, usize> = HashMap::new();
        for user_prefs in self.doc.preferences.values() {
            for entry in user_prefs.values() {
                let main = extract_main_command(&entry.command).unwrap_or("").to_string();
                *all_commands.entry(main).or_default() += 1;
            }
        }
        let mut most_common_global: Vec<(String, usize)> = all_commands.into_iter().collect();
        most_common_global.sort_by(|a, b| b.1.cmp(&a.1));
        most_common_global.truncate(10);

        GlobalStatistics {
            total_users,
            total_preferences,
            total_patterns,
            total_approval_history: self.doc.approval_history.len(),
            most_common_commands_global: most_common_global,
            average_preferences_per_user: if total_users == 0 { 0.0 } else { total_preferences as f64 / total_users as f64 },
        }
    }

    pub fn clear_user(&mut self, user_id: &str) {
        self.doc.preferences.remove(user_id);
        self.doc.command_patterns.remove(user_id);
        self.doc.approval_history.retain(|e| e.user_id != user_id);
    }

    /// Export a user's preferences and patterns as a standalone document.
    #[must_use]
    pub fn export_user(&self, user_id: &str) -> ExportedUser {
        ExportedUser {
            user_id: user_id.to_string(),
            preferences: self.doc.preferences.get(user_id).cloned().unwrap_or_default(),
            patterns: self.doc.command_patterns.get(user_id).cloned().unwrap_or_default(),
            exported_at: Utc::now(),
        }
    }

    /// Merge an exported user document back in (overwrites matching keys).
    pub fn import_user(&mut self, exported: ExportedUser) {
        self.doc.preferences.entry(exported.user_id.clone()).or_default().extend(exported.preferences);
        self.doc.command_patterns.entry(exported.user_id).or_default().extend(exported.patterns);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedUser {
    pub user_id: String,
    pub preferences: HashMap<String, UserPreferenceEntry>,
    pub patterns: HashMap<String, PatternEntry>,
    pub exported_at: DateTime<Utc>,
}

fn read_document(path: &Path) -> anyhow::Result<PersistedDocument> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// SHA-256 of the whitespace-normalized command, first 16 hex chars.
/// Stable under arbitrary inner whitespace (invariant I6).
#[must_use]
pub fn fingerprint(command: &str) -> String {
    let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

fn extract_main_command(command: &str) -> Option<&str> {
    let mut cmd = command.trim();
    if let Some(rest) = cmd.strip_prefix("sudo ") {
        cmd = rest.trim_start();
    }
    if let Some(idx) = cmd.find('|') {
        cmd = cmd[..idx].trim();
    }
    for redirect in ["<", ">>", ">"] {
        if let Some(idx) = cmd.find(redirect) {
            cmd = cmd[..idx].trim();
        }
    }
    cmd.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_stable_under_whitespace() {
        assert_eq!(fingerprint("ls   -la"), fingerprint("ls -la"));
    }

    #[test]
    fn lookup_exact_fingerprint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = PreferenceStore::load(dir.path().join("preferences.json"));
        store.learn("alice", "rm file.txt", true, "");
        assert_eq!(
            store.lookup("alice", "rm file.txt"),
            PreferenceLookup::AlwaysApprove { confidence: 1.0, evidence: "exact match for 'rm file.txt'".into() }
        );
    }

    #[test]
    fn pattern_threshold_exactly_at_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = PreferenceStore::load(dir.path().join("preferences.json"));
        for i in 0..3 {
            store.learn("bob", &format!("pip install pkg{i}"), true, "");
        }
        match store.lookup("bob", "pip install other") {
            PreferenceLookup::AlwaysApprove { confidence, .. } => assert_eq!(confidence, 1.0),
            other => panic!("expected always_approve, got {other:?}"),
        }
    }

    #[test]
    fn pattern_all_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = PreferenceStore::load(dir.path().join("preferences.json"));
        for i in 0..3 {
            store.learn("carol", &format!("rm file{i}.txt"), false, "");
        }
        match store.lookup("carol", "rm other.txt") {
            PreferenceLookup::AlwaysDeny { .. } => {},
            other => panic!("expected always_deny, got {other:?}"),
        }
    }

    #[test]
    fn pattern_below_threshold_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = PreferenceStore::load(dir.path().join("preferences.json"));
        store.learn("dave", "rm a.txt", true, "");
        store.learn("dave", "rm b.txt", true, "");
        assert_eq!(store.lookup("dave", "rm c.txt"), PreferenceLookup::None);
    }

    #[test]
    fn mixed_rate_in_middle_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = PreferenceStore::load(dir.path().join("preferences.json"));
        store.learn("erin", "mv a b", true, "");
        store.learn("erin", "mv b c", true, "");
        store.learn("erin", "mv c d", false, "");
        let lookup = store.lookup("erin", "mv d e");
        assert_eq!(lookup, PreferenceLookup::None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("preferences.json");
        let mut store = PreferenceStore::load(&path);
        store.learn("frank", "ls -la", true, "trusted");
        store.save().expect("save");

        let reloaded = PreferenceStore::load(&path);
        assert_eq!(reloaded.lookup("frank", "ls -la"), store.lookup("frank", "ls -la"));
    }

    #[test]
    fn export_then_import_reproduces_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut source = PreferenceStore::load(dir.path().join("a.json"));
        source.learn("gina", "npm install left-pad", true, "");
        source.learn("gina", "npm install left-pad", true, "");

        let exported = source.export_user("gina");

        let mut target = PreferenceStore::load(dir.path().join("b.json"));
        target.import_user(exported);

        assert_eq!(target.doc.preferences.get("gina"), source.doc.preferences.get("gina"));
        assert_eq!(target.doc.command_patterns.get("gina"), source.doc.command_patterns.get("gina"));
    }

    #[test]
    fn clear_user_removes_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = PreferenceStore::load(dir.path().join("preferences.json"));
        store.learn("hank", "ls", true, "");
        store.clear_user("hank");
        assert_eq!(store.lookup("hank", "ls"), PreferenceLookup::None);
        assert_eq!(store.stats("hank").total_preferences, 0);
    }

    #[test]
    fn missing_file_loads_empty_without_error() {
        let store = PreferenceStore::load("/nonexistent/opsentry-test/preferences.json");
        assert_eq!(store.lookup("anyone", "ls"), PreferenceLookup::None);
    }
}
