//! Run persistence and resume
//!
//! An [`ExecutionState`] is saved at every phase boundary and always before
//! a reboot is requested. The next invocation restores it and continues at
//! `current_phase_index`, which only ever points past fully completed
//! phases.
//!
//! Two backends exist: [`FileStateStore`] (one JSON file per run, written
//! atomically) and [`MemoryStateStore`] for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::bus::MessageBus;
use crate::dialog::Question;
use crate::error::PersistError;
use crate::halt::Inhibitor;

/// Persisted state file format version
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Where a run stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    /// Phases are executing, or the process died mid-phase
    Running,
    /// State saved before a reboot; resumes at `next_phase`
    AwaitingReboot { next_phase: Option<String> },
    /// Stopped on request after a phase; resumes at `next_phase`
    Paused { next_phase: Option<String> },
    /// Cancelled by the operator while `phase` was running
    Interrupted { phase: String },
    /// A checkpoint found inhibiting reports
    Halted { inhibitors: Vec<Inhibitor> },
    /// A fatal error aborted the run
    Failed {
        actor: Option<String>,
        phase: String,
        error: String,
    },
    /// Every phase ran
    Completed,
}

impl RunStatus {
    /// Whether the run can never continue
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Halted { .. } | Self::Failed { .. } | Self::Completed
        )
    }

    /// Whether a later invocation may pick the run up
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::AwaitingReboot {
                next_phase: Some(p),
            } => write!(f, "awaiting reboot, resumes at {p}"),
            Self::AwaitingReboot { next_phase: None } => write!(f, "awaiting reboot"),
            Self::Paused {
                next_phase: Some(p),
            } => write!(f, "paused, resumes at {p}"),
            Self::Paused { next_phase: None } => write!(f, "paused"),
            Self::Interrupted { phase } => write!(f, "interrupted during {phase}"),
            Self::Halted { inhibitors } => {
                write!(f, "halted by {} inhibitor(s)", inhibitors.len())
            }
            Self::Failed {
                actor: Some(actor),
                phase,
                error,
            } => write!(f, "failed in {phase} ({actor}): {error}"),
            Self::Failed {
                actor: None,
                phase,
                error,
            } => write!(f, "failed in {phase}: {error}"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Everything needed to continue a run in a new process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// State file format version
    pub version: u32,
    /// Time-ordered run identifier (ULID)
    pub run_id: String,
    /// Workflow name
    pub workflow: String,
    /// When the run was created
    pub started_at: DateTime<Utc>,
    /// Last time the state was saved
    pub updated_at: DateTime<Utc>,
    /// First phase that has not completed
    pub current_phase_index: usize,
    /// Run status
    pub status: RunStatus,
    /// Every message produced so far
    pub messages: MessageBus,
    /// Dialog answers keyed by question id
    #[serde(default)]
    pub dialog_answers: BTreeMap<String, Value>,
    /// Questions asked without an answer
    #[serde(default)]
    pub pending_questions: Vec<Question>,
    /// Experimental actors enabled when the run was created
    #[serde(default)]
    pub enabled_experimental: BTreeSet<String>,
}

impl ExecutionState {
    /// Fresh state for a new run of `workflow`
    #[must_use]
    pub fn new(workflow: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_FORMAT_VERSION,
            run_id: Ulid::new().to_string(),
            workflow: workflow.into(),
            started_at: now,
            updated_at: now,
            current_phase_index: 0,
            status: RunStatus::Running,
            messages: MessageBus::new(),
            dialog_answers: BTreeMap::new(),
            pending_questions: Vec::new(),
            enabled_experimental: BTreeSet::new(),
        }
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record an answer and drop the matching pending question
    pub fn record_answer(&mut self, question_id: impl Into<String>, value: Value) {
        let question_id = question_id.into();
        self.pending_questions.retain(|q| q.id != question_id);
        self.dialog_answers.insert(question_id, value);
    }

    /// Record questions without duplicating ids
    pub fn record_questions(&mut self, questions: impl IntoIterator<Item = Question>) {
        for question in questions {
            if !self.pending_questions.iter().any(|q| q.id == question.id) {
                self.pending_questions.push(question);
            }
        }
    }

    /// One-line description for listings
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let summary = match &self.status {
            RunStatus::Halted { inhibitors } => {
                let titles: Vec<&str> = inhibitors.iter().map(|i| i.title.as_str()).collect();
                format!("{}: {}", self.status, titles.join("; "))
            }
            status => status.to_string(),
        };

        RunSummary {
            run_id: self.run_id.clone(),
            workflow: self.workflow.clone(),
            started_at: self.started_at,
            updated_at: self.updated_at,
            status: self.status.clone(),
            pending_questions: self.pending_questions.len(),
            summary,
        }
    }
}

/// Listing entry for a persisted run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: String,
    /// Workflow name
    pub workflow: String,
    /// When the run was created
    pub started_at: DateTime<Utc>,
    /// Last save
    pub updated_at: DateTime<Utc>,
    /// Run status
    pub status: RunStatus,
    /// Number of unanswered questions
    pub pending_questions: usize,
    /// Human-readable summary; halted runs list the inhibitor titles
    pub summary: String,
}

/// Storage backend for execution states
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a state, replacing any previous version of the run
    async fn save(&self, state: &ExecutionState) -> Result<(), PersistError>;

    /// Load a run
    async fn load(&self, run_id: &str) -> Result<ExecutionState, PersistError>;

    /// Load every readable run
    async fn list(&self) -> Result<Vec<ExecutionState>, PersistError>;

    /// Remove a run
    async fn delete(&self, run_id: &str) -> Result<(), PersistError>;

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

fn encode(state: &ExecutionState) -> Result<String, PersistError> {
    serde_json::to_string_pretty(state).map_err(|e| PersistError::Serialization(e.to_string()))
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

fn decode(run_id: &str, content: &str) -> Result<ExecutionState, PersistError> {
    let corrupted = |reason: String| PersistError::Corrupted {
        run_id: run_id.to_string(),
        reason,
    };

    let probe: VersionProbe = serde_json::from_str(content).map_err(|e| corrupted(e.to_string()))?;
    if probe.version != STATE_FORMAT_VERSION {
        return Err(corrupted(format!(
            "format version {} is not supported (expected {STATE_FORMAT_VERSION})",
            probe.version
        )));
    }

    let state: ExecutionState =
        serde_json::from_str(content).map_err(|e| corrupted(e.to_string()))?;
    if state.run_id != run_id {
        return Err(corrupted(format!("file holds run {}", state.run_id)));
    }
    Ok(state)
}

/// One JSON file per run under a directory
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Store rooted at `dir`; the directory is created on first save
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// State directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf, PersistError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistError::NotFound(run_id.to_string()));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }
}

fn io_error(path: &Path, error: &std::io::Error) -> PersistError {
    PersistError::Io(format!("{}: {error}", path.display()))
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, state: &ExecutionState) -> Result<(), PersistError> {
        let path = self.path_for(&state.run_id)?;
        let content = encode(state)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, &e))?;

        // Write to a temp file, flush to disk, then rename over the old state
        let tmp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| io_error(&tmp_path, &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| io_error(&tmp_path, &e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error(&tmp_path, &e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| io_error(&path, &e))?;

        debug!(
            path = %path.display(),
            run_id = %state.run_id,
            phase_index = state.current_phase_index,
            messages = state.messages.len(),
            "saved run state"
        );
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<ExecutionState, PersistError> {
        let path = self.path_for(run_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistError::NotFound(run_id.to_string()));
            }
            Err(e) => return Err(io_error(&path, &e)),
        };
        decode(run_id, &content)
    }

    async fn list(&self) -> Result<Vec<ExecutionState>, PersistError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, &e)),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, &e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match self.load(run_id).await {
                Ok(state) => states.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable run state"),
            }
        }

        states.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(states)
    }

    async fn delete(&self, run_id: &str) -> Result<(), PersistError> {
        let path = self.path_for(run_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PersistError::NotFound(run_id.to_string()))
            }
            Err(e) => Err(io_error(&path, &e)),
        }
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

/// In-process store; keeps encoded JSON so the file format is exercised
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    runs: Mutex<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the raw stored document of a run
    pub async fn insert_raw(&self, run_id: impl Into<String>, content: impl Into<String>) {
        self.runs.lock().await.insert(run_id.into(), content.into());
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, state: &ExecutionState) -> Result<(), PersistError> {
        let content = encode(state)?;
        self.runs.lock().await.insert(state.run_id.clone(), content);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<ExecutionState, PersistError> {
        let runs = self.runs.lock().await;
        let content = runs
            .get(run_id)
            .ok_or_else(|| PersistError::NotFound(run_id.to_string()))?;
        decode(run_id, content)
    }

    async fn list(&self) -> Result<Vec<ExecutionState>, PersistError> {
        let runs = self.runs.lock().await;
        Ok(runs
            .iter()
            .filter_map(|(run_id, content)| match decode(run_id, content) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "skipping unreadable run state");
                    None
                }
            })
            .collect())
    }

    async fn delete(&self, run_id: &str) -> Result<(), PersistError> {
        self.runs
            .lock()
            .await
            .remove(run_id)
            .map(|_| ())
            .ok_or_else(|| PersistError::NotFound(run_id.to_string()))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Front end over a [`StateStore`]
#[derive(Clone)]
pub struct ResumeManager {
    store: Arc<dyn StateStore>,
}

impl ResumeManager {
    /// Create a manager over `store`
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Manager over a fresh in-memory store
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStateStore::new()))
    }

    /// Persist a state
    ///
    /// # Errors
    /// Returns an error if the backend fails
    pub async fn snapshot(&self, state: &ExecutionState) -> Result<(), PersistError> {
        self.store.save(state).await?;
        debug!(
            backend = self.store.backend(),
            run_id = %state.run_id,
            status = %state.status,
            "snapshot written"
        );
        Ok(())
    }

    /// Load a run
    ///
    /// # Errors
    /// Returns `PersistError::NotFound` for unknown runs and
    /// `PersistError::Corrupted` for unreadable ones
    pub async fn restore(&self, run_id: &str) -> Result<ExecutionState, PersistError> {
        let state = self.store.load(run_id).await?;
        info!(
            run_id = %state.run_id,
            phase_index = state.current_phase_index,
            messages = state.messages.len(),
            status = %state.status,
            "restored run state"
        );
        Ok(state)
    }

    /// Summaries of all runs, oldest first
    ///
    /// # Errors
    /// Returns an error if the backend cannot be listed
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>, PersistError> {
        let mut states = self.store.list().await?;
        states.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(states.iter().map(ExecutionState::summary).collect())
    }

    /// Remove a run
    ///
    /// # Errors
    /// Returns `PersistError::NotFound` for unknown runs
    pub async fn delete(&self, run_id: &str) -> Result<(), PersistError> {
        self.store.delete(run_id).await?;
        info!(run_id = %run_id, "deleted run state");
        Ok(())
    }

    /// Delete terminal runs last saved before `now - older_than`
    ///
    /// Resumable runs are kept regardless of age. Returns the deleted ids.
    ///
    /// # Errors
    /// Returns an error if the backend fails
    pub async fn prune(&self, older_than: chrono::Duration) -> Result<Vec<String>, PersistError> {
        let cutoff = Utc::now() - older_than;
        let mut pruned = Vec::new();

        for state in self.store.list().await? {
            if state.status.is_terminal() && state.updated_at < cutoff {
                self.store.delete(&state.run_id).await?;
                pruned.push(state.run_id);
            }
        }

        if !pruned.is_empty() {
            info!(count = pruned.len(), "pruned old runs");
        }
        Ok(pruned)
    }

    /// Most recent resumable run of `workflow`
    ///
    /// # Errors
    /// Returns an error if the backend cannot be listed
    pub async fn latest_resumable(
        &self,
        workflow: &str,
    ) -> Result<Option<ExecutionState>, PersistError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| s.workflow == workflow && s.status.is_resumable())
            .max_by(|a, b| a.run_id.cmp(&b.run_id)))
    }

    /// Store an answer for the next invocation of a run
    ///
    /// # Errors
    /// Returns an error if the run cannot be loaded or saved
    pub async fn answer(
        &self,
        run_id: &str,
        question_id: &str,
        value: Value,
    ) -> Result<(), PersistError> {
        let mut state = self.store.load(run_id).await?;
        state.record_answer(question_id, value);
        state.touch();
        self.store.save(&state).await?;
        info!(run_id = %run_id, question = %question_id, "recorded answer");
        Ok(())
    }
}

impl fmt::Debug for ResumeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeManager")
            .field("backend", &self.store.backend())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn state_with_messages() -> ExecutionState {
        let mut state = ExecutionState::new("ipu");
        state.messages.produce("a", "facts", "M1", json!({"n": 1}));
        state.messages.produce("b", "facts", "M2", json!({"n": 2}));
        state.current_phase_index = 1;
        state.status = RunStatus::AwaitingReboot {
            next_phase: Some("checks".into()),
        };
        state
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state"));
        let state = state_with_messages();

        store.save(&state).await.unwrap();
        let loaded = store.load(&state.run_id).await.unwrap();

        assert_eq!(loaded, state);
        assert!(!dir.path().join("state").join(format!("{}.json.tmp", state.run_id)).exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        let err = store.load("01J0000000000000000000000").await.unwrap_err();
        assert!(matches!(err, PersistError::NotFound(_)));

        let err = store.load("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, PersistError::NotFound(_)));

        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let err = store.load("broken").await.unwrap_err();
        assert!(matches!(err, PersistError::Corrupted { .. }));

        // Listing skips the broken file
        store.save(&state_with_messages()).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_corruption() {
        let store = MemoryStateStore::new();
        let mut state = state_with_messages();
        state.version = STATE_FORMAT_VERSION + 1;
        store.save(&state).await.unwrap();

        let err = store.load(&state.run_id).await.unwrap_err();
        assert!(
            matches!(err, PersistError::Corrupted { reason, .. } if reason.contains("format version"))
        );
    }

    #[tokio::test]
    async fn test_list_runs_is_ordered_and_summarised() {
        let manager = ResumeManager::in_memory();

        let mut first = ExecutionState::new("ipu");
        first.status = RunStatus::Halted {
            inhibitors: vec![Inhibitor {
                seq: 3,
                producer: "checker".into(),
                phase: "checks".into(),
                severity: None,
                title: "Unsupported driver".into(),
                summary: "s".into(),
                remediation: None,
            }],
        };
        manager.snapshot(&first).await.unwrap();

        let second = ExecutionState::new("ipu");
        manager.snapshot(&second).await.unwrap();

        let runs = manager.list_runs().await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, first.run_id);
        assert!(runs[0].summary.contains("Unsupported driver"));
        assert_eq!(runs[1].summary, "running");
    }

    #[tokio::test]
    async fn test_latest_resumable_skips_terminal_runs() {
        let manager = ResumeManager::in_memory();

        let paused = state_with_messages();
        manager.snapshot(&paused).await.unwrap();

        let mut done = ExecutionState::new("ipu");
        done.status = RunStatus::Completed;
        manager.snapshot(&done).await.unwrap();

        let latest = manager.latest_resumable("ipu").await.unwrap().unwrap();
        assert_eq!(latest.run_id, paused.run_id);
        assert!(manager.latest_resumable("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_resumable_runs() {
        let manager = ResumeManager::in_memory();

        let mut old = ExecutionState::new("ipu");
        old.status = RunStatus::Completed;
        old.updated_at = Utc::now() - chrono::Duration::days(30);
        manager.snapshot(&old).await.unwrap();

        let mut stale_but_resumable = state_with_messages();
        stale_but_resumable.updated_at = Utc::now() - chrono::Duration::days(30);
        manager.snapshot(&stale_but_resumable).await.unwrap();

        let pruned = manager.prune(chrono::Duration::days(7)).await.unwrap();
        assert_eq!(pruned, vec![old.run_id.clone()]);
        assert_eq!(manager.list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_clears_pending_question() {
        let manager = ResumeManager::in_memory();
        let mut state = state_with_messages();
        state.record_questions([Question {
            id: "remove_pam_pkcs11".into(),
            prompt: "Remove pam_pkcs11?".into(),
            asked_by: "pam_check".into(),
        }]);
        manager.snapshot(&state).await.unwrap();

        manager
            .answer(&state.run_id, "remove_pam_pkcs11", json!(true))
            .await
            .unwrap();

        let restored = manager.restore(&state.run_id).await.unwrap();
        assert!(restored.pending_questions.is_empty());
        assert_eq!(restored.dialog_answers["remove_pam_pkcs11"], json!(true));

        let err = manager.answer("missing", "q", json!(1)).await.unwrap_err();
        assert_eq!(err, PersistError::NotFound("missing".into()));
    }
}
