//! Per-phase progress journal.
//!
//! The journal is a completed-task set (for skip-on-restart) plus an
//! append-only failed-task log (for post-mortems). It is advisory: the
//! store's uniqueness constraints make re-ingestion idempotent, so a lost
//! journal costs time, never correctness. Writes are temp-file-then-rename
//! so a crash can never leave a half-written file behind.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_key: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub completed_tasks: BTreeSet<String>,
    pub failed_tasks: Vec<FailedTask>,
    pub total_records: u64,
}

impl PhaseProgress {
    fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            started_at: None,
            last_updated: None,
            completed_tasks: BTreeSet::new(),
            failed_tasks: Vec::new(),
            total_records: 0,
        }
    }
}

pub struct ProgressJournal {
    path: PathBuf,
    progress: PhaseProgress,
}

impl ProgressJournal {
    /// Load the journal for a phase, starting fresh when the file is absent
    /// or in an unreadable (e.g. legacy) shape.
    pub fn open(dir: &Path, phase: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{phase}.json"));
        let progress = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PhaseProgress>(&content) {
                Ok(progress) => progress,
                Err(e) => {
                    warn!(
                        phase,
                        error = %e,
                        "Progress file unreadable (legacy shape?), starting phase fresh"
                    );
                    PhaseProgress::new(phase)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => PhaseProgress::new(phase),
            Err(e) => return Err(e),
        };
        Ok(Self { path, progress })
    }

    pub fn is_completed(&self, task_key: &str) -> bool {
        self.progress.completed_tasks.contains(task_key)
    }

    pub fn completed_count(&self) -> usize {
        self.progress.completed_tasks.len()
    }

    pub fn failed_count(&self) -> usize {
        self.progress.failed_tasks.len()
    }

    pub fn total_records(&self) -> u64 {
        self.progress.total_records
    }

    pub fn mark_started(&mut self) -> io::Result<()> {
        if self.progress.started_at.is_none() {
            self.progress.started_at = Some(Utc::now());
        }
        self.persist()
    }

    /// Record a committed task. Call only after the store acknowledged the
    /// batch; the journal must never advertise uncommitted work.
    pub fn mark_completed(&mut self, task_key: &str, records: u64) -> io::Result<()> {
        self.progress.completed_tasks.insert(task_key.to_string());
        self.progress.total_records += records;
        self.persist()
    }

    pub fn mark_failed(&mut self, task_key: &str, error: &str) -> io::Result<()> {
        self.progress.failed_tasks.push(FailedTask {
            task_key: task_key.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        self.persist()
    }

    fn persist(&mut self) -> io::Result<()> {
        self.progress.last_updated = Some(Utc::now());
        let body = serde_json::to_string_pretty(&self.progress)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut journal = ProgressJournal::open(dir.path(), "phase1").unwrap();
            journal.mark_started().unwrap();
            journal
                .mark_completed("EUS-MAN|WEEKDAY|2024-12-01|2024-12-07", 42)
                .unwrap();
            journal.mark_failed("EUS-MAN|SATURDAY|2024-12-01|2024-12-07", "HTTP 400").unwrap();
        }
        let journal = ProgressJournal::open(dir.path(), "phase1").unwrap();
        assert!(journal.is_completed("EUS-MAN|WEEKDAY|2024-12-01|2024-12-07"));
        assert!(!journal.is_completed("EUS-MAN|SUNDAY|2024-12-01|2024-12-07"));
        assert_eq!(journal.completed_count(), 1);
        assert_eq!(journal.failed_count(), 1);
        assert_eq!(journal.total_records(), 42);
    }

    #[test]
    fn no_temp_file_left_after_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = ProgressJournal::open(dir.path(), "phase1").unwrap();
        journal.mark_completed("task", 1).unwrap();
        assert!(dir.path().join("phase1.json").exists());
        assert!(!dir.path().join("phase1.json.tmp").exists());
    }

    #[test]
    fn legacy_shape_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        // Old route-level progress shape, not task-level.
        std::fs::write(
            dir.path().join("phase1.json"),
            r#"{"completed_routes": ["EUS-MAN"], "total_records": 10}"#,
        )
        .unwrap();
        let journal = ProgressJournal::open(dir.path(), "phase1").unwrap();
        assert_eq!(journal.completed_count(), 0);
        assert_eq!(journal.total_records(), 0);
    }

    #[test]
    fn duplicate_completion_is_idempotent_for_the_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = ProgressJournal::open(dir.path(), "phase1").unwrap();
        journal.mark_completed("task", 5).unwrap();
        journal.mark_completed("task", 5).unwrap();
        assert_eq!(journal.completed_count(), 1);
    }
}
