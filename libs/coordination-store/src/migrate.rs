//! Stepwise schema migration with a persisted journal.
//!
//! The migration tool applies the schema statement list one statement at a
//! time and records progress in a JSON journal, so an interrupted run can be
//! resumed exactly where it stopped.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::schema::SchemaConfig;

/// Journal lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    NotStarted,
    InProgress,
    Completed,
}

/// Persisted migration journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJournal {
    pub version: u32,
    pub status: MigrationStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub worktree: Option<String>,
    /// Names of statements already applied, in order.
    #[serde(default)]
    pub checkpoints: Vec<String>,
    /// Names of all statements this migration will apply.
    #[serde(default)]
    pub transformations: Vec<String>,
}

impl MigrationJournal {
    pub fn load(path: &Path) -> StoreResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Journal(format!("cannot read journal {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Journal(format!("malformed journal: {}", e)))
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).map_err(|e| {
            StoreError::Journal(format!("cannot write journal {}: {}", path.display(), e))
        })
    }

    /// Next statement name to apply, if any.
    pub fn next_pending(&self) -> Option<&str> {
        self.transformations
            .iter()
            .find(|t| !self.checkpoints.contains(t))
            .map(String::as_str)
    }
}

/// Outcome of one `step` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Applied the named statement; more remain.
    Applied(String),
    /// Applied the named statement and the migration is now complete.
    Finished(String),
    /// Nothing left to apply.
    AlreadyComplete,
}

/// Applies the coordination schema one checkpointed statement at a time.
pub struct Migrator {
    schema: SchemaConfig,
    journal_path: PathBuf,
}

impl Migrator {
    pub fn new(schema: SchemaConfig, journal_path: impl Into<PathBuf>) -> Self {
        Self {
            schema,
            journal_path: journal_path.into(),
        }
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Create a fresh journal. Fails if one already exists.
    pub fn init(&self) -> StoreResult<MigrationJournal> {
        if self.journal_path.exists() {
            return Err(StoreError::Journal(format!(
                "journal {} already exists; use step or resume",
                self.journal_path.display()
            )));
        }
        let journal = MigrationJournal {
            version: 1,
            status: MigrationStatus::NotStarted,
            worktree: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
            checkpoints: Vec::new(),
            transformations: self
                .schema
                .statements()
                .iter()
                .map(|s| s.name.to_string())
                .collect(),
        };
        journal.save(&self.journal_path)?;
        info!(journal = %self.journal_path.display(), "Migration journal initialized");
        Ok(journal)
    }

    /// Apply the next pending statement and checkpoint it.
    pub async fn step(&self, pool: &PgPool) -> StoreResult<StepOutcome> {
        let mut journal = MigrationJournal::load(&self.journal_path)?;
        let pending = match journal.next_pending() {
            Some(name) => name.to_string(),
            None => {
                if journal.status != MigrationStatus::Completed {
                    journal.status = MigrationStatus::Completed;
                    journal.save(&self.journal_path)?;
                }
                return Ok(StepOutcome::AlreadyComplete);
            }
        };

        let statement = self
            .schema
            .statements()
            .into_iter()
            .find(|s| s.name == pending)
            .ok_or_else(|| {
                StoreError::Journal(format!(
                    "journal references unknown transformation {}",
                    pending
                ))
            })?;

        sqlx::query(&statement.sql).execute(pool).await?;

        journal.checkpoints.push(pending.clone());
        let finished = journal.next_pending().is_none();
        journal.status = if finished {
            MigrationStatus::Completed
        } else {
            MigrationStatus::InProgress
        };
        journal.save(&self.journal_path)?;
        info!(statement = %pending, finished, "Migration step applied");

        Ok(if finished {
            StepOutcome::Finished(pending)
        } else {
            StepOutcome::Applied(pending)
        })
    }

    /// Step until the journal is complete.
    pub async fn resume(&self, pool: &PgPool) -> StoreResult<usize> {
        let mut applied = 0;
        loop {
            match self.step(pool).await? {
                StepOutcome::Applied(_) => applied += 1,
                StepOutcome::Finished(_) => {
                    applied += 1;
                    return Ok(applied);
                }
                StepOutcome::AlreadyComplete => return Ok(applied),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_journal(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "wh-journal-{}-{}.json",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn init_writes_all_transformations_and_refuses_to_overwrite() {
        let path = scratch_journal("init");
        let migrator = Migrator::new(SchemaConfig::default(), &path);

        let journal = migrator.init().unwrap();
        assert_eq!(journal.status, MigrationStatus::NotStarted);
        assert!(journal.checkpoints.is_empty());
        assert_eq!(
            journal.transformations.len(),
            SchemaConfig::default().statements().len()
        );

        let err = migrator.init().unwrap_err();
        assert!(matches!(err, StoreError::Journal(_)));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn journal_round_trips_through_json() {
        let path = scratch_journal("roundtrip");
        let journal = MigrationJournal {
            version: 1,
            status: MigrationStatus::InProgress,
            worktree: Some("/srv/app".to_string()),
            checkpoints: vec!["uuid_v7_function".to_string()],
            transformations: vec![
                "uuid_v7_function".to_string(),
                "outbox_table".to_string(),
            ],
        };
        journal.save(&path).unwrap();

        let loaded = MigrationJournal::load(&path).unwrap();
        assert_eq!(loaded.status, MigrationStatus::InProgress);
        assert_eq!(loaded.next_pending(), Some("outbox_table"));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn next_pending_is_none_when_all_checkpointed() {
        let journal = MigrationJournal {
            version: 1,
            status: MigrationStatus::InProgress,
            worktree: None,
            checkpoints: vec!["a".to_string(), "b".to_string()],
            transformations: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(journal.next_pending(), None);
    }
}
