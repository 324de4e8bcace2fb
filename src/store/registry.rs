use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::normalize_path;

/// Errors from registry bookkeeping.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("file already claimed by batch {batch_id}: {path}")]
    FileClaimed { path: String, batch_id: String },

    #[error("batch {batch_id} is full ({limit} files)")]
    BatchFull { batch_id: String, limit: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lifecycle of a batch.
///
/// Collecting batches accept files; submitted and polling batches have a
/// provider job in flight; the remaining states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Collecting,
    Submitted,
    Polling,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Collecting => "collecting",
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// What a batch produces: regular marketplace metadata, or metadata for an
/// alternative version of each file rendered with a named effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchKind {
    Metadata,
    Effect { name: String },
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Metadata => write!(f, "metadata"),
            Self::Effect { name } => write!(f, "effect:{name}"),
        }
    }
}

/// One batch tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    #[serde(flatten)]
    pub kind: BatchKind,
    pub created_at: DateTime<Utc>,
    pub file_count: u32,
    pub batch_size_limit: u32,
    pub provider_job_id: Option<String>,
    /// How many runs have given up waiting on this batch's provider job.
    #[serde(default)]
    pub poll_timeouts: u32,
}

impl BatchJob {
    pub fn is_full(&self) -> bool {
        self.file_count >= self.batch_size_limit
    }
}

/// A finished batch retained for the cleanup window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedBatch {
    pub job: BatchJob,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    active_batches: BTreeMap<String, BatchJob>,
    #[serde(default)]
    completed_batches: Vec<CompletedBatch>,
    /// Normalized file path -> owning batch id. A file appears here from the
    /// moment it is claimed until its batch reaches a terminal state.
    #[serde(default)]
    file_registry: BTreeMap<String, String>,
    /// "provider:YYYY-MM-DD" -> number of jobs submitted that day.
    #[serde(default)]
    daily_counts: BTreeMap<String, u32>,
    /// Effect name -> files an alternative has already been generated for.
    #[serde(default)]
    alternatives_generated: BTreeMap<String, Vec<String>>,
}

/// The persistent ledger of batches, claims and quota.
///
/// Every mutating call writes `registry.json` back to disk (atomically, via
/// a temp file) before returning, so a crash never loses an acknowledged
/// claim or submission.
pub struct BatchRegistry {
    path: PathBuf,
    batches_root: PathBuf,
    doc: RegistryDoc,
}

impl BatchRegistry {
    /// Opens the registry under `data_dir`, creating the directory and an
    /// empty ledger on first use.
    pub fn load(data_dir: &Path) -> Result<Self, RegistryError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join("registry.json");
        let doc = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                RegistryDoc::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            RegistryDoc::default()
        };
        Ok(Self {
            path,
            batches_root: data_dir.join("batches"),
            doc,
        })
    }

    /// Directory that holds one subdirectory per batch.
    pub fn batches_root(&self) -> &Path {
        &self.batches_root
    }

    fn persist(&self) -> Result<(), RegistryError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // --- batches ---

    /// Creates a new collecting batch and returns its id.
    pub fn create_batch(&mut self, kind: BatchKind, size_limit: u32) -> Result<String, RegistryError> {
        let id = format!("batch-{}", Uuid::new_v4());
        let job = BatchJob {
            id: id.clone(),
            status: BatchStatus::Collecting,
            kind,
            created_at: Utc::now(),
            file_count: 0,
            batch_size_limit: size_limit.max(1),
            provider_job_id: None,
            poll_timeouts: 0,
        };
        self.doc.active_batches.insert(id.clone(), job);
        self.persist()?;
        Ok(id)
    }

    pub fn batch(&self, id: &str) -> Option<&BatchJob> {
        self.doc.active_batches.get(id)
    }

    /// Active batches, optionally narrowed to one status.
    pub fn active_batches(&self, status: Option<BatchStatus>) -> Vec<&BatchJob> {
        self.doc
            .active_batches
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .collect()
    }

    pub fn completed_batches(&self) -> &[CompletedBatch] {
        &self.doc.completed_batches
    }

    pub fn set_batch_status(&mut self, id: &str, status: BatchStatus) -> Result<(), RegistryError> {
        let job = self
            .doc
            .active_batches
            .get_mut(id)
            .ok_or_else(|| RegistryError::BatchNotFound(id.to_string()))?;
        job.status = status;
        self.persist()
    }

    /// Records the provider job backing a batch and advances it to
    /// submitted, in a single persisted write: a resumed run never sees one
    /// without the other.
    pub fn mark_submitted(&mut self, id: &str, provider_job_id: &str) -> Result<(), RegistryError> {
        let job = self
            .doc
            .active_batches
            .get_mut(id)
            .ok_or_else(|| RegistryError::BatchNotFound(id.to_string()))?;
        job.provider_job_id = Some(provider_job_id.to_string());
        job.status = BatchStatus::Submitted;
        self.persist()
    }

    /// Records one more run that gave up waiting on this batch. Returns the
    /// new total.
    pub fn record_poll_timeout(&mut self, id: &str) -> Result<u32, RegistryError> {
        let job = self
            .doc
            .active_batches
            .get_mut(id)
            .ok_or_else(|| RegistryError::BatchNotFound(id.to_string()))?;
        job.poll_timeouts += 1;
        let total = job.poll_timeouts;
        self.persist()?;
        Ok(total)
    }

    /// Finds a collecting batch for `effect` with room left, or creates one.
    pub fn find_or_create_effect_batch(
        &mut self,
        effect: &str,
        size_limit: u32,
    ) -> Result<String, RegistryError> {
        let existing = self
            .doc
            .active_batches
            .values()
            .find(|job| {
                job.status == BatchStatus::Collecting
                    && !job.is_full()
                    && matches!(&job.kind, BatchKind::Effect { name } if name == effect)
            })
            .map(|job| job.id.clone());
        match existing {
            Some(id) => Ok(id),
            None => self.create_batch(
                BatchKind::Effect {
                    name: effect.to_string(),
                },
                size_limit,
            ),
        }
    }

    /// Archives a batch under `final_status`: removes it from the active
    /// set, releases every file claim it still held and appends it to the
    /// completed list, all in a single persisted write.
    pub fn complete_batch(
        &mut self,
        id: &str,
        final_status: BatchStatus,
    ) -> Result<(), RegistryError> {
        let mut job = self
            .doc
            .active_batches
            .remove(id)
            .ok_or_else(|| RegistryError::BatchNotFound(id.to_string()))?;
        job.status = final_status;
        self.drop_claims(id);
        self.doc.completed_batches.push(CompletedBatch {
            job,
            completed_at: Utc::now(),
        });
        self.persist()
    }

    /// Drops completed batches older than `retention_days` and removes their
    /// batch directories. Directory removal is best effort; a failure is
    /// reported but does not abort the purge. Returns how many batches were
    /// purged.
    pub fn cleanup_completed(&mut self, retention_days: u32) -> Result<usize, RegistryError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.doc.completed_batches)
            .into_iter()
            .partition(|entry| entry.completed_at <= cutoff);
        self.doc.completed_batches = kept;

        for entry in &expired {
            let dir = self.batches_root.join(&entry.job.id);
            if dir.exists() {
                if let Err(err) = fs::remove_dir_all(&dir) {
                    eprintln!(
                        "warning: could not remove batch directory {}: {err}",
                        dir.display()
                    );
                }
            }
        }

        if !expired.is_empty() {
            self.persist()?;
        }
        Ok(expired.len())
    }

    // --- file claims ---

    /// Claims a file for a batch. Claims are exclusive: a file already owned
    /// by another batch is refused, and re-claiming for the same batch is a
    /// no-op. Fails with [`RegistryError::BatchFull`] once the batch has
    /// reached its size limit.
    pub fn register_file(&mut self, path: &str, batch_id: &str) -> Result<(), RegistryError> {
        let key = normalize_path(path);
        if let Some(owner) = self.doc.file_registry.get(&key) {
            if owner == batch_id {
                return Ok(());
            }
            return Err(RegistryError::FileClaimed {
                path: key,
                batch_id: owner.clone(),
            });
        }

        let job = self
            .doc
            .active_batches
            .get_mut(batch_id)
            .ok_or_else(|| RegistryError::BatchNotFound(batch_id.to_string()))?;
        if job.file_count >= job.batch_size_limit {
            return Err(RegistryError::BatchFull {
                batch_id: batch_id.to_string(),
                limit: job.batch_size_limit,
            });
        }
        job.file_count += 1;
        self.doc.file_registry.insert(key, batch_id.to_string());
        self.persist()
    }

    /// Which batch currently owns `path`, if any.
    pub fn file_owner(&self, path: &str) -> Option<&str> {
        self.doc
            .file_registry
            .get(&normalize_path(path))
            .map(String::as_str)
    }

    /// Releases one file claim, returning the slot to a still-active owner
    /// (`file_count` goes back down). Returns whether a claim existed.
    pub fn unregister_file(&mut self, path: &str) -> Result<bool, RegistryError> {
        let Some(owner) = self.doc.file_registry.remove(&normalize_path(path)) else {
            return Ok(false);
        };
        if let Some(job) = self.doc.active_batches.get_mut(&owner) {
            job.file_count = job.file_count.saturating_sub(1);
        }
        self.persist()?;
        Ok(true)
    }

    /// Releases every claim held by `batch_id`, returning their slots.
    /// Answers how many claims were dropped. Archiving a batch does this
    /// implicitly; this is for callers that need to free a batch's files
    /// without archiving it.
    pub fn unregister_files_for_batch(&mut self, batch_id: &str) -> Result<usize, RegistryError> {
        let released = self.drop_claims(batch_id);
        if released > 0 {
            self.persist()?;
        }
        Ok(released)
    }

    // `file_count` tracks claims only while the batch is active; an archived
    // batch keeps its count as a record of what it held.
    fn drop_claims(&mut self, batch_id: &str) -> usize {
        let before = self.doc.file_registry.len();
        self.doc.file_registry.retain(|_, owner| owner != batch_id);
        let released = before - self.doc.file_registry.len();
        if let Some(job) = self.doc.active_batches.get_mut(batch_id) {
            job.file_count = job.file_count.saturating_sub(released as u32);
        }
        released
    }

    pub fn claimed_files(&self, batch_id: &str) -> Vec<&str> {
        self.doc
            .file_registry
            .iter()
            .filter(|(_, owner)| owner.as_str() == batch_id)
            .map(|(path, _)| path.as_str())
            .collect()
    }

    // --- daily quota ---

    fn quota_key(provider: &str, date: NaiveDate) -> String {
        format!("{provider}:{}", date.format("%Y-%m-%d"))
    }

    /// Number of jobs submitted to `provider` on `date`.
    pub fn daily_count(&self, provider: &str, date: NaiveDate) -> u32 {
        self.doc
            .daily_counts
            .get(&Self::quota_key(provider, date))
            .copied()
            .unwrap_or(0)
    }

    /// Bumps the submission count for `provider` on `date` and returns the
    /// new total.
    pub fn increment_daily_count(
        &mut self,
        provider: &str,
        date: NaiveDate,
        by: u32,
    ) -> Result<u32, RegistryError> {
        let count = self
            .doc
            .daily_counts
            .entry(Self::quota_key(provider, date))
            .or_insert(0);
        *count += by;
        let total = *count;
        self.persist()?;
        Ok(total)
    }

    // --- alternatives ledger ---

    /// Records that an alternative with `effect` was generated for `path`.
    pub fn mark_alternative_generated(
        &mut self,
        effect: &str,
        path: &str,
    ) -> Result<(), RegistryError> {
        let key = normalize_path(path);
        let paths = self
            .doc
            .alternatives_generated
            .entry(effect.to_string())
            .or_default();
        if !paths.contains(&key) {
            paths.push(key);
            paths.sort();
            self.persist()?;
        }
        Ok(())
    }

    pub fn alternative_generated(&self, effect: &str, path: &str) -> bool {
        self.doc
            .alternatives_generated
            .get(effect)
            .is_some_and(|paths| paths.contains(&normalize_path(path)))
    }
}
