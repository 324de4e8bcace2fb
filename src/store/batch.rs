use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::normalize_path;
use super::registry::BatchKind;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-file progress inside a batch.
///
/// Files start pending, become sent when included in a provider job, and
/// end completed, rejected or skipped. Terminal statuses never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Sent,
    Completed,
    Rejected,
    Skipped,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Skipped)
    }

    fn can_advance_to(&self, next: FileStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Sent => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        };
        write!(f, "{label}")
    }
}

/// Location details for editorial captions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorialData {
    pub city: String,
    pub country: String,
    pub date: String,
}

/// Metadata produced by the model for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Marketplace name -> category chosen for that marketplace.
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
}

impl MediaMetadata {
    /// Parses a model response into metadata. Tolerates a Markdown code
    /// fence around the JSON body, which models add despite instructions.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(strip_code_fence(text))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// One file enrolled in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFileEntry {
    /// Normalized path, matching the registry's claim key.
    pub file_path: String,
    /// Identifier used to match provider results back to this file.
    pub custom_id: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_description: Option<String>,
    #[serde(default)]
    pub editorial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editorial_data: Option<EditorialData>,
    #[serde(flatten)]
    pub kind: BatchKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MediaMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Input for [`BatchState::add_file`].
#[derive(Debug, Clone)]
pub struct NewFileEntry {
    pub path: String,
    pub custom_id: String,
    pub user_description: Option<String>,
    pub editorial: bool,
    pub editorial_data: Option<EditorialData>,
    pub kind: BatchKind,
}

/// Partial update applied to one entry. Unset fields are left alone; a
/// status change that would move an entry backwards is ignored.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub status: Option<FileStatus>,
    pub result: Option<MediaMetadata>,
    pub error: Option<String>,
    pub user_description: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDoc {
    #[serde(default)]
    files: Vec<BatchFileEntry>,
}

#[derive(Serialize)]
struct StateDocRef<'a> {
    files: &'a [BatchFileEntry],
}

#[derive(Serialize)]
struct DescriptionEntry<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    user_description: Option<&'a str>,
    editorial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    editorial_data: Option<&'a EditorialData>,
}

/// File-level state for one batch, stored in the batch's directory.
///
/// `state.json` is authoritative. Two read-only projections are rewritten
/// alongside it on every save: `descriptions.json` (custom id -> operator
/// notes and editorial data) and `results.json` (custom id -> generated
/// metadata), for inspection and downstream tooling.
pub struct BatchState {
    batch_id: String,
    dir: PathBuf,
    files: Vec<BatchFileEntry>,
}

impl BatchState {
    /// Loads the state for `batch_id`, or starts an empty one when the
    /// batch directory does not exist yet.
    pub fn load(batches_root: &Path, batch_id: &str) -> Result<Self, StateError> {
        let dir = batches_root.join(batch_id);
        let path = dir.join("state.json");
        let files = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                Vec::new()
            } else {
                serde_json::from_slice::<StateDoc>(&bytes)?.files
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            batch_id: batch_id.to_string(),
            dir,
            files,
        })
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &[BatchFileEntry] {
        &self.files
    }

    pub fn list_by_status(&self, status: FileStatus) -> Vec<&BatchFileEntry> {
        self.files.iter().filter(|f| f.status == status).collect()
    }

    pub fn entry_by_custom_id(&self, custom_id: &str) -> Option<&BatchFileEntry> {
        self.files.iter().find(|f| f.custom_id == custom_id)
    }

    pub fn contains_custom_id(&self, custom_id: &str) -> bool {
        self.entry_by_custom_id(custom_id).is_some()
    }

    /// Enrolls a file as pending. Returns `false` without touching disk when
    /// the file is already present, so repeated enrollment is harmless.
    pub fn add_file(&mut self, entry: NewFileEntry) -> Result<bool, StateError> {
        let key = normalize_path(&entry.path);
        if self.files.iter().any(|f| f.file_path == key) {
            return Ok(false);
        }
        self.files.push(BatchFileEntry {
            file_path: key,
            custom_id: entry.custom_id,
            status: FileStatus::Pending,
            user_description: entry.user_description,
            editorial: entry.editorial,
            editorial_data: entry.editorial_data,
            kind: entry.kind,
            result: None,
            error: None,
        });
        self.save()?;
        Ok(true)
    }

    /// Applies `update` to the entry for `path`. Returns whether an entry
    /// matched.
    pub fn update_file(&mut self, path: &str, update: FileUpdate) -> Result<bool, StateError> {
        let key = normalize_path(path);
        self.update_where(|f| f.file_path == key, update)
    }

    /// Applies `update` to the entry with `custom_id`.
    pub fn update_file_by_custom_id(
        &mut self,
        custom_id: &str,
        update: FileUpdate,
    ) -> Result<bool, StateError> {
        self.update_where(|f| f.custom_id == custom_id, update)
    }

    fn update_where<F>(&mut self, matches: F, update: FileUpdate) -> Result<bool, StateError>
    where
        F: Fn(&BatchFileEntry) -> bool,
    {
        let Some(entry) = self.files.iter_mut().find(|f| matches(f)) else {
            return Ok(false);
        };
        if let Some(status) = update.status {
            if entry.status.can_advance_to(status) {
                entry.status = status;
            }
        }
        if let Some(result) = update.result {
            entry.result = Some(result);
        }
        if let Some(error) = update.error {
            entry.error = Some(error);
        }
        if let Some(description) = update.user_description {
            entry.user_description = Some(description);
        }
        self.save()?;
        Ok(true)
    }

    /// Writes `state.json` and both projections. Each file is written to a
    /// temp path and renamed into place.
    pub fn save(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir)?;
        write_json(&self.dir.join("state.json"), &StateDocRef { files: &self.files })?;

        let descriptions: BTreeMap<&str, DescriptionEntry<'_>> = self
            .files
            .iter()
            .filter(|f| f.user_description.is_some() || f.editorial)
            .map(|f| {
                (
                    f.custom_id.as_str(),
                    DescriptionEntry {
                        user_description: f.user_description.as_deref(),
                        editorial: f.editorial,
                        editorial_data: f.editorial_data.as_ref(),
                    },
                )
            })
            .collect();
        write_json(&self.dir.join("descriptions.json"), &descriptions)?;

        let results: BTreeMap<&str, &MediaMetadata> = self
            .files
            .iter()
            .filter_map(|f| f.result.as_ref().map(|r| (f.custom_id.as_str(), r)))
            .collect();
        write_json(&self.dir.join("results.json"), &results)?;
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
