//! Disk-persisted bookkeeping for batch runs.
//!
//! [`BatchRegistry`] is the process-wide ledger of batches, file claims and
//! daily submission quota; [`BatchState`] tracks the files enrolled in one
//! batch. Both persist after every mutation so an interrupted run can be
//! resumed from disk.

mod batch;
mod registry;

pub use batch::{
    BatchFileEntry, BatchState, EditorialData, FileStatus, FileUpdate, MediaMetadata,
    NewFileEntry, StateError,
};
pub use registry::{
    BatchJob, BatchKind, BatchRegistry, BatchStatus, CompletedBatch, RegistryError,
};

/// Normalizes a path string for use as a registry key.
///
/// Backslashes become forward slashes, duplicate separators collapse, a
/// trailing separator is trimmed and a leading Windows drive letter is
/// lowercased. The result is stable no matter which spelling of the same
/// path a caller hands in.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for ch in path.chars() {
        let ch = if ch == '\\' { '/' } else { ch };
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }

    // Trim a trailing separator, but keep "/" and "c:/" intact.
    if out.len() > 1 && out.ends_with('/') && !out[..out.len() - 1].ends_with(':') {
        out.pop();
    }

    // Lowercase a Windows drive letter so "C:/x" and "c:/x" key identically.
    let bytes = out.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_uppercase() {
        let lower = bytes[0].to_ascii_lowercase() as char;
        out.replace_range(0..1, &lower.to_string());
    }

    out
}

/// Maximum length of the file-stem portion of a custom id. Keeps the full
/// id inside the provider's 64-character custom-id limit.
const CUSTOM_ID_STEM_LIMIT: usize = 24;

/// Builds the deterministic per-file identifier used to match provider
/// results back to files: the sanitized file stem plus a batch suffix.
///
/// `build_custom_id("C:/path/file.jpg", "batch1")` yields `"file_batch1"`.
pub fn build_custom_id(path: &str, batch_id: &str) -> String {
    let normalized = normalize_path(path);
    let name = normalized.rsplit('/').next().unwrap_or(&normalized);
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };

    let mut sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(CUSTOM_ID_STEM_LIMIT);

    format!("{sanitized}_{batch_id}")
}
