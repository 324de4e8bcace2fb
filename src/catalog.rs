//! The media catalog: one CSV row per media file, with generated metadata
//! and per-marketplace submission status.
//!
//! Expected columns are `file`, `title`, `description`, `keywords`, plus a
//! `<marketplace> status` / `<marketplace> category` pair per marketplace.
//! Optional `notes` and `editorial` columns feed operator hints into
//! generation. The catalog is rewritten in full on save, after copying the
//! previous file to a timestamped backup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use crate::store::{normalize_path, EditorialData, MediaMetadata};

/// Marketplaces the catalog schema may carry columns for.
pub const KNOWN_MARKETPLACES: &[&str] = &[
    "shutterstock",
    "adobe_stock",
    "dreamstime",
    "depositphotos",
    "alamy",
];

pub const STATUS_PREPARED: &str = "prepared";
pub const STATUS_SUBMITTED: &str = "submitted";
pub const STATUS_REJECTED: &str = "rejected";

const REQUIRED_COLUMNS: &[&str] = &["file", "title", "description", "keywords"];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("unknown marketplace column: {0}")]
    UnknownMarketplace(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Submission state of one file on one marketplace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketplaceEntry {
    /// Empty (pending), `prepared`, `submitted` or `rejected`.
    pub status: String,
    pub category: String,
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRecord {
    /// Normalized path, matching registry claim keys.
    pub file_path: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    /// Free-form operator hints passed to generation.
    pub notes: String,
    /// Raw editorial marker; see [`parse_editorial`].
    pub editorial: String,
    pub marketplaces: BTreeMap<String, MarketplaceEntry>,
}

impl MediaRecord {
    /// A row rejected on any marketplace is left alone entirely.
    pub fn is_rejected(&self) -> bool {
        self.marketplaces
            .values()
            .any(|entry| entry.status == STATUS_REJECTED)
    }

    /// Eligible for metadata generation: not rejected anywhere, and still
    /// pending on at least one marketplace.
    pub fn needs_metadata(&self) -> bool {
        !self.is_rejected()
            && self
                .marketplaces
                .values()
                .any(|entry| entry.status.is_empty())
    }

    pub fn editorial_info(&self) -> (bool, Option<EditorialData>) {
        parse_editorial(&self.editorial)
    }

    /// Merges generated metadata into the row: replaces title, description
    /// and keywords, marks every still-pending marketplace as prepared and
    /// fills in per-marketplace categories. Statuses already past pending
    /// are left untouched.
    pub fn apply_metadata(&mut self, metadata: &MediaMetadata) {
        self.title = metadata.title.clone();
        self.description = metadata.description.clone();
        self.keywords = metadata.keywords.clone();
        for (name, entry) in &mut self.marketplaces {
            if entry.status.is_empty() {
                entry.status = STATUS_PREPARED.to_string();
            }
            if let Some(category) = metadata.categories.get(name) {
                entry.category = category.clone();
            }
        }
    }
}

/// Interprets the `editorial` column.
///
/// Empty or `false`/`no`/`0` mean non-editorial. A `City, Country, Date`
/// triple marks the row editorial and carries the caption data. Any other
/// non-empty value marks it editorial without caption data.
pub fn parse_editorial(raw: &str) -> (bool, Option<EditorialData>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (false, None);
    }
    match trimmed.to_lowercase().as_str() {
        "false" | "no" | "0" => return (false, None),
        _ => {}
    }
    let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
    if parts.len() == 3 {
        return (
            true,
            Some(EditorialData {
                city: parts[0].to_string(),
                country: parts[1].to_string(),
                date: parts[2].to_string(),
            }),
        );
    }
    (true, None)
}

struct Columns {
    file: usize,
    title: usize,
    description: usize,
    keywords: usize,
    notes: Option<usize>,
    editorial: Option<usize>,
    /// Marketplace name -> (status column, category column), in header order.
    marketplaces: Vec<(String, usize, usize)>,
}

/// The loaded catalog, held in memory between load and save.
#[derive(Debug)]
pub struct MediaCatalog {
    path: PathBuf,
    marketplaces: Vec<String>,
    has_notes: bool,
    has_editorial: bool,
    records: Vec<MediaRecord>,
}

impl MediaCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        // Flexible: hand-edited catalogs often have short rows.
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let columns = Self::resolve_columns(&headers)?;

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let cell = |idx: usize| row.get(idx).unwrap_or("").trim().to_string();
            let mut marketplaces = BTreeMap::new();
            for (name, status_idx, category_idx) in &columns.marketplaces {
                marketplaces.insert(
                    name.clone(),
                    MarketplaceEntry {
                        status: cell(*status_idx),
                        category: cell(*category_idx),
                    },
                );
            }
            records.push(MediaRecord {
                file_path: normalize_path(cell(columns.file).as_str()),
                title: cell(columns.title),
                description: cell(columns.description),
                keywords: split_keywords(&cell(columns.keywords)),
                notes: columns.notes.map(cell).unwrap_or_default(),
                editorial: columns.editorial.map(cell).unwrap_or_default(),
                marketplaces,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            marketplaces: columns
                .marketplaces
                .iter()
                .map(|(name, _, _)| name.clone())
                .collect(),
            has_notes: columns.notes.is_some(),
            has_editorial: columns.editorial.is_some(),
            records,
        })
    }

    fn resolve_columns(headers: &[String]) -> Result<Columns, CatalogError> {
        let position = |name: &str| headers.iter().position(|h| h == name);
        let required = |name: &str| {
            position(name).ok_or_else(|| CatalogError::MissingColumn(name.to_string()))
        };

        let mut marketplaces = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            if let Some(name) = header.strip_suffix(" status") {
                if !KNOWN_MARKETPLACES.contains(&name) {
                    return Err(CatalogError::UnknownMarketplace(name.to_string()));
                }
                let category = position(&format!("{name} category"))
                    .ok_or_else(|| CatalogError::MissingColumn(format!("{name} category")))?;
                marketplaces.push((name.to_string(), idx, category));
            } else if let Some(name) = header.strip_suffix(" category") {
                if position(&format!("{name} status")).is_none() {
                    return Err(CatalogError::MissingColumn(format!("{name} status")));
                }
            }
        }

        Ok(Columns {
            file: required("file")?,
            title: required("title")?,
            description: required("description")?,
            keywords: required("keywords")?,
            notes: position("notes"),
            editorial: position("editorial"),
            marketplaces,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MediaRecord] {
        &self.records
    }

    /// Marketplace names carried by this catalog, in column order.
    pub fn marketplaces(&self) -> &[String] {
        &self.marketplaces
    }

    pub fn record(&self, path: &str) -> Option<&MediaRecord> {
        let key = normalize_path(path);
        self.records.iter().find(|r| r.file_path == key)
    }

    pub fn record_mut(&mut self, path: &str) -> Option<&mut MediaRecord> {
        let key = normalize_path(path);
        self.records.iter_mut().find(|r| r.file_path == key)
    }

    /// Paths of every row still waiting for metadata.
    pub fn pending_files(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.needs_metadata())
            .map(|r| r.file_path.clone())
            .collect()
    }

    /// Writes the catalog back. The previous file is first copied to a
    /// timestamped `.bak` next to it; the new content goes through a temp
    /// file and a rename. Returns the backup path, if one was made.
    pub fn save_with_backup(&self) -> Result<Option<PathBuf>, CatalogError> {
        let backup = if self.path.exists() {
            let stamp = Utc::now().format("%Y%m%d-%H%M%S");
            let backup = self.path.with_extension(format!("{stamp}.bak.csv"));
            fs::copy(&self.path, &backup)?;
            Some(backup)
        } else {
            None
        };

        let tmp = self.path.with_extension("csv.tmp");
        let mut writer = csv::Writer::from_path(&tmp)?;

        let mut header: Vec<String> = REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect();
        if self.has_notes {
            header.push("notes".to_string());
        }
        if self.has_editorial {
            header.push("editorial".to_string());
        }
        for name in &self.marketplaces {
            header.push(format!("{name} status"));
            header.push(format!("{name} category"));
        }
        writer.write_record(&header)?;

        for record in &self.records {
            let mut row = vec![
                record.file_path.clone(),
                record.title.clone(),
                record.description.clone(),
                record.keywords.join(", "),
            ];
            if self.has_notes {
                row.push(record.notes.clone());
            }
            if self.has_editorial {
                row.push(record.editorial.clone());
            }
            for name in &self.marketplaces {
                let entry = record.marketplaces.get(name).cloned().unwrap_or_default();
                row.push(entry.status);
                row.push(entry.category);
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, &self.path)?;
        Ok(backup)
    }
}

fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
