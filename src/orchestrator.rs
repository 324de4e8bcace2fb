//! The batch run control loop.
//!
//! A run moves files through the pipeline: claim eligible files into
//! collecting batches, submit closed batches as provider jobs (respecting
//! the daily cap), wait on in-flight jobs, then merge results into the
//! catalog. Every step persists through the registry and batch state, so a
//! run interrupted at any point picks up where it left off.

use std::time::{Duration, Instant};

use chrono::Utc;

use crate::catalog::MediaCatalog;
use crate::config::StocksmithConfig;
use crate::error::StocksmithError;
use crate::prompter::RequestBuilder;
use crate::provider::types::{BatchItem, BatchResult, MessageBatch, ProcessingStatus};
use crate::provider::{BatchProvider, ProviderError};
use crate::store::{
    build_custom_id, normalize_path, BatchFileEntry, BatchKind, BatchRegistry, BatchState,
    BatchStatus, FileStatus, FileUpdate, MediaMetadata, NewFileEntry, RegistryError,
};
use crate::ui::RunProgress;

/// Coarse classification of a provider failure, used to decide between
/// aborting the run and leaving the batch for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Auth,
    Network,
    Other,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Network => "network",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Classifies an error by its message text. Checked in order: rate limit
/// markers, then auth, then network.
pub fn classify_send_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorClass::RateLimit
    } else if lower.contains("auth") || lower.contains("key") {
        ErrorClass::Auth
    } else if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
    {
        ErrorClass::Network
    } else {
        ErrorClass::Other
    }
}

/// Classifies a [`ProviderError`], preferring its structure over message
/// keywords.
pub fn classify_provider_error(error: &ProviderError) -> ErrorClass {
    match error {
        ProviderError::RateLimited { .. } => ErrorClass::RateLimit,
        ProviderError::ApiError {
            status: 401 | 403, ..
        } => ErrorClass::Auth,
        ProviderError::Network(_) => ErrorClass::Network,
        _ => classify_send_error(&error.to_string()),
    }
}

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: u32,
    /// How long one run waits on a provider job. `None` waits forever.
    pub wait_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub provider: String,
    /// Maximum provider jobs submitted per provider per day.
    pub daily_cap: u32,
    /// After this many timed-out runs the provider job is cancelled.
    pub max_poll_timeouts: u32,
    /// Submit partially filled batches instead of leaving them collecting.
    pub flush: bool,
    /// Collect into an alternative-effect batch instead of the metadata one.
    pub effect: Option<String>,
    pub verbose: bool,
}

impl RunOptions {
    pub fn from_config(config: &StocksmithConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            wait_timeout: wait_timeout_from_secs(config.wait_timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            provider: config.provider.clone(),
            daily_cap: config.daily_cap,
            max_poll_timeouts: config.max_poll_timeouts,
            flush: false,
            effect: None,
            verbose: false,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: 20,
            wait_timeout: Some(Duration::from_secs(1800)),
            poll_interval: Duration::from_secs(30),
            provider: "anthropic".to_string(),
            daily_cap: 10,
            max_poll_timeouts: 6,
            flush: false,
            effect: None,
            verbose: false,
        }
    }
}

/// A zero wait timeout means "wait as long as it takes".
pub fn wait_timeout_from_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

/// File-level tallies for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Files newly claimed into batches.
    pub collected: usize,
    /// Files included in provider jobs submitted this run.
    pub submitted: usize,
    /// Files whose metadata was generated and merged.
    pub completed: usize,
    /// Files rejected: unusable model output, or a catalog veto.
    pub rejected: usize,
    /// Files skipped before or during processing (claim conflicts,
    /// unreadable media, provider-side cancellations).
    pub skipped: usize,
    /// Files held back by the daily cap or a retryable submission failure.
    pub deferred: usize,
    /// Files lost to provider-reported errors or abandoned jobs.
    pub failed: usize,
    /// Files still claimed by active batches when the run ended.
    pub pending: usize,
}

pub struct BatchOrchestrator<'a, P, B> {
    provider: &'a P,
    builder: &'a B,
    registry: &'a mut BatchRegistry,
    catalog: &'a mut MediaCatalog,
    options: RunOptions,
}

impl<'a, P: BatchProvider, B: RequestBuilder> BatchOrchestrator<'a, P, B> {
    pub fn new(
        provider: &'a P,
        builder: &'a B,
        registry: &'a mut BatchRegistry,
        catalog: &'a mut MediaCatalog,
        options: RunOptions,
    ) -> Self {
        Self {
            provider,
            builder,
            registry,
            catalog,
            options,
        }
    }

    /// Executes one full run. With no explicit paths the catalog decides
    /// what still needs metadata; explicit paths restrict the run to those
    /// files.
    pub async fn run(&mut self, explicit_paths: &[String]) -> Result<RunSummary, StocksmithError> {
        let mut summary = RunSummary::default();

        self.resume_in_flight(&mut summary).await?;

        match self.options.effect.clone() {
            Some(effect) => self.collect_effect(&effect, explicit_paths, &mut summary)?,
            None => {
                let paths = if explicit_paths.is_empty() {
                    self.catalog.pending_files()
                } else {
                    explicit_paths.to_vec()
                };
                self.collect_metadata(&paths, &mut summary)?;
            }
        }

        self.submit_ready(&mut summary).await?;

        summary.pending = self
            .registry
            .active_batches(None)
            .iter()
            .map(|job| job.file_count as usize)
            .sum();
        Ok(summary)
    }

    /// Picks up batches a previous run left with a provider job in flight.
    async fn resume_in_flight(&mut self, summary: &mut RunSummary) -> Result<(), StocksmithError> {
        let in_flight: Vec<String> = self
            .registry
            .active_batches(None)
            .iter()
            .filter(|job| {
                matches!(job.status, BatchStatus::Submitted | BatchStatus::Polling)
                    && job.provider_job_id.is_some()
            })
            .map(|job| job.id.clone())
            .collect();
        for batch_id in in_flight {
            eprintln!("resuming batch {batch_id} from a previous run");
            self.poll_and_ingest(&batch_id, summary).await?;
        }
        Ok(())
    }

    fn collect_metadata(
        &mut self,
        paths: &[String],
        summary: &mut RunSummary,
    ) -> Result<(), StocksmithError> {
        let mut open: Option<(String, BatchState)> = None;
        for path in paths {
            let key = normalize_path(path);

            let (notes, editorial, editorial_data) = match self.catalog.record(&key) {
                None => {
                    eprintln!("warning: skipping {key}: not in the catalog");
                    summary.skipped += 1;
                    continue;
                }
                Some(record) if record.is_rejected() => {
                    eprintln!("warning: skipping {key}: rejected in the catalog");
                    summary.skipped += 1;
                    continue;
                }
                Some(record) if !record.needs_metadata() => {
                    eprintln!("note: skipping {key}: no marketplace still pending");
                    summary.skipped += 1;
                    continue;
                }
                Some(record) => {
                    let (editorial, data) = record.editorial_info();
                    let notes = Some(record.notes.clone()).filter(|n| !n.is_empty());
                    (notes, editorial, data)
                }
            };

            if open.is_none() {
                open = Some(self.open_collecting_batch(&BatchKind::Metadata)?);
            }
            let Some((batch_id, state)) = open.as_mut() else {
                continue;
            };

            if !self.claim_rolling(&key, batch_id, state, &BatchKind::Metadata, summary)? {
                continue;
            }

            let custom_id = build_custom_id(&key, batch_id);
            if state.contains_custom_id(&custom_id) {
                eprintln!(
                    "warning: skipping {key}: custom id {custom_id} already used in batch {batch_id}"
                );
                self.registry.unregister_file(&key)?;
                summary.skipped += 1;
                continue;
            }

            state.add_file(NewFileEntry {
                path: key.clone(),
                custom_id,
                user_description: notes,
                editorial,
                editorial_data,
                kind: BatchKind::Metadata,
            })?;
            summary.collected += 1;
            if self.options.verbose {
                eprintln!("collected {key} into {batch_id}");
            }
        }
        Ok(())
    }

    fn collect_effect(
        &mut self,
        effect: &str,
        paths: &[String],
        summary: &mut RunSummary,
    ) -> Result<(), StocksmithError> {
        if paths.is_empty() {
            eprintln!("no files given for effect \"{effect}\"; nothing to collect");
            return Ok(());
        }

        let kind = BatchKind::Effect {
            name: effect.to_string(),
        };
        let mut open: Option<(String, BatchState)> = None;
        for path in paths {
            let key = normalize_path(path);

            if self.registry.alternative_generated(effect, &key) {
                eprintln!("note: skipping {key}: \"{effect}\" alternative already generated");
                summary.skipped += 1;
                continue;
            }
            // Effect sources may live outside the catalog; a present row
            // still contributes its notes and editorial data.
            let (notes, editorial, editorial_data) = match self.catalog.record(&key) {
                Some(record) => {
                    let (editorial, data) = record.editorial_info();
                    let notes = Some(record.notes.clone()).filter(|n| !n.is_empty());
                    (notes, editorial, data)
                }
                None => (None, false, None),
            };

            if open.is_none() {
                open = Some(self.open_collecting_batch(&kind)?);
            }
            let Some((batch_id, state)) = open.as_mut() else {
                continue;
            };

            if !self.claim_rolling(&key, batch_id, state, &kind, summary)? {
                continue;
            }

            let custom_id = build_custom_id(&key, batch_id);
            if state.contains_custom_id(&custom_id) {
                eprintln!(
                    "warning: skipping {key}: custom id {custom_id} already used in batch {batch_id}"
                );
                self.registry.unregister_file(&key)?;
                summary.skipped += 1;
                continue;
            }

            state.add_file(NewFileEntry {
                path: key.clone(),
                custom_id,
                user_description: notes,
                editorial,
                editorial_data,
                kind: kind.clone(),
            })?;
            summary.collected += 1;
            if self.options.verbose {
                eprintln!("collected {key} into {batch_id}");
            }
        }
        Ok(())
    }

    /// Finds a collecting batch of `kind` with room, or creates one.
    fn open_collecting_batch(
        &mut self,
        kind: &BatchKind,
    ) -> Result<(String, BatchState), StocksmithError> {
        let batch_id = match kind {
            BatchKind::Effect { name } => self
                .registry
                .find_or_create_effect_batch(name, self.options.batch_size)?,
            BatchKind::Metadata => {
                let existing = self
                    .registry
                    .active_batches(Some(BatchStatus::Collecting))
                    .iter()
                    .find(|job| job.kind == BatchKind::Metadata && !job.is_full())
                    .map(|job| job.id.clone());
                match existing {
                    Some(id) => id,
                    None => self
                        .registry
                        .create_batch(BatchKind::Metadata, self.options.batch_size)?,
                }
            }
        };
        let state = BatchState::load(self.registry.batches_root(), &batch_id)?;
        Ok((batch_id, state))
    }

    /// Claims `key` for the open batch, rolling over to a fresh batch when
    /// the current one is full. Returns `false` when the file is claimed
    /// elsewhere.
    fn claim_rolling(
        &mut self,
        key: &str,
        batch_id: &mut String,
        state: &mut BatchState,
        kind: &BatchKind,
        summary: &mut RunSummary,
    ) -> Result<bool, StocksmithError> {
        loop {
            match self.registry.register_file(key, batch_id) {
                Ok(()) => return Ok(true),
                Err(RegistryError::BatchFull { .. }) => {
                    let (new_id, new_state) = self.open_collecting_batch(kind)?;
                    *batch_id = new_id;
                    *state = new_state;
                }
                Err(RegistryError::FileClaimed {
                    batch_id: owner, ..
                }) => {
                    eprintln!("warning: skipping {key}: already claimed by batch {owner}");
                    summary.skipped += 1;
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Submits every closed collecting batch (full, or any with `--flush`)
    /// and waits on each submitted job.
    async fn submit_ready(&mut self, summary: &mut RunSummary) -> Result<(), StocksmithError> {
        let ready: Vec<String> = self
            .registry
            .active_batches(Some(BatchStatus::Collecting))
            .iter()
            .filter(|job| job.file_count > 0 && (job.is_full() || self.options.flush))
            .map(|job| job.id.clone())
            .collect();
        for batch_id in ready {
            if self.submit_batch(&batch_id, summary).await? {
                self.poll_and_ingest(&batch_id, summary).await?;
            }
        }
        Ok(())
    }

    /// Submits one batch as a provider job. Returns whether a job is now in
    /// flight; quota deferrals and retryable failures leave the batch
    /// collecting and answer `false`. A batch with nothing sendable left is
    /// archived as failed instead of lingering.
    async fn submit_batch(
        &mut self,
        batch_id: &str,
        summary: &mut RunSummary,
    ) -> Result<bool, StocksmithError> {
        if !self.provider.supports_batch() {
            return Err(StocksmithError::Config(format!(
                "provider {} does not support batch jobs",
                self.options.provider
            )));
        }

        let mut state = BatchState::load(self.registry.batches_root(), batch_id)?;
        let pending: Vec<BatchFileEntry> = state
            .list_by_status(FileStatus::Pending)
            .into_iter()
            .cloned()
            .collect();
        if pending.is_empty() {
            return self.retire_unsendable(batch_id, &state);
        }

        let today = Utc::now().date_naive();
        let used = self.registry.daily_count(&self.options.provider, today);
        if used >= self.options.daily_cap {
            eprintln!(
                "daily submission cap reached ({used}/{}); deferring batch {batch_id}",
                self.options.daily_cap
            );
            summary.deferred += pending.len();
            return Ok(false);
        }

        let mut items = Vec::new();
        for entry in &pending {
            match self.builder.build_request(entry) {
                Ok(params) => items.push(BatchItem {
                    custom_id: entry.custom_id.clone(),
                    params,
                }),
                Err(err) => {
                    eprintln!("warning: skipping {}: {err}", entry.file_path);
                    state.update_file(
                        &entry.file_path,
                        FileUpdate {
                            status: Some(FileStatus::Skipped),
                            error: Some(err.to_string()),
                            ..Default::default()
                        },
                    )?;
                    self.registry.unregister_file(&entry.file_path)?;
                    summary.skipped += 1;
                }
            }
        }
        if items.is_empty() {
            return self.retire_unsendable(batch_id, &state);
        }

        match self.provider.create_batch_job(&items).await {
            Ok(job) => {
                self.registry.mark_submitted(batch_id, &job.id)?;
                self.registry
                    .increment_daily_count(&self.options.provider, today, 1)?;
                for item in &items {
                    state.update_file_by_custom_id(
                        &item.custom_id,
                        FileUpdate {
                            status: Some(FileStatus::Sent),
                            ..Default::default()
                        },
                    )?;
                }
                summary.submitted += items.len();
                eprintln!(
                    "submitted batch {batch_id} as provider job {} ({} files)",
                    job.id,
                    items.len()
                );
                Ok(true)
            }
            Err(err) => {
                let class = classify_provider_error(&err);
                if class == ErrorClass::Auth {
                    return Err(err.into());
                }
                eprintln!(
                    "warning: submission of batch {batch_id} failed ({class}): {err}; will retry next run"
                );
                summary.deferred += items.len();
                Ok(false)
            }
        }
    }

    /// Archives a batch whose entries all resolved without a submission, so
    /// it stops occupying the active set. A batch that still has open
    /// entries is left alone.
    fn retire_unsendable(
        &mut self,
        batch_id: &str,
        state: &BatchState,
    ) -> Result<bool, StocksmithError> {
        if state.files().iter().all(|f| f.status.is_terminal()) {
            eprintln!("warning: batch {batch_id} has no sendable files; closing it as failed");
            self.registry
                .complete_batch(batch_id, BatchStatus::Failed)?;
        }
        Ok(false)
    }

    /// Waits for a provider job to end, then ingests its results. On wait
    /// timeout the batch stays polling for the next run, until the strike
    /// limit cancels the job remotely.
    async fn poll_and_ingest(
        &mut self,
        batch_id: &str,
        summary: &mut RunSummary,
    ) -> Result<(), StocksmithError> {
        let Some(job) = self.registry.batch(batch_id) else {
            return Ok(());
        };
        let Some(provider_job_id) = job.provider_job_id.clone() else {
            return Ok(());
        };
        self.registry
            .set_batch_status(batch_id, BatchStatus::Polling)?;

        let started = Instant::now();
        let progress = RunProgress::start(&format!("waiting on batch {batch_id}"));
        loop {
            match self.provider.get_batch_job(&provider_job_id).await {
                Ok(batch) if batch.processing_status == ProcessingStatus::Ended => {
                    progress.finish();
                    return self.ingest_results(batch_id, &batch, summary).await;
                }
                Ok(batch) => {
                    let counts = batch.request_counts;
                    let done = counts.succeeded + counts.errored + counts.canceled + counts.expired;
                    progress.set_message(format!(
                        "waiting on batch {batch_id}: {} processing, {done} done",
                        counts.processing
                    ));
                }
                Err(err) => {
                    if classify_provider_error(&err) == ErrorClass::Auth {
                        progress.finish();
                        return Err(err.into());
                    }
                    progress.note(&format!("status check failed ({err}); retrying"));
                }
            }

            if let Some(timeout) = self.options.wait_timeout {
                if started.elapsed() >= timeout {
                    progress.finish();
                    return self
                        .give_up_waiting(batch_id, &provider_job_id, summary)
                        .await;
                }
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn give_up_waiting(
        &mut self,
        batch_id: &str,
        provider_job_id: &str,
        summary: &mut RunSummary,
    ) -> Result<(), StocksmithError> {
        let strikes = self.registry.record_poll_timeout(batch_id)?;
        if strikes < self.options.max_poll_timeouts {
            eprintln!(
                "wait timeout for batch {batch_id} ({strikes}/{}); leaving it polling for the next run",
                self.options.max_poll_timeouts
            );
            return Ok(());
        }

        eprintln!("batch {batch_id} timed out {strikes} times; cancelling the provider job");
        if let Err(err) = self.provider.cancel_batch_job(provider_job_id).await {
            eprintln!("warning: provider cancel failed: {err}");
        }
        let abandoned = abandon_batch(self.registry, batch_id)?;
        summary.failed += abandoned;
        Ok(())
    }

    /// Fetches an ended job's results and applies them file by file. One bad
    /// result never blocks the others.
    async fn ingest_results(
        &mut self,
        batch_id: &str,
        batch: &MessageBatch,
        summary: &mut RunSummary,
    ) -> Result<(), StocksmithError> {
        let results = match self.provider.fetch_results(batch).await {
            Ok(results) => results,
            Err(err) => {
                if classify_provider_error(&err) == ErrorClass::Auth {
                    return Err(err.into());
                }
                eprintln!(
                    "warning: could not fetch results for batch {batch_id}: {err}; batch stays polling"
                );
                return Ok(());
            }
        };

        let mut state = BatchState::load(self.registry.batches_root(), batch_id)?;
        let mut catalog_dirty = false;
        let mut succeeded = 0usize;
        let mut canceled = 0usize;

        for item in &results {
            let Some(entry) = state.entry_by_custom_id(&item.custom_id).cloned() else {
                eprintln!(
                    "warning: result for unknown custom id {} in batch {batch_id}",
                    item.custom_id
                );
                continue;
            };
            match &item.result {
                BatchResult::Succeeded { message } => {
                    let text = message.text().unwrap_or_default();
                    match MediaMetadata::parse(text) {
                        Ok(metadata) => {
                            succeeded += 1;
                            self.apply_result(
                                &entry,
                                &metadata,
                                &mut state,
                                &mut catalog_dirty,
                                summary,
                            )?;
                        }
                        Err(err) => {
                            state.update_file_by_custom_id(
                                &item.custom_id,
                                FileUpdate {
                                    status: Some(FileStatus::Rejected),
                                    error: Some(format!("unusable model output: {err}")),
                                    ..Default::default()
                                },
                            )?;
                            summary.rejected += 1;
                        }
                    }
                }
                BatchResult::Errored { .. } => {
                    let message = item
                        .result
                        .error_message()
                        .unwrap_or("unknown error")
                        .to_string();
                    eprintln!(
                        "warning: {} failed at the provider: {message}",
                        entry.file_path
                    );
                    state.update_file_by_custom_id(
                        &item.custom_id,
                        FileUpdate {
                            status: Some(FileStatus::Rejected),
                            error: Some(message),
                            ..Default::default()
                        },
                    )?;
                    summary.failed += 1;
                }
                BatchResult::Canceled => {
                    canceled += 1;
                    state.update_file_by_custom_id(
                        &item.custom_id,
                        FileUpdate {
                            status: Some(FileStatus::Skipped),
                            error: Some("request cancelled by the provider".to_string()),
                            ..Default::default()
                        },
                    )?;
                    summary.skipped += 1;
                }
                BatchResult::Expired => {
                    state.update_file_by_custom_id(
                        &item.custom_id,
                        FileUpdate {
                            status: Some(FileStatus::Skipped),
                            error: Some("request expired before processing".to_string()),
                            ..Default::default()
                        },
                    )?;
                    summary.skipped += 1;
                }
            }
        }

        if catalog_dirty {
            if let Some(backup) = self.catalog.save_with_backup()? {
                if self.options.verbose {
                    eprintln!("catalog backed up to {}", backup.display());
                }
            }
        }

        let status = if succeeded > 0 {
            BatchStatus::Completed
        } else if !results.is_empty() && canceled == results.len() {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Failed
        };
        self.registry.complete_batch(batch_id, status)?;
        Ok(())
    }

    /// Routes one successful result: metadata batches update the catalog,
    /// effect batches update the alternatives ledger.
    fn apply_result(
        &mut self,
        entry: &BatchFileEntry,
        metadata: &MediaMetadata,
        state: &mut BatchState,
        catalog_dirty: &mut bool,
        summary: &mut RunSummary,
    ) -> Result<(), StocksmithError> {
        match &entry.kind {
            BatchKind::Metadata => match self.catalog.record_mut(&entry.file_path) {
                Some(record) if record.is_rejected() => {
                    state.update_file_by_custom_id(
                        &entry.custom_id,
                        FileUpdate {
                            status: Some(FileStatus::Rejected),
                            error: Some("catalog row is marked rejected".to_string()),
                            ..Default::default()
                        },
                    )?;
                    summary.rejected += 1;
                }
                Some(record) => {
                    record.apply_metadata(metadata);
                    *catalog_dirty = true;
                    state.update_file_by_custom_id(
                        &entry.custom_id,
                        FileUpdate {
                            status: Some(FileStatus::Completed),
                            result: Some(metadata.clone()),
                            ..Default::default()
                        },
                    )?;
                    summary.completed += 1;
                }
                None => {
                    state.update_file_by_custom_id(
                        &entry.custom_id,
                        FileUpdate {
                            status: Some(FileStatus::Skipped),
                            error: Some("file no longer in the catalog".to_string()),
                            ..Default::default()
                        },
                    )?;
                    summary.skipped += 1;
                }
            },
            BatchKind::Effect { name } => {
                self.registry
                    .mark_alternative_generated(name, &entry.file_path)?;
                state.update_file_by_custom_id(
                    &entry.custom_id,
                    FileUpdate {
                        status: Some(FileStatus::Completed),
                        result: Some(metadata.clone()),
                        ..Default::default()
                    },
                )?;
                summary.completed += 1;
            }
        }
        Ok(())
    }
}

/// Cancels a batch on operator request: asks the provider to stop the job,
/// marks the open entries skipped and archives the batch as cancelled.
/// Returns how many entries were still open.
pub async fn cancel_batch<P: BatchProvider>(
    provider: &P,
    registry: &mut BatchRegistry,
    batch_id: &str,
) -> Result<usize, StocksmithError> {
    let Some(job) = registry.batch(batch_id) else {
        return Err(StocksmithError::Registry(RegistryError::BatchNotFound(
            batch_id.to_string(),
        )));
    };
    if let Some(provider_job_id) = job.provider_job_id.clone() {
        match provider.cancel_batch_job(&provider_job_id).await {
            Ok(true) => {}
            Ok(false) => eprintln!("note: provider job {provider_job_id} had already ended"),
            Err(err) => eprintln!("warning: provider cancel failed: {err}"),
        }
    }
    abandon_batch(registry, batch_id)
}

/// Marks every non-terminal entry of a batch skipped and archives the batch
/// as cancelled, releasing its claims.
fn abandon_batch(registry: &mut BatchRegistry, batch_id: &str) -> Result<usize, StocksmithError> {
    let mut state = BatchState::load(registry.batches_root(), batch_id)?;
    let open: Vec<String> = state
        .files()
        .iter()
        .filter(|f| !f.status.is_terminal())
        .map(|f| f.custom_id.clone())
        .collect();
    for custom_id in &open {
        state.update_file_by_custom_id(
            custom_id,
            FileUpdate {
                status: Some(FileStatus::Skipped),
                error: Some("batch cancelled before completion".to_string()),
                ..Default::default()
            },
        )?;
    }
    registry.complete_batch(batch_id, BatchStatus::Cancelled)?;
    Ok(open.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompter::PromptError;
    use crate::provider::types::{
        BatchResultItem, ContentBlock, ErrorDetail, ErrorEnvelope, Message, MessagesRequest,
        MessagesResponse, RequestCounts, ResponseBlock, Usage,
    };
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    // --- test doubles ---

    #[derive(Default)]
    struct MockProvider {
        create_error: Option<(u16, String)>,
        stall: Cell<bool>,
        /// Custom-id prefixes whose result is unusable model output.
        unparseable: Vec<&'static str>,
        /// Custom-id prefixes that fail at the provider.
        errored: Vec<&'static str>,
        created: RefCell<BTreeMap<String, Vec<String>>>,
        cancelled: RefCell<Vec<String>>,
    }

    impl MockProvider {
        fn created_jobs(&self) -> usize {
            self.created.borrow().len()
        }
    }

    fn mock_batch(id: &str, status: ProcessingStatus) -> MessageBatch {
        MessageBatch {
            id: id.to_string(),
            processing_status: status,
            request_counts: RequestCounts::default(),
            created_at: Utc::now(),
            ended_at: None,
            results_url: None,
        }
    }

    fn succeeded_with(text: &str) -> BatchResult {
        BatchResult::Succeeded {
            message: MessagesResponse {
                id: "msg".to_string(),
                content: vec![ResponseBlock {
                    block_type: "text".to_string(),
                    text: text.to_string(),
                }],
                model: "m".to_string(),
                stop_reason: Some("end_turn".to_string()),
                usage: Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                },
            },
        }
    }

    const AUTO_METADATA: &str = r#"{"title":"Auto title","description":"Auto description","keywords":["auto"],"categories":{"shutterstock":"Nature","alamy":"Travel"}}"#;

    impl BatchProvider for MockProvider {
        fn supports_batch(&self) -> bool {
            true
        }

        async fn create_batch_job(
            &self,
            items: &[BatchItem],
        ) -> Result<MessageBatch, ProviderError> {
            if let Some((status, message)) = &self.create_error {
                return Err(ProviderError::ApiError {
                    status: *status,
                    message: message.clone(),
                });
            }
            let job_id = format!("mb-{}", self.created.borrow().len() + 1);
            let ids = items.iter().map(|i| i.custom_id.clone()).collect();
            self.created.borrow_mut().insert(job_id.clone(), ids);
            Ok(mock_batch(&job_id, ProcessingStatus::InProgress))
        }

        async fn get_batch_job(&self, job_id: &str) -> Result<MessageBatch, ProviderError> {
            if self.stall.get() {
                Ok(mock_batch(job_id, ProcessingStatus::InProgress))
            } else {
                Ok(mock_batch(job_id, ProcessingStatus::Ended))
            }
        }

        async fn fetch_results(
            &self,
            batch: &MessageBatch,
        ) -> Result<Vec<BatchResultItem>, ProviderError> {
            let ids = self
                .created
                .borrow()
                .get(&batch.id)
                .cloned()
                .unwrap_or_default();
            Ok(ids
                .into_iter()
                .map(|custom_id| {
                    let result = if self.errored.iter().any(|p| custom_id.starts_with(p)) {
                        BatchResult::Errored {
                            error: ErrorEnvelope {
                                envelope_type: "error".to_string(),
                                error: ErrorDetail {
                                    error_type: "invalid_request_error".to_string(),
                                    message: "image too large".to_string(),
                                },
                            },
                        }
                    } else if self.unparseable.iter().any(|p| custom_id.starts_with(p)) {
                        succeeded_with("this is not json")
                    } else {
                        succeeded_with(AUTO_METADATA)
                    };
                    BatchResultItem { custom_id, result }
                })
                .collect())
        }

        async fn cancel_batch_job(&self, job_id: &str) -> Result<bool, ProviderError> {
            self.cancelled.borrow_mut().push(job_id.to_string());
            Ok(true)
        }
    }

    struct StubBuilder;

    impl RequestBuilder for StubBuilder {
        fn build_request(&self, entry: &BatchFileEntry) -> Result<MessagesRequest, PromptError> {
            if entry.file_path.contains("unreadable") {
                return Err(PromptError::UnsupportedMedia(entry.file_path.clone()));
            }
            Ok(MessagesRequest {
                model: "test-model".to_string(),
                max_tokens: 64,
                messages: vec![Message::user(vec![ContentBlock::text("describe")])],
            })
        }
    }

    // --- fixtures ---

    struct Fixture {
        _dir: TempDir,
        registry: BatchRegistry,
        catalog: MediaCatalog,
    }

    const CATALOG_HEADER: &str = "file,title,description,keywords,shutterstock status,shutterstock category,alamy status,alamy category";

    fn fixture(rows: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let registry = BatchRegistry::load(&dir.path().join("data")).unwrap();
        let catalog_path = dir.path().join("media_catalog.csv");
        let mut body = String::from(CATALOG_HEADER);
        body.push('\n');
        for row in rows {
            body.push_str(row);
            body.push('\n');
        }
        fs::write(&catalog_path, body).unwrap();
        let catalog = MediaCatalog::load(&catalog_path).unwrap();
        Fixture {
            _dir: dir,
            registry,
            catalog,
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            wait_timeout: Some(Duration::from_secs(5)),
            poll_interval: Duration::ZERO,
            flush: true,
            ..Default::default()
        }
    }

    // --- classification tests ---

    #[test]
    fn classifies_send_errors_by_keyword() {
        assert_eq!(
            classify_send_error("Rate limit exceeded"),
            ErrorClass::RateLimit
        );
        assert_eq!(classify_send_error("auth failed"), ErrorClass::Auth);
        assert_eq!(classify_send_error("invalid api key"), ErrorClass::Auth);
        assert_eq!(classify_send_error("request timeout"), ErrorClass::Network);
        assert_eq!(
            classify_send_error("the operation timed out"),
            ErrorClass::Network
        );
        assert_eq!(
            classify_send_error("connection refused"),
            ErrorClass::Network
        );
        assert_eq!(classify_send_error("everything exploded"), ErrorClass::Other);
    }

    #[test]
    fn classifies_provider_errors_by_structure() {
        assert_eq!(
            classify_provider_error(&ProviderError::RateLimited {
                retry_after_ms: 1000
            }),
            ErrorClass::RateLimit
        );
        assert_eq!(
            classify_provider_error(&ProviderError::ApiError {
                status: 401,
                message: "nope".to_string()
            }),
            ErrorClass::Auth
        );
        assert_eq!(
            classify_provider_error(&ProviderError::ApiError {
                status: 500,
                message: "internal".to_string()
            }),
            ErrorClass::Other
        );
        assert_eq!(
            classify_provider_error(&ProviderError::Parse("bad line".to_string())),
            ErrorClass::Other
        );
    }

    #[test]
    fn zero_wait_timeout_means_unlimited() {
        assert!(wait_timeout_from_secs(0).is_none());
        assert_eq!(wait_timeout_from_secs(90), Some(Duration::from_secs(90)));
    }

    // --- run tests ---

    #[tokio::test]
    async fn full_run_completes_and_updates_catalog() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,", "/x/beta.jpg,,,,,,,"]);
        let provider = MockProvider::default();
        let builder = StubBuilder;

        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[])
        .await
        .unwrap();

        assert_eq!(summary.collected, 2);
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.pending, 0);
        assert_eq!(provider.created_jobs(), 1);

        assert!(fx.registry.active_batches(None).is_empty());
        let completed = fx.registry.completed_batches();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job.status, BatchStatus::Completed);
        assert!(fx.registry.file_owner("/x/alpha.jpg").is_none());

        let record = fx.catalog.record("/x/alpha.jpg").unwrap();
        assert_eq!(record.title, "Auto title");
        assert_eq!(record.marketplaces["shutterstock"].status, "prepared");
        assert_eq!(record.marketplaces["alamy"].category, "Travel");

        // Entries persisted as completed with their results.
        let state = BatchState::load(fx.registry.batches_root(), &completed[0].job.id).unwrap();
        assert!(state
            .files()
            .iter()
            .all(|f| f.status == FileStatus::Completed && f.result.is_some()));
    }

    #[tokio::test]
    async fn size_limit_rolls_collection_into_new_batches() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,", "/x/beta.jpg,,,,,,,"]);
        let provider = MockProvider::default();
        let builder = StubBuilder;
        let opts = RunOptions {
            batch_size: 1,
            ..options()
        };

        let summary =
            BatchOrchestrator::new(&provider, &builder, &mut fx.registry, &mut fx.catalog, opts)
                .run(&[])
                .await
                .unwrap();

        assert_eq!(summary.collected, 2);
        assert_eq!(provider.created_jobs(), 2);
        let completed = fx.registry.completed_batches();
        assert_eq!(completed.len(), 2);
        assert_ne!(completed[0].job.id, completed[1].job.id);
        assert!(completed.iter().all(|c| c.job.file_count == 1));
    }

    #[tokio::test]
    async fn quota_at_cap_defers_submission() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,", "/x/beta.jpg,,,,,,,"]);
        fx.registry
            .increment_daily_count("anthropic", Utc::now().date_naive(), 10)
            .unwrap();
        let provider = MockProvider::default();
        let builder = StubBuilder;

        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[])
        .await
        .unwrap();

        assert_eq!(summary.collected, 2);
        assert_eq!(summary.deferred, 2);
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.pending, 2);
        assert_eq!(provider.created_jobs(), 0);

        let active = fx.registry.active_batches(None);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, BatchStatus::Collecting);
        assert_eq!(
            fx.registry
                .daily_count("anthropic", Utc::now().date_naive()),
            10
        );
    }

    #[tokio::test]
    async fn retryable_submission_failure_keeps_batch_collecting() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,"]);
        let provider = MockProvider {
            create_error: Some((500, "internal server error".to_string())),
            ..Default::default()
        };
        let builder = StubBuilder;

        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[])
        .await
        .unwrap();

        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.submitted, 0);
        let active = fx.registry.active_batches(None);
        assert_eq!(active[0].status, BatchStatus::Collecting);
        assert_eq!(
            fx.registry.file_owner("/x/alpha.jpg"),
            Some(active[0].id.as_str())
        );
    }

    #[tokio::test]
    async fn auth_failure_aborts_the_run() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,"]);
        let provider = MockProvider {
            create_error: Some((401, "authentication_error: invalid x-api-key".to_string())),
            ..Default::default()
        };
        let builder = StubBuilder;

        let err = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[])
        .await
        .unwrap_err();

        assert!(matches!(err, StocksmithError::Provider(_)));
        // The batch survives for a retry once credentials are fixed.
        let active = fx.registry.active_batches(None);
        assert_eq!(active.len(), 1);
        assert!(fx.registry.file_owner("/x/alpha.jpg").is_some());
    }

    #[tokio::test]
    async fn wait_timeout_leaves_batch_polling() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,", "/x/beta.jpg,,,,,,,"]);
        let provider = MockProvider {
            stall: Cell::new(true),
            ..Default::default()
        };
        let builder = StubBuilder;
        let opts = RunOptions {
            wait_timeout: Some(Duration::ZERO),
            ..options()
        };

        let summary =
            BatchOrchestrator::new(&provider, &builder, &mut fx.registry, &mut fx.catalog, opts)
                .run(&[])
                .await
                .unwrap();

        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.pending, 2);
        let active = fx.registry.active_batches(None);
        assert_eq!(active[0].status, BatchStatus::Polling);
        assert_eq!(active[0].poll_timeouts, 1);
        assert!(provider.cancelled.borrow().is_empty());
        assert!(fx.registry.file_owner("/x/alpha.jpg").is_some());
    }

    #[tokio::test]
    async fn next_run_resumes_and_completes_polling_batch() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,", "/x/beta.jpg,,,,,,,"]);
        let provider = MockProvider {
            stall: Cell::new(true),
            ..Default::default()
        };
        let builder = StubBuilder;
        let opts = RunOptions {
            wait_timeout: Some(Duration::ZERO),
            ..options()
        };

        BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            opts.clone(),
        )
        .run(&[])
        .await
        .unwrap();

        // The job finishes between runs.
        provider.stall.set(false);
        let summary =
            BatchOrchestrator::new(&provider, &builder, &mut fx.registry, &mut fx.catalog, opts)
                .run(&[])
                .await
                .unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.pending, 0);
        assert!(fx.registry.active_batches(None).is_empty());
        assert_eq!(
            fx.catalog.record("/x/alpha.jpg").unwrap().title,
            "Auto title"
        );
    }

    #[tokio::test]
    async fn repeated_timeouts_cancel_the_provider_job() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,", "/x/beta.jpg,,,,,,,"]);
        let provider = MockProvider {
            stall: Cell::new(true),
            ..Default::default()
        };
        let builder = StubBuilder;
        let opts = RunOptions {
            wait_timeout: Some(Duration::ZERO),
            max_poll_timeouts: 1,
            ..options()
        };

        let summary =
            BatchOrchestrator::new(&provider, &builder, &mut fx.registry, &mut fx.catalog, opts)
                .run(&[])
                .await
                .unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.pending, 0);
        assert_eq!(provider.cancelled.borrow().as_slice(), ["mb-1"]);

        let completed = fx.registry.completed_batches();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job.status, BatchStatus::Cancelled);
        assert!(fx.registry.file_owner("/x/alpha.jpg").is_none());

        let state = BatchState::load(fx.registry.batches_root(), &completed[0].job.id).unwrap();
        assert!(state
            .files()
            .iter()
            .all(|f| f.status == FileStatus::Skipped));
    }

    #[tokio::test]
    async fn bad_results_are_isolated_per_file() {
        let mut fx = fixture(&[
            "/x/alpha.jpg,,,,,,,",
            "/x/bad.jpg,,,,,,,",
            "/x/broken.jpg,,,,,,,",
        ]);
        let provider = MockProvider {
            errored: vec!["bad_"],
            unparseable: vec!["broken_"],
            ..Default::default()
        };
        let builder = StubBuilder;

        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[])
        .await
        .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rejected, 1);

        // Partial success still completes the batch.
        let completed = fx.registry.completed_batches();
        assert_eq!(completed[0].job.status, BatchStatus::Completed);

        assert_eq!(
            fx.catalog.record("/x/alpha.jpg").unwrap().title,
            "Auto title"
        );
        assert!(fx.catalog.record("/x/bad.jpg").unwrap().title.is_empty());
        assert!(fx.catalog.record("/x/broken.jpg").unwrap().title.is_empty());

        let state = BatchState::load(fx.registry.batches_root(), &completed[0].job.id).unwrap();
        let bad = state
            .files()
            .iter()
            .find(|f| f.file_path == "/x/bad.jpg")
            .unwrap();
        assert_eq!(bad.status, FileStatus::Rejected);
        assert_eq!(bad.error.as_deref(), Some("image too large"));
    }

    #[tokio::test]
    async fn row_rejected_after_send_is_not_updated() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,"]);
        let provider = MockProvider {
            stall: Cell::new(true),
            ..Default::default()
        };
        let builder = StubBuilder;
        let opts = RunOptions {
            wait_timeout: Some(Duration::ZERO),
            ..options()
        };

        BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            opts.clone(),
        )
        .run(&[])
        .await
        .unwrap();

        // An operator rejects the row while the job is still running.
        fx.catalog
            .record_mut("/x/alpha.jpg")
            .unwrap()
            .marketplaces
            .get_mut("shutterstock")
            .unwrap()
            .status = "rejected".to_string();

        provider.stall.set(false);
        let summary =
            BatchOrchestrator::new(&provider, &builder, &mut fx.registry, &mut fx.catalog, opts)
                .run(&[])
                .await
                .unwrap();

        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.completed, 0);
        let record = fx.catalog.record("/x/alpha.jpg").unwrap();
        assert!(record.title.is_empty());
        assert_eq!(record.marketplaces["alamy"].status, "");
    }

    #[tokio::test]
    async fn effect_runs_update_the_alternatives_ledger() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,"]);
        let provider = MockProvider::default();
        let builder = StubBuilder;
        let opts = RunOptions {
            effect: Some("vintage".to_string()),
            ..options()
        };

        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            opts.clone(),
        )
        .run(&["/x/alpha.jpg".to_string()])
        .await
        .unwrap();

        assert_eq!(summary.completed, 1);
        assert!(fx.registry.alternative_generated("vintage", "/x/alpha.jpg"));
        // Effect results never touch the catalog row.
        assert!(fx.catalog.record("/x/alpha.jpg").unwrap().title.is_empty());

        let completed = fx.registry.completed_batches();
        assert_eq!(
            completed[0].job.kind,
            BatchKind::Effect {
                name: "vintage".to_string()
            }
        );

        // A second pass skips the file via the ledger.
        let summary =
            BatchOrchestrator::new(&provider, &builder, &mut fx.registry, &mut fx.catalog, opts)
                .run(&["/x/alpha.jpg".to_string()])
                .await
                .unwrap();
        assert_eq!(summary.collected, 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn unknown_and_ineligible_paths_are_skipped() {
        let mut fx = fixture(&[
            "/x/alpha.jpg,T,D,k,submitted,Nature,prepared,Travel",
            "/x/vetoed.jpg,,,,rejected,,,",
        ]);
        let provider = MockProvider::default();
        let builder = StubBuilder;

        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[
            "/x/ghost.jpg".to_string(),
            "/x/alpha.jpg".to_string(),
            "/x/vetoed.jpg".to_string(),
        ])
        .await
        .unwrap();

        assert_eq!(summary.collected, 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(provider.created_jobs(), 0);
        assert!(fx.registry.active_batches(None).is_empty());
    }

    #[tokio::test]
    async fn unreadable_files_are_skipped_at_submission() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,", "/x/unreadable.jpg,,,,,,,"]);
        let provider = MockProvider::default();
        let builder = StubBuilder;

        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[])
        .await
        .unwrap();

        assert_eq!(summary.collected, 2);
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.completed, 1);

        let completed = fx.registry.completed_batches();
        // The skip released its slot before the batch was archived.
        assert_eq!(completed[0].job.file_count, 1);
        let state = BatchState::load(fx.registry.batches_root(), &completed[0].job.id).unwrap();
        let skipped = state
            .files()
            .iter()
            .find(|f| f.file_path == "/x/unreadable.jpg")
            .unwrap();
        assert_eq!(skipped.status, FileStatus::Skipped);
        assert!(fx.registry.file_owner("/x/unreadable.jpg").is_none());
    }

    #[tokio::test]
    async fn batch_with_no_sendable_files_is_archived() {
        let mut fx = fixture(&["/x/unreadable-a.jpg,,,,,,,", "/x/unreadable-b.jpg,,,,,,,"]);
        let provider = MockProvider::default();
        let builder = StubBuilder;

        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[])
        .await
        .unwrap();

        assert_eq!(summary.collected, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.pending, 0);
        assert_eq!(provider.created_jobs(), 0);

        // The emptied batch is archived, not left collecting.
        assert!(fx.registry.active_batches(None).is_empty());
        let completed = fx.registry.completed_batches();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job.status, BatchStatus::Failed);
        assert_eq!(completed[0].job.file_count, 0);
        assert!(fx.registry.file_owner("/x/unreadable-a.jpg").is_none());

        // A rerun over the same catalog resolves the same way instead of
        // stacking claims onto a stale batch.
        let summary = BatchOrchestrator::new(
            &provider,
            &builder,
            &mut fx.registry,
            &mut fx.catalog,
            options(),
        )
        .run(&[])
        .await
        .unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.pending, 0);
        assert!(fx.registry.active_batches(None).is_empty());
        assert_eq!(fx.registry.completed_batches().len(), 2);
    }

    #[tokio::test]
    async fn operator_cancel_releases_the_batch() {
        let mut fx = fixture(&["/x/alpha.jpg,,,,,,,", "/x/beta.jpg,,,,,,,"]);
        let provider = MockProvider {
            stall: Cell::new(true),
            ..Default::default()
        };
        let builder = StubBuilder;
        let opts = RunOptions {
            wait_timeout: Some(Duration::ZERO),
            ..options()
        };

        BatchOrchestrator::new(&provider, &builder, &mut fx.registry, &mut fx.catalog, opts)
            .run(&[])
            .await
            .unwrap();

        let batch_id = fx.registry.active_batches(None)[0].id.clone();
        let released = cancel_batch(&provider, &mut fx.registry, &batch_id)
            .await
            .unwrap();

        assert_eq!(released, 2);
        assert_eq!(provider.cancelled.borrow().as_slice(), ["mb-1"]);
        assert!(fx.registry.active_batches(None).is_empty());
        assert_eq!(
            fx.registry.completed_batches()[0].job.status,
            BatchStatus::Cancelled
        );
        assert!(fx.registry.file_owner("/x/alpha.jpg").is_none());
    }

    #[tokio::test]
    async fn cancel_of_unknown_batch_is_an_error() {
        let mut fx = fixture(&[]);
        let provider = MockProvider::default();
        let err = cancel_batch(&provider, &mut fx.registry, "batch-nope")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StocksmithError::Registry(RegistryError::BatchNotFound(_))
        ));
    }
}
