use crate::config::ImportConfig;
use crate::storage::{ImportStore, NewImportJob, RowWrite};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use importers::contact_csv::{
    action_for_confidence, apply_overrides, recommend_action, ColumnMap, ContactIndex,
    CsvParser, FieldMapper, NormalizeWorkerPool, NormalizedBatch, ParsedCsv,
    EMAIL_MATCH_CONFIDENCE, PHONE_MATCH_CONFIDENCE,
};
use shared_types::{
    CheckDuplicatesRequest, CheckDuplicatesResponse, DuplicateLookupError, DuplicateStrategy,
    FieldMapping, ImportIssue, ImportJob, ImportJobStatus, ImportRowLog, ImportSummary,
    MappingError, MatchType, NormalizedContact, ParseError, RecommendedAction, RowOutcome,
    UploadResponse,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const CANCELLED_REASON: &str = "cancelled";
pub const SHUTDOWN_REASON: &str = "cancelled: server shutting down";
pub const INTERRUPTED_REASON: &str = "interrupted by restart";
const NOTHING_APPLIED_REASON: &str = "no row was imported, merged or skipped";

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Import job {0} not found")]
    NotFound(i64),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Import job {job_id} is {status}; this requires {expected}")]
    InvalidState {
        job_id: i64,
        status: &'static str,
        expected: &'static str,
    },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Lookup(#[from] DuplicateLookupError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ImportSettings {
    pub max_concurrent_writes: usize,
    pub row_write_timeout: Duration,
    pub index_retry_attempts: u32,
    pub index_retry_backoff: Duration,
    pub max_file_size_bytes: u64,
}

impl From<&ImportConfig> for ImportSettings {
    fn from(config: &ImportConfig) -> Self {
        Self {
            max_concurrent_writes: config.max_concurrent_writes.max(1),
            row_write_timeout: Duration::from_millis(config.row_write_timeout_ms.max(1)),
            index_retry_attempts: config.index_retry_attempts.max(1),
            index_retry_backoff: Duration::from_millis(config.index_retry_backoff_ms),
            max_file_size_bytes: config.max_file_size_bytes,
        }
    }
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self::from(&ImportConfig::default())
    }
}

/// Per-worker outcome counts, merged once when the apply phase ends
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportTally {
    pub imported: u64,
    pub merged: u64,
    pub skipped: u64,
    pub failed: u64,
    pub not_started: u64,
}

impl ImportTally {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Imported => self.imported += 1,
            RowOutcome::Merged => self.merged += 1,
            RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: ImportTally) {
        self.imported += other.imported;
        self.merged += other.merged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.not_started += other.not_started;
    }

    pub fn succeeded(&self) -> u64 {
        self.imported + self.merged + self.skipped
    }
}

#[derive(Debug, Default)]
struct CancelToken {
    reason: OnceLock<String>,
}

impl CancelToken {
    fn cancel(&self, reason: &str) {
        let _ = self.reason.set(reason.to_string());
    }

    fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }
}

struct ActiveImport {
    handle: Option<JoinHandle<()>>,
    cancel: Arc<CancelToken>,
}

#[derive(Debug)]
enum PlannedRow {
    Write(RowWrite),
    Record(ImportRowLog),
    /// Writes into the contact an earlier row of the same unit inserts
    FollowRow {
        target_row: usize,
        contact: NormalizedContact,
        replace: bool,
    },
}

/// The contact a unit of work writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum UnitKey {
    Existing(i64),
    Row(usize),
}

/// A row sharing an identity key with an earlier row of the same file
#[derive(Debug, Clone, PartialEq, Eq)]
struct InFileRepeat {
    row_index: usize,
    earlier_row: usize,
    basis: &'static str,
}

#[derive(Debug)]
struct RowPlan {
    units: Vec<Vec<PlannedRow>>,
    repeats: Vec<InFileRepeat>,
}

/// Identity keys of rows already planned, with the contact each one writes to
#[derive(Default)]
struct PlannedKeys {
    by_email: HashMap<String, (UnitKey, usize)>,
    by_phone: HashMap<String, (UnitKey, usize)>,
}

impl PlannedKeys {
    fn remember(&mut self, contact: &NormalizedContact, key: UnitKey) {
        if let Some(email) = &contact.normalized_email {
            self.by_email
                .entry(email.clone())
                .or_insert((key, contact.row_index));
        }
        if let Some(phone) = &contact.normalized_phone {
            self.by_phone
                .entry(phone.clone())
                .or_insert((key, contact.row_index));
        }
    }

    /// Strongest earlier row sharing a key, as (target, earlier row, tier, confidence)
    fn find(&self, contact: &NormalizedContact) -> Option<(UnitKey, usize, MatchType, f32)> {
        let email_hit = contact
            .normalized_email
            .as_ref()
            .and_then(|email| self.by_email.get(email));
        if let Some(&(key, row)) = email_hit {
            return Some((key, row, MatchType::Email, EMAIL_MATCH_CONFIDENCE));
        }

        contact
            .normalized_phone
            .as_ref()
            .and_then(|phone| self.by_phone.get(phone))
            .map(|&(key, row)| (key, row, MatchType::Phone, PHONE_MATCH_CONFIDENCE))
    }
}

/// Everything the background apply task shares with request handlers
struct Pipeline {
    store: Arc<dyn ImportStore>,
    mapper: FieldMapper,
    workers: NormalizeWorkerPool,
    settings: ImportSettings,
}

pub struct ImportManager {
    pipeline: Arc<Pipeline>,
    active_jobs: Arc<Mutex<HashMap<i64, ActiveImport>>>,
    shutting_down: AtomicBool,
}

impl ImportManager {
    pub fn new(
        store: Arc<dyn ImportStore>,
        mapper: FieldMapper,
        workers: NormalizeWorkerPool,
        settings: ImportSettings,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                store,
                mapper,
                workers,
                settings,
            }),
            active_jobs: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn get_job(
        &self,
        organization_id: i64,
        job_id: i64,
    ) -> Result<ImportJob, ImportError> {
        self.pipeline
            .store
            .get_job(organization_id, job_id)
            .await?
            .ok_or(ImportError::NotFound(job_id))
    }

    pub async fn list_jobs(&self, organization_id: i64) -> Result<Vec<ImportJob>, ImportError> {
        Ok(self.pipeline.store.list_jobs(organization_id).await?)
    }

    pub async fn row_logs(
        &self,
        organization_id: i64,
        job_id: i64,
    ) -> Result<Vec<ImportRowLog>, ImportError> {
        self.get_job(organization_id, job_id).await?;
        Ok(self.pipeline.store.row_logs(job_id).await?)
    }

    /// Stores the file as a new job and prepares it up to `duplicates_checked`.
    ///
    /// Job-fatal conditions are reported through `success: false` in the
    /// response; the job itself records them.
    pub async fn upload(
        &self,
        organization_id: i64,
        filename: &str,
        uploaded_by: Option<String>,
        content: Vec<u8>,
    ) -> Result<UploadResponse, ImportError> {
        if self.is_shutting_down() {
            return Err(ImportError::InvalidRequest("Server is shutting down".to_string()));
        }
        if filename.trim().is_empty() {
            return Err(ImportError::InvalidRequest("filename is required".to_string()));
        }
        let limit = self.pipeline.settings.max_file_size_bytes;
        if content.len() as u64 > limit {
            return Err(ImportError::InvalidRequest(format!(
                "File is {} bytes; the limit is {} bytes",
                content.len(),
                limit
            )));
        }

        let job = self
            .pipeline
            .store
            .create_job(NewImportJob {
                organization_id,
                filename: filename.trim().to_string(),
                uploaded_by,
                content: content.clone(),
            })
            .await?;

        tracing::info!(
            "Import job {} created for organization {} ({}, {} bytes)",
            job.id,
            organization_id,
            job.filename,
            job.file_size
        );

        self.pipeline.prepare(&job, content, None).await
    }

    pub async fn get_mappings(
        &self,
        organization_id: i64,
        job_id: i64,
    ) -> Result<Vec<FieldMapping>, ImportError> {
        self.get_job(organization_id, job_id).await?;
        Ok(self
            .pipeline
            .store
            .load_mappings(job_id)
            .await?
            .unwrap_or_default())
    }

    /// Replaces the detected mapping with a reviewed one and prepares the job again.
    ///
    /// Accepted until the import starts. A checked job has its duplicate
    /// count refreshed and stays `duplicates_checked`.
    pub async fn update_mappings(
        &self,
        organization_id: i64,
        job_id: i64,
        mappings: Vec<FieldMapping>,
    ) -> Result<UploadResponse, ImportError> {
        // Held so the import cannot start while the mapping changes
        let _active_jobs = self.active_jobs.lock().await;

        let job = self.get_job(organization_id, job_id).await?;
        if !matches!(
            job.status,
            ImportJobStatus::Uploaded | ImportJobStatus::DuplicatesChecked
        ) {
            return Err(ImportError::InvalidState {
                job_id,
                status: job.status.as_str(),
                expected: "uploaded or duplicates_checked",
            });
        }

        let content = self.pipeline.store.load_file(job_id).await?;
        self.pipeline.prepare(&job, content, Some(mappings)).await
    }

    /// Moves a checked job into `importing` and applies its rows in the background
    pub async fn start_import(
        &self,
        organization_id: i64,
        job_id: i64,
        strategy: DuplicateStrategy,
    ) -> Result<ImportJob, ImportError> {
        if self.is_shutting_down() {
            return Err(ImportError::InvalidRequest("Server is shutting down".to_string()));
        }

        let job = self.get_job(organization_id, job_id).await?;

        let mut active_jobs = self.active_jobs.lock().await;
        if active_jobs.contains_key(&job_id) {
            return Err(ImportError::InvalidState {
                job_id,
                status: job.status.as_str(),
                expected: "no import already running",
            });
        }

        if !self.pipeline.store.begin_import(job_id, strategy).await? {
            return Err(ImportError::InvalidState {
                job_id,
                status: job.status.as_str(),
                expected: "duplicates_checked",
            });
        }

        let job = self.get_job(organization_id, job_id).await?;
        tracing::info!(
            "Import job {} started with strategy {}",
            job_id,
            strategy.as_str()
        );

        let cancel = Arc::new(CancelToken::default());
        let pipeline = self.pipeline.clone();
        let active = self.active_jobs.clone();
        let task_job = job.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            pipeline.finish_import(&task_job, &task_cancel).await;
            active.lock().await.remove(&task_job.id);
        });

        active_jobs.insert(
            job_id,
            ActiveImport {
                handle: Some(handle),
                cancel,
            },
        );

        Ok(job)
    }

    /// Stops a job. Rows already committed stay committed.
    pub async fn cancel_import(
        &self,
        organization_id: i64,
        job_id: i64,
    ) -> Result<ImportJob, ImportError> {
        let job = self.get_job(organization_id, job_id).await?;

        {
            let active_jobs = self.active_jobs.lock().await;
            if let Some(active) = active_jobs.get(&job_id) {
                active.cancel.cancel(CANCELLED_REASON);
                tracing::info!("Cancellation requested for import job {}", job_id);
                return Ok(job);
            }
        }

        if job.status.is_terminal()
            || !self
                .pipeline
                .store
                .transition(job_id, ImportJobStatus::Failed, Some(CANCELLED_REASON))
                .await?
        {
            let current = self.get_job(organization_id, job_id).await?;
            return Err(ImportError::InvalidState {
                job_id,
                status: current.status.as_str(),
                expected: "a job that has not finished",
            });
        }

        tracing::info!("Import job {} cancelled before importing", job_id);
        self.get_job(organization_id, job_id).await
    }

    /// Waits for a running import to finish; returns immediately if none runs
    pub async fn wait_for_job(&self, job_id: i64) {
        let handle = {
            let mut active_jobs = self.active_jobs.lock().await;
            active_jobs.get_mut(&job_id).and_then(|a| a.handle.take())
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Import task for job {} ended abnormally: {}", job_id, e);
            }
        }
    }

    /// Fails jobs a previous process left in `importing`
    pub async fn restore_interrupted_jobs(&self) -> Result<Vec<i64>> {
        let ids = self.pipeline.store.fail_interrupted(INTERRUPTED_REASON).await?;
        for id in &ids {
            tracing::warn!("Import job {} was interrupted by a restart and is now failed", id);
        }
        Ok(ids)
    }

    pub async fn check_duplicates(
        &self,
        request: CheckDuplicatesRequest,
    ) -> Result<CheckDuplicatesResponse, ImportError> {
        if let Some(import_id) = request.import_id {
            self.get_job(request.organization_id, import_id).await?;
        }

        let index = self.pipeline.build_index(request.organization_id).await?;
        let contacts = request.contacts;
        let (results, stats) = run_blocking(move || index.check_batch(&contacts)).await?;

        tracing::info!(
            "Checked {} contact(s) for organization {}: {} with duplicates in {}ms",
            stats.total_checked,
            request.organization_id,
            stats.with_duplicates,
            stats.elapsed_ms
        );

        Ok(CheckDuplicatesResponse { results, stats })
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let handles: Vec<(i64, JoinHandle<()>)> = {
            let mut active_jobs = self.active_jobs.lock().await;
            active_jobs
                .iter_mut()
                .filter_map(|(id, active)| {
                    active.cancel.cancel(SHUTDOWN_REASON);
                    active.handle.take().map(|handle| (*id, handle))
                })
                .collect()
        };

        for (job_id, handle) in handles {
            tracing::info!("Waiting for import job {} to stop", job_id);
            if let Err(e) = handle.await {
                tracing::warn!("Import task for job {} ended abnormally: {}", job_id, e);
            }
        }

        Ok(())
    }
}

async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("Blocking task failed: {}", e))
}

fn issue(row_index: Option<usize>, code: &str, message: String) -> ImportIssue {
    ImportIssue {
        row_index,
        code: code.to_string(),
        field: None,
        message,
    }
}

fn mapping_issue(err: &MappingError) -> ImportIssue {
    let field = match err {
        MappingError::Ambiguous { field, .. } => Some(*field),
        MappingError::UnknownColumn { .. } => None,
    };
    ImportIssue {
        row_index: None,
        code: err.code().to_string(),
        field,
        message: err.to_string(),
    }
}

fn preparation_issues(parsed: &ParsedCsv) -> Vec<ImportIssue> {
    parsed
        .reshaped_rows
        .iter()
        .map(|&row_index| {
            issue(
                Some(row_index),
                "column_count_mismatch",
                format!(
                    "Row {} did not have {} cells and was padded or truncated",
                    row_index,
                    parsed.headers.len()
                ),
            )
        })
        .collect()
}

fn validation_issues(batch: &NormalizedBatch) -> Vec<ImportIssue> {
    batch
        .rejected
        .iter()
        .map(|err| ImportIssue {
            row_index: Some(err.row_index),
            code: err.reason.as_str().to_string(),
            field: err.field,
            message: err.to_string(),
        })
        .collect()
}

fn response(success: bool, job_id: i64, summary: ImportSummary) -> UploadResponse {
    UploadResponse {
        success,
        import_id: job_id,
        summary,
    }
}

fn skipped_in_file(row_index: usize, earlier_row: usize, contact_id: Option<i64>) -> PlannedRow {
    PlannedRow::Record(ImportRowLog {
        row_index,
        outcome: RowOutcome::Skipped,
        reason: Some(format!("duplicate of row {} in this file", earlier_row)),
        contact_id,
    })
}

fn insert_unit(
    units: &mut BTreeMap<UnitKey, Vec<PlannedRow>>,
    keys: &mut PlannedKeys,
    contact: NormalizedContact,
    reason: Option<String>,
) {
    let key = UnitKey::Row(contact.row_index);
    keys.remember(&contact, key);
    units
        .entry(key)
        .or_default()
        .push(PlannedRow::Write(RowWrite::Insert { contact, reason }));
}

fn repeat_issue(repeat: &InFileRepeat) -> ImportIssue {
    issue(
        Some(repeat.row_index),
        "duplicate_in_file",
        format!(
            "Row {} repeats row {} (same {})",
            repeat.row_index, repeat.earlier_row, repeat.basis
        ),
    )
}

/// Groups rows into units of work. Rows that write to the same contact share
/// a unit and run in row order, whether that contact exists already or is
/// inserted by an earlier row of the file. Every skip is a unit of its own.
///
/// A row sharing an email or phone with an earlier row follows the same
/// tiers as a match against an existing contact, unless an existing contact
/// matches it more strongly.
fn plan_rows(
    contacts: Vec<NormalizedContact>,
    index: &ContactIndex,
    strategy: DuplicateStrategy,
) -> RowPlan {
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut keys = PlannedKeys::default();
    let mut units: BTreeMap<UnitKey, Vec<PlannedRow>> = BTreeMap::new();
    let mut skips: Vec<PlannedRow> = Vec::new();
    let mut repeats: Vec<InFileRepeat> = Vec::new();

    for contact in contacts {
        if let Some(&earlier) = first_seen.get(&contact.dedup_hash) {
            repeats.push(InFileRepeat {
                row_index: contact.row_index,
                earlier_row: earlier,
                basis: "identity",
            });
            skips.push(skipped_in_file(contact.row_index, earlier, None));
            continue;
        }
        first_seen.insert(contact.dedup_hash.clone(), contact.row_index);

        let matches = index.find_duplicates(&contact);
        let existing_confidence = matches.first().map_or(0.0, |m| m.confidence);

        if let Some((target, earlier, match_type, confidence)) = keys.find(&contact) {
            if confidence > existing_confidence {
                repeats.push(InFileRepeat {
                    row_index: contact.row_index,
                    earlier_row: earlier,
                    basis: match_type.as_str(),
                });
                let existing_id = match target {
                    UnitKey::Existing(id) => Some(id),
                    UnitKey::Row(_) => None,
                };

                match strategy.resolve(action_for_confidence(confidence)) {
                    RecommendedAction::Skip => {
                        skips.push(skipped_in_file(contact.row_index, earlier, existing_id));
                    }
                    action @ (RecommendedAction::Merge | RecommendedAction::Replace) => {
                        let replace = action == RecommendedAction::Replace;
                        keys.remember(&contact, target);
                        let row = match target {
                            UnitKey::Existing(contact_id) if replace => {
                                PlannedRow::Write(RowWrite::Replace { contact_id, contact })
                            }
                            UnitKey::Existing(contact_id) => {
                                PlannedRow::Write(RowWrite::Merge { contact_id, contact })
                            }
                            UnitKey::Row(target_row) => PlannedRow::FollowRow {
                                target_row,
                                contact,
                                replace,
                            },
                        };
                        units.entry(target).or_default().push(row);
                    }
                    _ => {
                        let reason = Some(format!("kept alongside row {} of this file", earlier));
                        insert_unit(&mut units, &mut keys, contact, reason);
                    }
                }
                continue;
            }
        }

        let action = strategy.resolve(recommend_action(&matches));
        match (action, matches.first()) {
            (RecommendedAction::Skip, Some(top)) => {
                skips.push(PlannedRow::Record(ImportRowLog {
                    row_index: contact.row_index,
                    outcome: RowOutcome::Skipped,
                    reason: Some(format!(
                        "duplicate of contact {} ({} match, confidence {:.1})",
                        top.contact_id,
                        top.match_type.as_str(),
                        top.confidence
                    )),
                    contact_id: Some(top.contact_id),
                }));
            }
            (RecommendedAction::Merge | RecommendedAction::Replace, Some(top)) => {
                let target = UnitKey::Existing(top.contact_id);
                let contact_id = top.contact_id;
                keys.remember(&contact, target);
                let write = if action == RecommendedAction::Replace {
                    RowWrite::Replace { contact_id, contact }
                } else {
                    RowWrite::Merge { contact_id, contact }
                };
                units.entry(target).or_default().push(PlannedRow::Write(write));
            }
            (RecommendedAction::KeepBoth, Some(top)) => {
                let reason = Some(format!("kept alongside contact {}", top.contact_id));
                insert_unit(&mut units, &mut keys, contact, reason);
            }
            _ => insert_unit(&mut units, &mut keys, contact, None),
        }
    }

    RowPlan {
        units: units
            .into_values()
            .chain(skips.into_iter().map(|row| vec![row]))
            .collect(),
        repeats,
    }
}

impl Pipeline {
    async fn build_index(
        &self,
        organization_id: i64,
    ) -> Result<ContactIndex, DuplicateLookupError> {
        let attempts = self.settings.index_retry_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.store.existing_contacts(organization_id).await {
                Ok(contacts) => {
                    tracing::debug!(
                        "Indexed {} contact(s) of organization {}",
                        contacts.len(),
                        organization_id
                    );
                    return Ok(ContactIndex::build(organization_id, contacts));
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Contact index fetch for organization {} failed (attempt {}/{}): {}",
                        organization_id,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(self.settings.index_retry_backoff * attempt).await;
                }
                Err(e) => {
                    return Err(DuplicateLookupError {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    async fn parse(&self, content: Vec<u8>) -> Result<Result<ParsedCsv, ParseError>> {
        run_blocking(move || CsvParser::new().parse(&content)).await
    }

    async fn normalize(
        &self,
        parsed: &mut ParsedCsv,
        columns: ColumnMap,
    ) -> Result<NormalizedBatch> {
        let rows = std::mem::take(&mut parsed.rows);
        let workers = self.workers.clone();
        run_blocking(move || workers.normalize_all(&rows, &columns)).await
    }

    async fn fail_job(&self, job_id: i64, reason: &str) -> Result<()> {
        tracing::error!("Import job {} failed: {}", job_id, reason);
        self.store
            .transition(job_id, ImportJobStatus::Failed, Some(reason))
            .await?;
        Ok(())
    }

    /// Parses, maps, normalizes and checks a job against existing contacts.
    ///
    /// An `uploaded` job moves on to `duplicates_checked`. A job already there
    /// is checked again under the reviewed mapping and keeps its status; its
    /// stored mapping only changes when that check succeeds.
    async fn prepare(
        &self,
        job: &ImportJob,
        content: Vec<u8>,
        overrides: Option<Vec<FieldMapping>>,
    ) -> Result<UploadResponse, ImportError> {
        let reviewing = job.status == ImportJobStatus::DuplicatesChecked;

        let mut parsed = match self.parse(content).await? {
            Ok(parsed) => parsed,
            Err(err) if reviewing => return Err(ImportError::InvalidRequest(err.to_string())),
            Err(err) => {
                self.fail_job(job.id, &err.to_string()).await?;
                let summary = ImportSummary {
                    total_rows: 0,
                    detected_fields: Vec::new(),
                    duplicates_found: 0,
                    errors: vec![issue(None, err.code(), err.to_string())],
                };
                return Ok(response(false, job.id, summary));
            }
        };

        let mappings = match overrides {
            Some(overrides) => apply_overrides(&parsed.headers, &overrides)?,
            None => self.mapper.map_fields(&parsed.headers),
        };
        if !reviewing {
            self.store.save_mappings(job.id, &mappings).await?;
        }

        let total_rows = parsed.total_rows() as u64;
        let mut summary = ImportSummary {
            total_rows,
            detected_fields: mappings.clone(),
            duplicates_found: 0,
            errors: preparation_issues(&parsed),
        };

        let columns = match ColumnMap::from_mappings(&mappings) {
            Ok(columns) => columns,
            Err(err) if reviewing => return Err(err.into()),
            Err(err) => {
                // Stays `uploaded` until a reviewed mapping arrives
                tracing::warn!("Import job {} needs mapping review: {}", job.id, err);
                self.store
                    .record_preparation(job.id, total_rows, 0, Some(&err.to_string()))
                    .await?;
                summary.errors.insert(0, mapping_issue(&err));
                return Ok(response(false, job.id, summary));
            }
        };

        if !reviewing {
            let parsed_ok = self
                .store
                .transition(job.id, ImportJobStatus::Parsed, None)
                .await?;
            if !parsed_ok {
                return Err(anyhow::anyhow!(
                    "Import job {} left the uploaded state during preparation",
                    job.id
                )
                .into());
            }
            tracing::info!("Import job {} parsed: {} row(s)", job.id, total_rows);
        }

        let batch = self.normalize(&mut parsed, columns).await?;
        summary.errors.extend(validation_issues(&batch));

        if batch.contacts.is_empty() {
            let reason = "File has no valid rows";
            if reviewing {
                return Err(ImportError::InvalidRequest(format!(
                    "{} under the reviewed mapping; the previous mapping is kept",
                    reason
                )));
            }
            self.store
                .record_preparation(job.id, total_rows, 0, None)
                .await?;
            self.fail_job(job.id, reason).await?;
            summary.errors.push(issue(None, "no_valid_rows", reason.to_string()));
            return Ok(response(false, job.id, summary));
        }

        let index = match self.build_index(job.organization_id).await {
            Ok(index) => index,
            Err(err) if reviewing => return Err(err.into()),
            Err(err) => {
                self.store
                    .record_preparation(job.id, total_rows, 0, None)
                    .await?;
                self.fail_job(job.id, &err.to_string()).await?;
                summary.errors.push(issue(None, "duplicate_lookup", err.to_string()));
                return Ok(response(false, job.id, summary));
            }
        };

        let plan = plan_rows(batch.contacts.clone(), &index, DuplicateStrategy::Recommended);
        let repeated: HashSet<usize> = plan.repeats.iter().map(|r| r.row_index).collect();
        summary.duplicates_found = batch
            .contacts
            .iter()
            .filter(|c| !repeated.contains(&c.row_index))
            .filter(|c| !index.find_duplicates(c).is_empty())
            .count() as u64;
        summary.errors.extend(plan.repeats.iter().map(repeat_issue));

        if reviewing {
            self.store.save_mappings(job.id, &mappings).await?;
        }
        self.store
            .record_preparation(job.id, total_rows, summary.duplicates_found, None)
            .await?;

        if !reviewing {
            let checked = self
                .store
                .transition(job.id, ImportJobStatus::DuplicatesChecked, None)
                .await?;
            if !checked {
                return Err(anyhow::anyhow!(
                    "Import job {} left the parsed state during preparation",
                    job.id
                )
                .into());
            }
        }

        tracing::info!(
            "Import job {} checked: {} row(s), {} duplicate(s), {} issue(s)",
            job.id,
            total_rows,
            summary.duplicates_found,
            summary.errors.len()
        );

        Ok(response(true, job.id, summary))
    }

    /// Runs the apply phase and moves the job to its terminal state
    async fn finish_import(&self, job: &ImportJob, cancel: &CancelToken) {
        let result = self.apply(job, cancel).await;

        let (status, reason) = match &result {
            Ok(_) if cancel.is_cancelled() => (
                ImportJobStatus::Failed,
                cancel.reason().map(str::to_string),
            ),
            Ok(tally) if tally.succeeded() == 0 => (
                ImportJobStatus::Failed,
                Some(NOTHING_APPLIED_REASON.to_string()),
            ),
            Ok(_) => (ImportJobStatus::Completed, None),
            Err(e) => (ImportJobStatus::Failed, Some(e.to_string())),
        };

        match &result {
            Ok(tally) => tracing::info!(
                "Import job {} finished as {}: {} imported, {} merged, {} skipped, {} failed, \
                 {} not started",
                job.id,
                status.as_str(),
                tally.imported,
                tally.merged,
                tally.skipped,
                tally.failed,
                tally.not_started
            ),
            Err(e) => tracing::error!("Import job {} failed: {}", job.id, e),
        }

        if let Err(e) = self
            .store
            .transition(job.id, status, reason.as_deref())
            .await
        {
            tracing::error!("Failed to record final status of import job {}: {}", job.id, e);
        }
    }

    async fn apply(&self, job: &ImportJob, cancel: &CancelToken) -> Result<ImportTally> {
        let content = self.store.load_file(job.id).await?;
        let mappings = self
            .store
            .load_mappings(job.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Import job {} has no field mapping", job.id))?;

        let mut parsed = self
            .parse(content)
            .await?
            .map_err(|e| anyhow::anyhow!("Stored file no longer parses: {}", e))?;
        let columns = ColumnMap::from_mappings(&mappings)?;
        let batch = self.normalize(&mut parsed, columns).await?;
        let index = self.build_index(job.organization_id).await?;

        let mut tally = ImportTally::default();

        for rejected in &batch.rejected {
            if cancel.is_cancelled() {
                tally.not_started += 1;
                continue;
            }
            tracing::warn!("Import job {}: {}", job.id, rejected);
            self.store
                .record_outcome(
                    job.id,
                    ImportRowLog {
                        row_index: rejected.row_index,
                        outcome: RowOutcome::Failed,
                        reason: Some(rejected.reason.as_str().to_string()),
                        contact_id: None,
                    },
                )
                .await?;
            tally.record(RowOutcome::Failed);
        }

        let plan = plan_rows(batch.contacts, &index, job.duplicate_strategy);
        drop(index);

        let results: Vec<Result<ImportTally>> = stream::iter(plan.units)
            .map(|unit| self.apply_unit(job, unit, cancel))
            .buffer_unordered(self.settings.max_concurrent_writes.max(1))
            .collect()
            .await;

        for result in results {
            tally.merge(result?);
        }

        Ok(tally)
    }

    /// Applies one unit's rows in order. Row failures are recorded and do not
    /// stop the unit; failing to record an outcome does.
    async fn apply_unit(
        &self,
        job: &ImportJob,
        unit: Vec<PlannedRow>,
        cancel: &CancelToken,
    ) -> Result<ImportTally> {
        let mut tally = ImportTally::default();
        // Rows of this unit that created a contact, by row index
        let mut inserted: HashMap<usize, i64> = HashMap::new();

        for row in unit {
            if cancel.is_cancelled() {
                tally.not_started += 1;
                continue;
            }

            let mut followed = None;
            let write = match row {
                PlannedRow::Record(log) => {
                    let outcome = log.outcome;
                    self.store.record_outcome(job.id, log).await?;
                    tally.record(outcome);
                    continue;
                }
                PlannedRow::Write(write) => write,
                PlannedRow::FollowRow {
                    target_row,
                    contact,
                    replace,
                } => match inserted.get(&target_row) {
                    Some(&contact_id) if replace => RowWrite::Replace { contact_id, contact },
                    Some(&contact_id) => RowWrite::Merge { contact_id, contact },
                    None => {
                        followed = Some(target_row);
                        let reason = format!("row {} of this file was not imported", target_row);
                        RowWrite::Insert {
                            contact,
                            reason: Some(reason),
                        }
                    }
                },
            };

            let log = self.write_one(job, write).await?;
            if let (RowOutcome::Imported, Some(contact_id)) = (log.outcome, log.contact_id) {
                inserted.insert(log.row_index, contact_id);
                if let Some(target_row) = followed {
                    inserted.entry(target_row).or_insert(contact_id);
                }
            }
            tally.record(log.outcome);
        }

        Ok(tally)
    }

    /// Writes one row; a write that fails is recorded as a failed row
    async fn write_one(&self, job: &ImportJob, write: RowWrite) -> Result<ImportRowLog> {
        let row_index = write.row_index();
        let result = self
            .store
            .write_row(
                job.id,
                job.organization_id,
                write,
                self.settings.row_write_timeout,
            )
            .await;

        match result {
            Ok(log) => {
                tracing::debug!(
                    "Import job {} row {}: {}",
                    job.id,
                    row_index,
                    log.outcome.as_str()
                );
                Ok(log)
            }
            Err(err) => {
                tracing::warn!("Import job {} row {} failed: {}", job.id, row_index, err);
                let log = ImportRowLog {
                    row_index,
                    outcome: RowOutcome::Failed,
                    reason: Some(err.to_string()),
                    contact_id: None,
                };
                self.store.record_outcome(job.id, log.clone()).await?;
                Ok(log)
            }
        }
    }
}
