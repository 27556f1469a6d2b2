//! # Reconciliation Engine
//!
//! Owns the catalog state behind a single mutex and drives reconciliation
//! runs on an [`Executor`].
//!
//! ## Mutations
//!
//! Create, update and delete each run in one critical section:
//!
//! 1. validate the input (outside the lock),
//! 2. journal the change through the [`Catalog`],
//! 3. apply it to the row store,
//! 4. request a reconciliation from the [`SyncState`].
//!
//! Step 4 either submits a run (`Idle → Running`) or records that the run
//! in flight must loop. The caller never waits on the run.
//!
//! ## Runs
//!
//! A run is a loop of passes. Each pass:
//!
//! 1. under the lock, marks the snapshot point
//!    (`RunningWithPendingChanges → Running`) and captures the dirty rows
//!    and tombstones;
//! 2. without the lock, merges them into a temporary file
//!    ([`compaction::compact`]);
//! 3. under the lock, journals the commit, renames the temporary file over
//!    the target, applies the commit (clean unchanged rows, renumber past
//!    the dropped tombstones) and checkpoints the catalog;
//! 4. returns to `Idle`, or loops when a change arrived meanwhile.
//!
//! Loops are bounded by [`EngineConfig::max_passes_per_run`]. A failed pass
//! removes its temporary file, releases the state and leaves every change
//! pending for the next request.
//!
//! ## Executors
//!
//! Jobs are submitted while the engine lock is held, so an executor must
//! never run a job on the submitting thread.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::catalog::{
    self, Catalog, CatalogError, CatalogOp, CatalogState, FileRecord, RecoveryReport,
};
use crate::compaction::{self, CompactionError, CompactionPlan, CompactionSummary};
use crate::coordinator::{PassOutcome, ReconcileRequest, SyncState};
use crate::executor::Executor;
use crate::rowstore::{LineId, Row, RowId, RowStore};
use crate::validation::{self, Mode, RowInput, ValidationErrors};
use crate::vcf::{VcfError, VcfReader};

// ------------------------------------------------------------------------------------------------
// Errors and configuration
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("VCF error: {0}")]
    Vcf(#[from] VcfError),

    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("row {0} not found")]
    RowNotFound(RowId),

    #[error("no VCF file has been imported")]
    NoFile,

    #[error("a reconciliation run is in progress")]
    ReconcileInProgress,

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on passes in one run before it releases with work
    /// still pending.
    pub max_passes_per_run: u32,

    /// Pause at the start of a run so bursts of edits share one pass.
    pub reconcile_delay: Duration,

    /// Request a run at open when the catalog holds pending work.
    pub reconcile_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_passes_per_run: 16,
            reconcile_delay: Duration::ZERO,
            reconcile_on_open: true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Reporting types
// ------------------------------------------------------------------------------------------------

/// Counters since open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub runs_started: u64,
    /// Requests absorbed by a run already in flight.
    pub requests_coalesced: u64,
    pub submit_failures: u64,
    pub passes_committed: u64,
    pub passes_failed: u64,
    /// Runs that hit `max_passes_per_run`.
    pub runs_truncated: u64,
    pub last_pass: Option<CompactionSummary>,
}

/// The file record together with its coordination state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub file: FileRecord,
    /// Some row is dirty or some tombstone is pending.
    pub needs_update: bool,
    /// A reconciliation run is active.
    pub is_updating: bool,
    pub rows: usize,
    pub dirty_rows: usize,
    pub tombstones: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub file_id: u64,
    pub records: u64,
    pub path: PathBuf,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineInner {
    catalog: Catalog,
    state: CatalogState,
    sync: SyncState,
    stats: EngineStats,
}

struct Shared {
    inner: Mutex<EngineInner>,
    /// Signalled whenever the state returns to `Idle`.
    idle: Condvar,
    executor: Arc<dyn Executor>,
    config: EngineConfig,
}

/// Thread-safe engine handle; clones share state.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens the catalog under `data_dir`, recovering any interrupted pass.
    ///
    /// The state always starts `Idle`. With pending work and
    /// `reconcile_on_open`, a run is requested immediately.
    pub fn open(
        data_dir: impl AsRef<Path>,
        config: EngineConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<(Self, RecoveryReport), EngineError> {
        let (catalog, state, report) = Catalog::open(data_dir.as_ref())?;

        let engine = Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(EngineInner {
                    catalog,
                    state,
                    sync: SyncState::Idle,
                    stats: EngineStats::default(),
                }),
                idle: Condvar::new(),
                executor,
                config,
            }),
        };

        {
            let mut inner = engine.lock()?;
            let pending = inner.state.file.is_some() && inner.state.rows.has_pending();
            info!(
                data_dir = %data_dir.as_ref().display(),
                rows = inner.state.rows.len(),
                pending,
                "engine opened"
            );
            if pending && engine.shared.config.reconcile_on_open {
                engine.request_reconcile(&mut inner);
            }
        }

        Ok((engine, report))
    }

    /// Checkpoints the catalog if no run is active.
    pub fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        if inner.sync.is_updating() {
            warn!("engine closed while a reconciliation run is active");
            return Ok(());
        }
        let EngineInner { catalog, state, .. } = &mut *inner;
        catalog.checkpoint(state)?;
        info!("engine closed");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineInner>, EngineError> {
        lock_inner(&self.shared)
    }

    // --------------------------------------------------------------------------------------------
    // Import
    // --------------------------------------------------------------------------------------------

    /// Replaces the file record, rows and tombstones with the contents of
    /// the VCF at `path`. Rows are clean and numbered in file order.
    ///
    /// The file is parsed completely before anything changes. Refused with
    /// [`EngineError::ReconcileInProgress`] while a run is active.
    pub fn import(&self, path: impl AsRef<Path>, name: &str) -> Result<ImportSummary, EngineError> {
        let path = fs::canonicalize(path.as_ref())?;
        let reader = VcfReader::open(&path)?;
        let mut records = Vec::new();
        for record in reader {
            records.push(record?.fields());
        }
        let count = records.len() as u64;

        let mut inner = self.lock()?;
        if inner.sync.is_updating() {
            return Err(EngineError::ReconcileInProgress);
        }

        let now = catalog::now_nanos();
        let file_id = inner.state.next_file_id;
        let state = CatalogState {
            file: Some(FileRecord {
                id: file_id,
                name: name.to_string(),
                path: path.clone(),
                created: now,
                modified: now,
            }),
            rows: RowStore::from_import(records),
            next_file_id: file_id + 1,
        };
        inner.catalog.checkpoint(&state)?;
        inner.state = state;

        info!(path = %path.display(), file_id, records = count, "import complete");
        Ok(ImportSummary {
            file_id,
            records: count,
            path,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Validates and appends a new row after every existing position.
    pub fn create_row(&self, input: &RowInput) -> Result<(Row, ReconcileRequest), EngineError> {
        let fields = validation::validate(input, Mode::Create)?
            .into_fields()
            .ok_or_else(|| EngineError::Internal("validated create input is incomplete".into()))?;

        let mut inner = self.lock()?;
        if inner.state.file.is_none() {
            return Err(EngineError::NoFile);
        }

        let (row_id, line_id) = inner.state.rows.next_insert();
        apply(
            &mut inner,
            CatalogOp::Insert {
                row_id,
                line_id,
                fields,
            },
        )?;
        let row = fetch(&inner, row_id)?;
        debug!(row_id, line_id, "row created");
        let request = self.request_reconcile(&mut inner);
        Ok((row, request))
    }

    /// Full (`Mode::Replace`) or partial (`Mode::Partial`) update of one row.
    pub fn update_row(
        &self,
        row_id: RowId,
        input: &RowInput,
        mode: Mode,
    ) -> Result<(Row, ReconcileRequest), EngineError> {
        let (mut rows, request) = self.update_rows(&[row_id], input, mode)?;
        let row = rows
            .pop()
            .ok_or_else(|| EngineError::Internal("update returned no row".into()))?;
        Ok((row, request))
    }

    /// Validates `input` once and applies it to every row in `row_ids`
    /// within one critical section. Repeated ids are updated once. Fails
    /// without changes if any row is unknown.
    pub fn update_rows(
        &self,
        row_ids: &[RowId],
        input: &RowInput,
        mode: Mode,
    ) -> Result<(Vec<Row>, ReconcileRequest), EngineError> {
        let mode = if mode == Mode::Create { Mode::Replace } else { mode };
        let validated = validation::validate(input, mode)?;
        let row_ids = unique(row_ids);

        let mut inner = self.lock()?;
        let mut ops = Vec::with_capacity(row_ids.len());
        for &row_id in &row_ids {
            let mut fields = inner
                .state
                .rows
                .get(row_id)
                .ok_or(EngineError::RowNotFound(row_id))?
                .fields
                .clone();
            validated.apply_to(&mut fields);
            ops.push(CatalogOp::Update { row_id, fields });
        }

        let request = self.apply_and_request(&mut inner, ops)?;
        let rows = row_ids
            .iter()
            .map(|&row_id| fetch(&inner, row_id))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = rows.len(), ?mode, "rows updated");
        Ok((rows, request))
    }

    pub fn delete_row(&self, row_id: RowId) -> Result<ReconcileRequest, EngineError> {
        self.delete_rows(&[row_id])
    }

    /// Deletes every row in `row_ids`, leaving tombstones at their
    /// positions. Repeated ids are deleted once. Fails without changes if
    /// any row is unknown.
    pub fn delete_rows(&self, row_ids: &[RowId]) -> Result<ReconcileRequest, EngineError> {
        let row_ids = unique(row_ids);
        let mut inner = self.lock()?;
        if let Some(&missing) = row_ids
            .iter()
            .find(|id| inner.state.rows.get(**id).is_none())
        {
            return Err(EngineError::RowNotFound(missing));
        }
        let ops = row_ids
            .iter()
            .map(|&row_id| CatalogOp::Delete { row_id })
            .collect();
        let request = self.apply_and_request(&mut inner, ops)?;
        debug!(count = row_ids.len(), "rows deleted");
        Ok(request)
    }

    /// Requests a run without changing any row. Useful after a failed or
    /// truncated run.
    pub fn reconcile(&self) -> Result<ReconcileRequest, EngineError> {
        let mut inner = self.lock()?;
        if inner.state.file.is_none() {
            return Err(EngineError::NoFile);
        }
        Ok(self.request_reconcile(&mut inner))
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    pub fn get_row(&self, row_id: RowId) -> Result<Option<Row>, EngineError> {
        Ok(self.lock()?.state.rows.get(row_id).cloned())
    }

    /// All rows in file order.
    pub fn rows(&self) -> Result<Vec<Row>, EngineError> {
        Ok(self.lock()?.state.rows.rows_in_order().cloned().collect())
    }

    pub fn rows_with_variant_id(&self, variant_id: &str) -> Result<Vec<Row>, EngineError> {
        Ok(self
            .lock()?
            .state
            .rows
            .rows_with_variant_id(variant_id)
            .cloned()
            .collect())
    }

    pub fn file_status(&self) -> Result<Option<FileStatus>, EngineError> {
        let inner = self.lock()?;
        Ok(inner.state.file.as_ref().map(|file| FileStatus {
            file: file.clone(),
            needs_update: inner.state.rows.has_pending(),
            is_updating: inner.sync.is_updating(),
            rows: inner.state.rows.len(),
            dirty_rows: inner.state.rows.dirty_count(),
            tombstones: inner.state.rows.tombstone_count(),
        }))
    }

    pub fn sync_state(&self) -> Result<SyncState, EngineError> {
        Ok(self.lock()?.sync)
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(self.lock()?.stats.clone())
    }

    /// Blocks until no run is active or `timeout` elapses. Returns `true`
    /// when idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result<bool, EngineError> {
        let guard = self.lock()?;
        let (guard, _) = self
            .shared
            .idle
            .wait_timeout_while(guard, timeout, |inner| inner.sync.is_updating())
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))?;
        Ok(!guard.sync.is_updating())
    }

    // --------------------------------------------------------------------------------------------
    // Coordination
    // --------------------------------------------------------------------------------------------

    /// Journals and applies `ops` in order, then requests a run. A run is
    /// requested whenever at least one op was applied, even if a later one
    /// failed.
    fn apply_and_request(
        &self,
        inner: &mut EngineInner,
        ops: Vec<CatalogOp>,
    ) -> Result<ReconcileRequest, EngineError> {
        let mut applied = 0usize;
        let mut result = Ok(());
        for op in ops {
            if let Err(e) = apply(inner, op) {
                result = Err(e);
                break;
            }
            applied += 1;
        }
        if let Err(e) = result {
            if applied > 0 {
                warn!(applied, %e, "batch failed part-way; reconciling the applied part");
                self.request_reconcile(inner);
            }
            return Err(e);
        }
        Ok(self.request_reconcile(inner))
    }

    /// Runs inside the caller's critical section.
    fn request_reconcile(&self, inner: &mut EngineInner) -> ReconcileRequest {
        match inner.sync.request() {
            ReconcileRequest::Started => {
                let shared = Arc::clone(&self.shared);
                match self
                    .shared
                    .executor
                    .submit(Box::new(move || run_reconcile(&shared)))
                {
                    Ok(()) => {
                        inner.stats.runs_started += 1;
                        debug!("reconcile run submitted");
                        ReconcileRequest::Started
                    }
                    Err(e) => {
                        inner.sync.release();
                        inner.stats.submit_failures += 1;
                        self.shared.idle.notify_all();
                        error!(%e, "failed to submit reconcile run; changes stay pending");
                        ReconcileRequest::Rejected
                    }
                }
            }
            other => {
                inner.stats.requests_coalesced += 1;
                trace!("reconcile request coalesced into the active run");
                other
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn lock_inner(shared: &Shared) -> Result<MutexGuard<'_, EngineInner>, EngineError> {
    shared.inner.lock().map_err(|_| {
        error!("Mutex poisoned");
        EngineError::Internal("Mutex poisoned".into())
    })
}

/// Journals `op` and applies it to the state.
fn apply(inner: &mut EngineInner, op: CatalogOp) -> Result<(), EngineError> {
    let EngineInner { catalog, state, .. } = inner;
    catalog.commit(state, op)?;
    Ok(())
}

/// `row_ids` without repeats, first occurrence kept.
fn unique(row_ids: &[RowId]) -> Vec<RowId> {
    let mut seen = BTreeSet::new();
    row_ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn fetch(inner: &EngineInner, row_id: RowId) -> Result<Row, EngineError> {
    inner
        .state
        .rows
        .get(row_id)
        .cloned()
        .ok_or(EngineError::RowNotFound(row_id))
}

// ------------------------------------------------------------------------------------------------
// Run loop
// ------------------------------------------------------------------------------------------------

/// One pass, as captured at its snapshot point.
#[derive(Debug)]
struct PassPlan {
    compaction: CompactionPlan,
    target: PathBuf,
    written: Vec<(RowId, u64)>,
    tombstones: Vec<LineId>,
}

/// Entry point of a submitted run.
fn run_reconcile(shared: &Arc<Shared>) {
    let started = Instant::now();
    if !shared.config.reconcile_delay.is_zero() {
        thread::sleep(shared.config.reconcile_delay);
    }

    run_loop(shared, run_pass);

    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "reconcile run finished");
}

/// Calls `pass` until a pass ends clean, a pass fails, or
/// `max_passes_per_run` passes asked for another.
fn run_loop<F>(shared: &Shared, mut pass: F)
where
    F: FnMut(&Shared) -> Result<Option<PassOutcome>, EngineError>,
{
    let mut passes = 0u32;
    loop {
        match pass(shared) {
            Ok(None) | Ok(Some(PassOutcome::Done)) => break,
            Ok(Some(PassOutcome::Again)) => {
                passes += 1;
                if passes >= shared.config.max_passes_per_run {
                    warn!(
                        passes,
                        "reconcile run hit its pass limit; remaining changes stay pending"
                    );
                    release(shared, |stats| stats.runs_truncated += 1);
                    break;
                }
            }
            Err(e) => {
                error!(%e, "reconcile pass failed; changes stay pending");
                release(shared, |stats| stats.passes_failed += 1);
                break;
            }
        }
    }
}

/// Snapshot, merge and commit. `Ok(None)` when there was nothing to do.
fn run_pass(shared: &Shared) -> Result<Option<PassOutcome>, EngineError> {
    let Some(plan) = begin_pass(shared)? else {
        return Ok(None);
    };
    let summary = compaction::compact(&plan.compaction)?;
    commit_pass(shared, plan, summary).map(Some)
}

fn begin_pass(shared: &Shared) -> Result<Option<PassPlan>, EngineError> {
    let mut inner = lock_inner(shared)?;
    inner.sync.begin_pass();

    let Some(source) = inner.state.file.as_ref().map(|f| f.path.clone()) else {
        inner.sync.release();
        shared.idle.notify_all();
        return Ok(None);
    };
    if !inner.state.rows.has_pending() {
        debug!("reconcile: nothing pending");
        inner.sync.release();
        shared.idle.notify_all();
        return Ok(None);
    }

    let target = compaction::reconciled_path(&source);
    let (dirty, tombstones) = inner.state.rows.pending_snapshot();

    let written = dirty.iter().map(|d| (d.row_id, d.version)).collect();
    let edits: BTreeMap<_, _> = dirty.into_iter().map(|d| (d.line_id, d.fields)).collect();

    debug!(
        source = %source.display(),
        edits = edits.len(),
        tombstones = tombstones.len(),
        "reconcile: pass snapshot taken"
    );

    Ok(Some(PassPlan {
        compaction: CompactionPlan {
            source,
            output: compaction::temp_path(&target, inner.catalog.next_seq()),
            edits,
            tombstones: tombstones.iter().copied().collect(),
        },
        target,
        written,
        tombstones,
    }))
}

fn commit_pass(
    shared: &Shared,
    plan: PassPlan,
    summary: CompactionSummary,
) -> Result<PassOutcome, EngineError> {
    let mut guard = lock_inner(shared)?;
    let inner = &mut *guard;
    let temp = plan.compaction.output;

    let op = CatalogOp::ReconcileCommit {
        temp: temp.clone(),
        target: plan.target.clone(),
        cleaned: plan.written,
        tombstones: plan.tombstones,
        modified: catalog::now_nanos(),
    };
    if let Err(e) = inner.catalog.log(op.clone()) {
        compaction::discard(&temp);
        return Err(e.into());
    }

    if let Err(e) = compaction::install(&temp, &plan.target) {
        if let Err(abort) = inner
            .catalog
            .log(CatalogOp::ReconcileAbort { temp: temp.clone() })
        {
            error!(%abort, "failed to journal reconcile abort");
        }
        compaction::discard(&temp);
        return Err(e.into());
    }

    if plan.compaction.source != plan.target {
        if let Err(e) = catalog::remove_if_exists(&plan.compaction.source) {
            warn!(path = %plan.compaction.source.display(), %e, "failed to remove superseded source");
        }
    }

    inner.state.apply(&op)?;
    if let Err(e) = inner.catalog.checkpoint(&inner.state) {
        warn!(%e, "checkpoint after reconcile pass failed; journal keeps the commit");
    }

    inner.stats.passes_committed += 1;
    inner.stats.last_pass = Some(summary);

    let outcome = inner.sync.finish_pass();
    info!(
        target = %plan.target.display(),
        written = summary.written,
        dropped = summary.dropped,
        appended = summary.appended,
        again = outcome == PassOutcome::Again,
        "reconcile pass committed"
    );
    if outcome == PassOutcome::Done {
        shared.idle.notify_all();
    }
    Ok(outcome)
}

/// Returns to `Idle` after a failed or truncated run.
fn release(shared: &Shared, record: impl FnOnce(&mut EngineStats)) {
    let mut inner = match shared.inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    inner.sync.release();
    record(&mut inner.stats);
    shared.idle.notify_all();
}
