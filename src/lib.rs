//! # vcfsync
//!
//! A row-level CRUD store over a single VCF file. Variant rows are edited
//! in memory and journaled durably; a background reconciler folds the edits
//! back into the file with a **streaming positional merge** and an atomic
//! rename.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vcfsync::{Mode, RowInput, StoreConfig, VcfStore};
//!
//! let store = VcfStore::open("/tmp/vcfsync", StoreConfig::default()).unwrap();
//! store.import("/data/sample.vcf", "sample").unwrap();
//!
//! // Edit a row; reconciliation runs in the background.
//! let patch = RowInput { alt: Some("T".into()), ..RowInput::default() };
//! store.update_row(1, &patch, Mode::Partial).unwrap();
//!
//! // Delete a row; the record disappears from the file on the next pass.
//! store.delete_row(2).unwrap();
//!
//! store.wait_for_idle(std::time::Duration::from_secs(5)).unwrap();
//! store.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Journaled mutations**: every edit is fsynced before it is applied.
//! - **Coalescing reconciler**: at most one run per file; edits that land
//!   during a run are picked up by a follow-up pass, never by a second run.
//! - **Byte-preserving rewrites**: headers, untouched records and line
//!   endings are copied verbatim.
//! - **Crash recovery**: interrupted passes are redone or discarded on open.

pub mod api;
pub(crate) mod catalog;
pub(crate) mod compaction;
pub mod coordinator;
pub(crate) mod encoding;
pub mod engine;
pub mod executor;
pub(crate) mod rowstore;
pub mod validation;
pub mod vcf;
pub(crate) mod wal;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

pub use catalog::{FileRecord, RecoveryReport};
pub use compaction::CompactionSummary;
pub use coordinator::{ReconcileRequest, SyncState};
pub use engine::{EngineError, EngineStats, FileStatus, ImportSummary};
pub use rowstore::{LineId, Row, RowId};
pub use validation::{Mode, RowInput, ValidationErrors, VariantFields};

use engine::{Engine, EngineConfig};
use executor::WorkerPool;

/// Longest accepted [`StoreConfig::reconcile_delay`].
pub const MAX_RECONCILE_DELAY: Duration = Duration::from_secs(60);

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`VcfStore`] instance.
///
/// All fields have defaults via [`StoreConfig::default()`]. The
/// configuration is validated when passed to [`VcfStore::open`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use vcfsync::StoreConfig;
///
/// let config = StoreConfig {
///     reconcile_delay: Duration::from_secs(1),
///     ..StoreConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of background threads executing reconciliation runs.
    ///
    /// Default: 1. Must be ≥ 1.
    pub worker_threads: usize,

    /// Maximum passes in one run. A run that reaches it releases with the
    /// remaining edits still pending; the next edit starts a fresh run.
    ///
    /// Default: 16. Must be ≥ 1.
    pub max_passes_per_run: u32,

    /// Pause before the first pass of a run, so that a burst of edits is
    /// folded in by one pass.
    ///
    /// Default: 0. Must be ≤ 60 s.
    pub reconcile_delay: Duration,

    /// Whether [`VcfStore::open`] starts a run when the recovered catalog
    /// has pending edits.
    ///
    /// Default: true.
    pub reconcile_on_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            max_passes_per_run: 16,
            reconcile_delay: Duration::ZERO,
            reconcile_on_open: true,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.worker_threads < 1 {
            return Err(StoreError::InvalidConfig(
                "worker_threads must be >= 1".into(),
            ));
        }
        if self.max_passes_per_run < 1 {
            return Err(StoreError::InvalidConfig(
                "max_passes_per_run must be >= 1".into(),
            ));
        }
        if self.reconcile_delay > MAX_RECONCILE_DELAY {
            return Err(StoreError::InvalidConfig(
                "reconcile_delay must be <= 60s".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_passes_per_run: self.max_passes_per_run,
            reconcile_delay: self.reconcile_delay,
            reconcile_on_open: self.reconcile_on_open,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`VcfStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main store handle.
///
/// # Thread safety
///
/// `VcfStore` is `Send + Sync` and can be shared across threads via
/// `Arc<VcfStore>`.
///
/// # Reconciliation
///
/// Every mutation requests a reconciliation run in the same critical
/// section as the change. Runs execute on the store's worker threads; the
/// caller never waits for them. Completion is observable through
/// [`VcfStore::file_status`] or [`VcfStore::wait_for_idle`].
///
/// # Shutdown
///
/// [`VcfStore::close`] lets queued runs finish, stops the workers and
/// checkpoints the catalog. Dropping the handle does the same, ignoring
/// errors.
pub struct VcfStore {
    engine: Engine,
    pool: Arc<WorkerPool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for VcfStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcfStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl VcfStore {
    /// Opens (or creates) a store whose catalog lives under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if any configuration parameter
    /// is out of range, or an engine error if the catalog cannot be
    /// recovered.
    pub fn open(data_dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_report(data_dir, config).map(|(store, _)| store)
    }

    /// Like [`VcfStore::open`], also returning what recovery did.
    pub fn open_with_report(
        data_dir: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<(Self, RecoveryReport), StoreError> {
        config.validate()?;

        let pool = Arc::new(WorkerPool::new(config.worker_threads));
        let (engine, report) =
            Engine::open(data_dir.as_ref(), config.to_engine_config(), pool.clone())?;

        info!(
            data_dir = %data_dir.as_ref().display(),
            worker_threads = config.worker_threads,
            "store opened"
        );

        Ok((
            Self {
                engine,
                pool,
                closed: AtomicBool::new(false),
            },
            report,
        ))
    }

    /// Gracefully shuts down the store.
    ///
    /// Queued and running passes complete first. Subsequent operations
    /// return [`StoreError::Closed`]. Calling `close` more than once is
    /// harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.pool.shutdown();
        self.engine.close()?;

        info!("store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Import
    // --------------------------------------------------------------------------------------------

    /// Registers the VCF at `path` as the managed file, replacing any
    /// previous registration, rows and tombstones.
    pub fn import(&self, path: impl AsRef<Path>, name: &str) -> Result<ImportSummary, StoreError> {
        self.check_open()?;
        Ok(self.engine.import(path, name)?)
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Validates `input` and appends it as a new row.
    pub fn create_row(&self, input: &RowInput) -> Result<Row, StoreError> {
        self.check_open()?;
        let (row, _) = self.engine.create_row(input)?;
        Ok(row)
    }

    /// Updates one row. `Mode::Partial` leaves absent fields untouched.
    pub fn update_row(&self, row_id: RowId, input: &RowInput, mode: Mode) -> Result<Row, StoreError> {
        self.check_open()?;
        let (row, _) = self.engine.update_row(row_id, input, mode)?;
        Ok(row)
    }

    /// Applies the same update to every row in `row_ids`, all or nothing.
    pub fn update_rows(
        &self,
        row_ids: &[RowId],
        input: &RowInput,
        mode: Mode,
    ) -> Result<Vec<Row>, StoreError> {
        self.check_open()?;
        let (rows, _) = self.engine.update_rows(row_ids, input, mode)?;
        Ok(rows)
    }

    pub fn delete_row(&self, row_id: RowId) -> Result<(), StoreError> {
        self.check_open()?;
        self.engine.delete_row(row_id)?;
        Ok(())
    }

    /// Deletes every row in `row_ids`, all or nothing.
    pub fn delete_rows(&self, row_ids: &[RowId]) -> Result<(), StoreError> {
        self.check_open()?;
        self.engine.delete_rows(row_ids)?;
        Ok(())
    }

    /// Requests a run without changing any row.
    pub fn reconcile(&self) -> Result<ReconcileRequest, StoreError> {
        self.check_open()?;
        Ok(self.engine.reconcile()?)
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    pub fn get_row(&self, row_id: RowId) -> Result<Option<Row>, StoreError> {
        self.check_open()?;
        Ok(self.engine.get_row(row_id)?)
    }

    /// All rows in file order.
    pub fn rows(&self) -> Result<Vec<Row>, StoreError> {
        self.check_open()?;
        Ok(self.engine.rows()?)
    }

    /// Rows whose ID column equals `variant_id`, in file order.
    pub fn rows_with_variant_id(&self, variant_id: &str) -> Result<Vec<Row>, StoreError> {
        self.check_open()?;
        Ok(self.engine.rows_with_variant_id(variant_id)?)
    }

    /// The managed file and its `needs_update` / `is_updating` flags, or
    /// `None` before the first import.
    pub fn file_status(&self) -> Result<Option<FileStatus>, StoreError> {
        self.check_open()?;
        Ok(self.engine.file_status()?)
    }

    pub fn stats(&self) -> Result<EngineStats, StoreError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    /// Blocks until no run is active or `timeout` elapses. Returns `true`
    /// when idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(self.engine.wait_for_idle(timeout)?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StoreError::Closed)` if the store has been closed.
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Drop for VcfStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.pool.shutdown();
            if let Err(e) = self.engine.close() {
                warn!(%e, "close on drop failed");
            }
        }
    }
}
