use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig};
use crate::executor::{Executor, Job, SubmitError};
use crate::validation::{RowInput, VariantFields};
use crate::vcf::VcfReader;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const HEADER: &str = "##fileformat=VCFv4.2\n\
                          ##contig=<ID=chr1>\n\
                          #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n";

pub fn record(n: u64) -> String {
    format!("chr1\t{n}00\trs{n}\tA\tG\t50\tPASS\tDP={n}\tGT:DP\t0/1:{n}\n")
}

/// Writes `<dir>/sample.vcf` with `records` records.
pub fn write_vcf(dir: &Path, records: u64) -> PathBuf {
    let path = dir.join("sample.vcf");
    let mut text = HEADER.to_string();
    for n in 1..=records {
        text.push_str(&record(n));
    }
    fs::write(&path, text).unwrap();
    path
}

/// Record lines of a VCF file, header excluded.
pub fn record_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn file_fields(path: &Path) -> Vec<VariantFields> {
    VcfReader::open(path)
        .unwrap()
        .map(|r| r.unwrap().fields())
        .collect()
}

pub fn input(chrom: &str, pos: i64, id: &str) -> RowInput {
    RowInput {
        chrom: Some(chrom.into()),
        pos: Some(pos),
        id: Some(id.into()),
        reference: Some("T".into()),
        alt: Some("C".into()),
    }
}

pub fn alt_only(alt: &str) -> RowInput {
    RowInput {
        alt: Some(alt.into()),
        ..RowInput::default()
    }
}

pub fn test_config() -> EngineConfig {
    init_tracing();
    EngineConfig::default()
}

// ------------------------------------------------------------------------------------------------
// Executors
// ------------------------------------------------------------------------------------------------

/// Queues jobs until the test runs them.
#[derive(Default)]
pub struct ManualExecutor {
    jobs: Mutex<Vec<Job>>,
}

impl ManualExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Runs queued jobs, including any they submit, until none are left.
    /// Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let jobs: Vec<Job> = std::mem::take(&mut *self.jobs.lock().unwrap());
            if jobs.is_empty() {
                return ran;
            }
            for job in jobs {
                job();
                ran += 1;
            }
        }
    }

    /// Drops queued jobs without running them, as a crash would.
    pub fn discard(&self) -> usize {
        std::mem::take(&mut *self.jobs.lock().unwrap()).len()
    }
}

impl Executor for ManualExecutor {
    fn submit(&self, job: Job) -> Result<(), SubmitError> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

/// Refuses every job.
pub struct FailingExecutor;

impl Executor for FailingExecutor {
    fn submit(&self, _job: Job) -> Result<(), SubmitError> {
        Err(SubmitError::ShutDown)
    }
}

/// Opens an engine on `<dir>/data` driven by a [`ManualExecutor`] and
/// imports a `records`-record file from `<dir>/sample.vcf`.
pub fn setup(dir: &Path, records: u64) -> (Engine, Arc<ManualExecutor>, PathBuf) {
    let executor = ManualExecutor::new();
    let (engine, _) = Engine::open(dir.join("data"), test_config(), executor.clone()).unwrap();
    let vcf = write_vcf(dir, records);
    engine.import(&vcf, "sample").unwrap();
    let vcf = fs::canonicalize(vcf).unwrap();
    (engine, executor, vcf)
}
