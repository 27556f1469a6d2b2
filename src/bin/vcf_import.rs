//! Imports a VCF file into a vcfsync data directory.
//!
//! Usage:
//!   vcf-import --data-dir /var/lib/vcfsync --source sample.vcf --name sample
//!
//! `--source` and `--name` fall back to `VCF_FILE_SOURCE` and
//! `VCF_FILE_NAME`. Without a name, the source path is used.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vcfsync::{StoreConfig, VcfStore};

#[derive(Parser, Debug)]
#[command(name = "vcf-import")]
#[command(about = "Registers a VCF file and loads its records as rows")]
#[command(version)]
struct Args {
    /// Directory holding the catalog
    #[arg(long, env = "VCFSYNC_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// VCF file to import
    #[arg(long, env = "VCF_FILE_SOURCE")]
    source: PathBuf,

    /// Display name of the file
    #[arg(long, env = "VCF_FILE_NAME")]
    name: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting importer...");

    if !args.source.is_file() {
        error!(path = %args.source.display(), "indicated source file is invalid");
        return ExitCode::FAILURE;
    }
    let name = args
        .name
        .unwrap_or_else(|| args.source.display().to_string());

    let store = match VcfStore::open(&args.data_dir, StoreConfig::default()) {
        Ok(store) => store,
        Err(e) => {
            error!(data_dir = %args.data_dir.display(), %e, "failed to open store");
            return ExitCode::FAILURE;
        }
    };

    let status = match store.import(&args.source, &name) {
        Ok(summary) => {
            info!(file_id = summary.file_id, path = %summary.path.display(), "import complete");
            info!("Final count of lines processed:{}", summary.records);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(path = %args.source.display(), %e, "error while importing file");
            info!("Final count of lines processed:0");
            ExitCode::FAILURE
        }
    };

    if let Err(e) = store.close() {
        error!(%e, "failed to close store");
        return ExitCode::FAILURE;
    }
    status
}
