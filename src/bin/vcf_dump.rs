//! Prints the variant columns of a VCF file.
//!
//! Usage:
//!   vcf-dump --input-vcf sample.vcf --max-records 10 --verbose

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use vcfsync::vcf::{self, VcfReader};

#[derive(Parser, Debug)]
#[command(name = "vcf-dump")]
#[command(about = "VCF parser: prints CHROM, POS, ID, REF and ALT of each record")]
#[command(version)]
struct Args {
    /// Path to the VCF file to read
    #[arg(long)]
    input_vcf: PathBuf,

    /// Maximum number of records to read; 0 reads them all
    #[arg(long, default_value_t = 0)]
    max_records: u64,

    /// Print one line per record
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    if !args.input_vcf.is_file() {
        error!(path = %args.input_vcf.display(), "file could not be found or is not valid");
        return ExitCode::FAILURE;
    }

    let reader = match VcfReader::open(&args.input_vcf) {
        Ok(reader) => reader,
        Err(e) => {
            error!(path = %args.input_vcf.display(), %e, "failed to open VCF");
            println!("Final count of lines processed:0");
            return ExitCode::FAILURE;
        }
    };

    let max_records = (args.max_records > 0).then_some(args.max_records);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = vcf::dump_records(reader, &mut out, max_records, args.verbose);
    let _ = out.flush();

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "failed while reading records");
            ExitCode::FAILURE
        }
    }
}
