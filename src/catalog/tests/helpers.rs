use std::fs;
use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use crate::catalog::{Catalog, CatalogState, FileRecord};
use crate::rowstore::RowStore;
use crate::validation::VariantFields;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fields(n: u64) -> VariantFields {
    VariantFields {
        chrom: format!("chr{}", n % 22 + 1),
        pos: n,
        id: Some(format!("rs{n}")),
        reference: "A".into(),
        alt: Some("G".into()),
    }
}

/// Registers `rows` clean rows for a file at `<dir>/sample.vcf` and
/// checkpoints, the way an import does.
pub fn seeded(data_dir: &Path, rows: u64) -> (Catalog, CatalogState, PathBuf) {
    let (mut catalog, _, _) = Catalog::open(data_dir).unwrap();
    let vcf = data_dir.join("sample.vcf");
    fs::write(&vcf, "original").unwrap();
    let state = CatalogState {
        file: Some(FileRecord {
            id: 1,
            name: "sample".into(),
            path: vcf.clone(),
            created: 10,
            modified: 10,
        }),
        rows: RowStore::from_import((1..=rows).map(fields)),
        next_file_id: 2,
    };
    catalog.checkpoint(&state).unwrap();
    (catalog, state, vcf)
}
