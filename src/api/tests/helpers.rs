use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::api::{ApiConfig, RowService};
use crate::{StoreConfig, VcfStore};

pub const SECRET: &str = "s3cret";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Five records: two on chr1 sharing nothing, one without an ID, two
/// sharing `rs3` and one without an ALT.
pub const SAMPLE: &str = "##fileformat=VCFv4.2\n\
    #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
    chr1\t100\trs1\tA\tG\t50\tPASS\t.\tGT\t0/1\n\
    chr1\t200\t.\tC\tT\t50\tPASS\t.\tGT\t0/1\n\
    chr2\t300\trs3\tG\tA\t50\tPASS\t.\tGT\t1/1\n\
    chrX\t400\trs3\tT\t.\t50\tPASS\t.\tGT\t0/0\n\
    chr1\t500\trs5\tA\tC\t50\tPASS\t.\tGT\t0/1\n";

pub fn write_sample(dir: &Path) -> PathBuf {
    let path = dir.join("sample.vcf");
    fs::write(&path, SAMPLE).unwrap();
    path
}

pub fn config() -> ApiConfig {
    ApiConfig {
        secret: SECRET.into(),
        ..ApiConfig::default()
    }
}

/// A service over a store holding [`SAMPLE`].
pub fn service(dir: &Path) -> (RowService, Arc<VcfStore>, PathBuf) {
    init_tracing();
    let store = Arc::new(VcfStore::open(dir.join("data"), StoreConfig::default()).unwrap());
    let vcf = write_sample(dir);
    store.import(&vcf, "sample").unwrap();
    (RowService::new(store.clone(), config()), store, vcf)
}
