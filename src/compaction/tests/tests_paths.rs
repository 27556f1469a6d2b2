//! Output and target path naming.

#[cfg(test)]
mod tests {
    use crate::compaction::{install, is_temp_for, orphaned_temps, reconciled_path, temp_path};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    #[test]
    fn reconciled_name_uses_stem_before_first_dot() {
        assert_eq!(
            reconciled_path(Path::new("/data/sample.vcf")),
            PathBuf::from("/data/sample.vcf")
        );
        assert_eq!(
            reconciled_path(Path::new("/data/sample.vcf.txt")),
            PathBuf::from("/data/sample.vcf")
        );
        assert_eq!(
            reconciled_path(Path::new("/data/NA12878.chr1.vcf")),
            PathBuf::from("/data/NA12878.vcf")
        );
        assert_eq!(
            reconciled_path(Path::new("/data/sample")),
            PathBuf::from("/data/sample.vcf")
        );
    }

    #[test]
    fn temp_sits_next_to_target() {
        assert_eq!(
            temp_path(Path::new("/data/sample.vcf"), 42),
            PathBuf::from("/data/sample.vcf.42.tmp")
        );
        assert_ne!(
            temp_path(Path::new("/data/sample.vcf"), 1),
            temp_path(Path::new("/data/sample.vcf"), 2)
        );
    }

    #[test]
    fn temp_names_are_recognised() {
        let target = Path::new("/data/sample.vcf");
        assert!(is_temp_for(target, &temp_path(target, 7)));
        assert!(is_temp_for(target, Path::new("/elsewhere/sample.vcf.123.tmp")));
        assert!(!is_temp_for(target, Path::new("/data/sample.vcf")));
        assert!(!is_temp_for(target, Path::new("/data/sample.vcf.tmp")));
        assert!(!is_temp_for(target, Path::new("/data/sample.vcf.x1.tmp")));
        assert!(!is_temp_for(target, Path::new("/data/other.vcf.1.tmp")));
        assert!(!is_temp_for(target, Path::new("/data/sample.vcf.1.tmp.bak")));
    }

    #[test]
    fn orphans_are_listed_in_order() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("a.vcf");
        fs::write(&target, "data").unwrap();
        fs::write(temp_path(&target, 9), "").unwrap();
        fs::write(temp_path(&target, 3), "").unwrap();
        fs::write(tmp.path().join("b.vcf.1.tmp"), "").unwrap();

        assert_eq!(
            orphaned_temps(&target).unwrap(),
            vec![temp_path(&target, 3), temp_path(&target, 9)]
        );
        assert!(orphaned_temps(&tmp.path().join("gone/a.vcf")).unwrap().is_empty());
    }

    #[test]
    fn install_replaces_target() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("a.vcf");
        let output = temp_path(&target, 1);
        fs::write(&target, "old").unwrap();
        fs::write(&output, "new").unwrap();

        install(&output, &target).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
        assert!(!output.exists());
    }
}
