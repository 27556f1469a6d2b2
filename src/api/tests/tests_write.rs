//! Create, update and destroy: authorization, validation and effects on
//! the store and the file.

#[cfg(test)]
mod tests {
    use crate::api::tests::helpers::*;
    use crate::api::{ApiConfig, ApiError, RowService};
    use crate::validation::CHROM_MSG;
    use crate::{StoreConfig, VcfStore};
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const NEW_ROW: &str = r#"{"chrom": "chr4", "pos": 4000, "id": "rs4000", "ref": "C", "alt": "G"}"#;

    /// # Scenario
    /// Mutations with a missing, wrong or empty-configured secret.
    ///
    /// # Expected behavior
    /// 403 every time and nothing changes.
    #[test]
    fn mutations_require_the_secret() {
        let tmp = TempDir::new().unwrap();
        let (api, store, _) = service(tmp.path());

        for auth in [None, Some("wrong"), Some("")] {
            let err = api.create(auth, NEW_ROW).unwrap_err();
            assert!(matches!(err, ApiError::Forbidden));
            assert_eq!(err.status(), 403);
            assert!(err.body().is_none());
            assert!(matches!(
                api.destroy(auth, "rs1").unwrap_err(),
                ApiError::Forbidden
            ));
            assert!(matches!(
                api.partial_update(auth, "rs1", "{}").unwrap_err(),
                ApiError::Forbidden
            ));
        }

        let open = RowService::new(store.clone(), ApiConfig::default());
        assert!(matches!(
            open.create(Some(""), NEW_ROW).unwrap_err(),
            ApiError::Forbidden
        ));
        assert_eq!(store.rows().unwrap().len(), 5);
    }

    /// # Scenario
    /// Create a valid row.
    ///
    /// # Expected behavior
    /// The stored fields are returned, the row is appended after the
    /// imported ones and, once reconciled, is the file's last record.
    #[test]
    fn create_appends_row() {
        let tmp = TempDir::new().unwrap();
        let (api, store, vcf) = service(tmp.path());

        let created = api.create(Some(SECRET), NEW_ROW).unwrap();
        assert_eq!(created.chrom, "chr4");
        assert_eq!(created.id.as_deref(), Some("rs4000"));

        let rows = store.rows().unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[5].line_id, 6);

        assert!(store.wait_for_idle(Duration::from_secs(10)).unwrap());
        let text = fs::read_to_string(&vcf).unwrap();
        assert!(text.ends_with("chr4\t4000\trs4000\tC\tG\t.\t.\t.\tGT\t0/1\n"));
    }

    /// # Scenario
    /// Create with an invalid chromosome and an invalid ALT, and with a
    /// body that is not JSON.
    ///
    /// # Expected behavior
    /// 400 with per-field messages, or a `message` entry for bad JSON.
    #[test]
    fn create_reports_validation_errors() {
        let tmp = TempDir::new().unwrap();
        let (api, store, _) = service(tmp.path());

        let err = api
            .create(
                Some(SECRET),
                r#"{"chrom": "chr23", "pos": 1, "ref": "A", "alt": "N"}"#,
            )
            .unwrap_err();
        assert_eq!(err.status(), 400);
        let body = err.body().unwrap();
        assert_eq!(body["chrom"][0], CHROM_MSG);
        assert!(body["alt"].is_array());
        assert!(body.get("pos").is_none());

        let err = api.create(Some(SECRET), "not json").unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(err.body().unwrap()["message"].is_array());

        assert_eq!(store.rows().unwrap().len(), 5);
    }

    /// # Scenario
    /// Create before any file was imported.
    ///
    /// # Expected behavior
    /// 400 explaining that no file is registered.
    #[test]
    fn create_without_file() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VcfStore::open(tmp.path(), StoreConfig::default()).unwrap());
        let api = RowService::new(store, config());

        let err = api.create(Some(SECRET), NEW_ROW).unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(
            err.body().unwrap()["message"][0],
            "No Vcf File was initialised in the db!"
        );
    }

    /// # Scenario
    /// PUT and PATCH against `rs3`, which two rows share.
    ///
    /// # Expected behavior
    /// Both rows change. PUT requires every mandatory field; PATCH keeps
    /// the fields it does not mention.
    #[test]
    fn update_applies_to_every_matching_row() {
        let tmp = TempDir::new().unwrap();
        let (api, store, _) = service(tmp.path());

        let patched = api
            .partial_update(Some(SECRET), "rs3", r#"{"alt": "C"}"#)
            .unwrap();
        assert_eq!(patched, 2);
        let rows = store.rows_with_variant_id("rs3").unwrap();
        assert!(rows.iter().all(|r| r.fields.alt.as_deref() == Some("C")));
        assert_eq!(rows[0].fields.chrom, "chr2");
        assert_eq!(rows[1].fields.chrom, "chrX");

        let err = api
            .update(Some(SECRET), "rs3", r#"{"alt": "T"}"#)
            .unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.body().unwrap()["chrom"][0], "This field is required.");

        let replaced = api
            .update(
                Some(SECRET),
                "rs3",
                r#"{"chrom": "chrM", "pos": 9, "id": "rs3", "ref": "A"}"#,
            )
            .unwrap();
        assert_eq!(replaced, 2);
        let rows = store.rows_with_variant_id("rs3").unwrap();
        assert!(rows.iter().all(|r| r.fields.chrom == "chrM" && r.fields.pos == 9));
    }

    /// # Scenario
    /// Update or delete an identifier no row carries.
    ///
    /// # Expected behavior
    /// 404 before the body is even looked at.
    #[test]
    fn unknown_identifier_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let (api, _store, _) = service(tmp.path());

        assert!(matches!(
            api.update(Some(SECRET), "rs42", "garbage").unwrap_err(),
            ApiError::NotFound
        ));
        assert!(matches!(
            api.destroy(Some(SECRET), "rs42").unwrap_err(),
            ApiError::NotFound
        ));
    }

    /// # Scenario
    /// Destroy `rs3`, wait for reconciliation, destroy it again.
    ///
    /// # Expected behavior
    /// Both rows go, the file loses both records and the remaining rows
    /// are renumbered. The second call is a 404.
    #[test]
    fn destroy_removes_every_matching_row() {
        let tmp = TempDir::new().unwrap();
        let (api, store, vcf) = service(tmp.path());

        assert_eq!(api.destroy(Some(SECRET), "rs3").unwrap(), 2);
        assert!(store.rows_with_variant_id("rs3").unwrap().is_empty());

        assert!(store.wait_for_idle(Duration::from_secs(10)).unwrap());
        let text = fs::read_to_string(&vcf).unwrap();
        assert!(!text.contains("rs3"));
        assert_eq!(text.lines().filter(|l| !l.starts_with('#')).count(), 3);
        assert_eq!(
            store
                .rows()
                .unwrap()
                .iter()
                .map(|r| r.line_id)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        assert!(matches!(
            api.destroy(Some(SECRET), "rs3").unwrap_err(),
            ApiError::NotFound
        ));
    }
}
