//! Row mutations: validation, identifiers, dirty flags and coordination
//! signals. No run is executed here.

#[cfg(test)]
mod tests {
    use crate::coordinator::{ReconcileRequest, SyncState};
    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineError};
    use crate::validation::{Mode, RowInput};
    use tempfile::TempDir;

    /// # Scenario
    /// Import a 5-record file.
    ///
    /// # Expected behavior
    /// Five clean rows numbered 1..=5 in file order, no tombstones, and
    /// a file record that needs no update.
    #[test]
    fn import_registers_clean_rows() {
        let tmp = TempDir::new().unwrap();
        let (engine, executor, vcf) = setup(tmp.path(), 5);

        let rows = engine.rows().unwrap();
        assert_eq!(rows.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.row_id, i as u64 + 1);
            assert_eq!(row.line_id, i as u64 + 1);
            assert!(!row.dirty);
            assert_eq!(row.fields.pos, (i as u64 + 1) * 100);
        }

        let status = engine.file_status().unwrap().unwrap();
        assert_eq!(status.file.path, vcf);
        assert_eq!(status.file.name, "sample");
        assert!(!status.needs_update);
        assert!(!status.is_updating);
        assert_eq!(status.tombstones, 0);
        assert_eq!(executor.pending(), 0);
    }

    /// # Scenario
    /// Create a row before any file is imported.
    ///
    /// # Expected behavior
    /// `NoFile`, and nothing is submitted.
    #[test]
    fn create_without_file_fails() {
        let tmp = TempDir::new().unwrap();
        let executor = ManualExecutor::new();
        let (engine, _) = Engine::open(tmp.path(), test_config(), executor.clone()).unwrap();

        let err = engine.create_row(&input("chr2", 10, "rs1")).unwrap_err();
        assert!(matches!(err, EngineError::NoFile));
        assert!(engine.file_status().unwrap().is_none());
        assert_eq!(executor.pending(), 0);
    }

    /// # Scenario
    /// Create with an invalid chromosome and a missing REF.
    ///
    /// # Expected behavior
    /// Both fields are reported and the store is unchanged.
    #[test]
    fn create_rejects_invalid_input() {
        let tmp = TempDir::new().unwrap();
        let (engine, executor, _) = setup(tmp.path(), 2);

        let bad = RowInput {
            reference: None,
            ..input("chr23", 10, "rs1")
        };
        match engine.create_row(&bad) {
            Err(EngineError::Validation(errors)) => {
                assert!(errors.get("chrom").is_some());
                assert!(errors.get("ref").is_some());
                assert!(errors.get("pos").is_none());
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(engine.rows().unwrap().len(), 2);
        assert_eq!(executor.pending(), 0);
    }

    /// # Scenario
    /// Create one row on a 3-record file, then a second.
    ///
    /// # Expected behavior
    /// The first takes line 4 and starts a run; the second takes line 5
    /// and coalesces. Exactly one job is queued.
    #[test]
    fn create_appends_and_starts_one_run() {
        let tmp = TempDir::new().unwrap();
        let (engine, executor, _) = setup(tmp.path(), 3);

        let (first, request) = engine.create_row(&input("chr2", 10, "rs10")).unwrap();
        assert_eq!(request, ReconcileRequest::Started);
        assert_eq!((first.row_id, first.line_id), (4, 4));
        assert!(first.dirty);
        assert_eq!(first.version, 1);

        let (second, request) = engine.create_row(&input("chrX", 20, "rs20")).unwrap();
        assert_eq!(request, ReconcileRequest::Coalesced);
        assert_eq!((second.row_id, second.line_id), (5, 5));

        assert_eq!(executor.pending(), 1);
        assert_eq!(
            engine.sync_state().unwrap(),
            SyncState::RunningWithPendingChanges
        );
        let status = engine.file_status().unwrap().unwrap();
        assert!(status.needs_update);
        assert!(status.is_updating);
        assert_eq!(status.dirty_rows, 2);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.requests_coalesced, 1);
    }

    /// # Scenario
    /// Delete the last row, then create a new one.
    ///
    /// # Expected behavior
    /// The new row is placed after the tombstone, never on top of it.
    #[test]
    fn create_after_delete_skips_tombstone_position() {
        let tmp = TempDir::new().unwrap();
        let (engine, _executor, _) = setup(tmp.path(), 3);

        engine.delete_row(3).unwrap();
        let (row, _) = engine.create_row(&input("chr5", 1, "rs5")).unwrap();
        assert_eq!(row.line_id, 4);
        assert_eq!(row.row_id, 4);
    }

    /// # Scenario
    /// Partial update of ALT on row 2, then a full replace of row 1.
    ///
    /// # Expected behavior
    /// Partial keeps every other field; replace overwrites them. Both rows
    /// become dirty with a bumped version.
    #[test]
    fn partial_and_full_updates() {
        let tmp = TempDir::new().unwrap();
        let (engine, _executor, _) = setup(tmp.path(), 3);
        let before = engine.get_row(2).unwrap().unwrap();

        let (row, _) = engine.update_row(2, &alt_only("T"), Mode::Partial).unwrap();
        assert_eq!(row.fields.alt.as_deref(), Some("T"));
        assert_eq!(row.fields.chrom, before.fields.chrom);
        assert_eq!(row.fields.pos, before.fields.pos);
        assert_eq!(row.fields.id, before.fields.id);
        assert!(row.dirty);
        assert_eq!(row.version, before.version + 1);

        let (row, _) = engine
            .update_row(1, &input("chrY", 77, "rs77"), Mode::Replace)
            .unwrap();
        assert_eq!(row.fields.chrom, "chrY");
        assert_eq!(row.fields.pos, 77);
        assert_eq!(row.fields.reference, "T");
        assert_eq!(row.line_id, 1);
    }

    /// # Scenario
    /// Replace with a missing required field.
    ///
    /// # Expected behavior
    /// Rejected; the same input is fine as a partial update.
    #[test]
    fn replace_requires_all_fields() {
        let tmp = TempDir::new().unwrap();
        let (engine, _executor, _) = setup(tmp.path(), 1);

        let err = engine.update_row(1, &alt_only("A"), Mode::Replace).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(!engine.get_row(1).unwrap().unwrap().dirty);

        engine.update_row(1, &alt_only("A"), Mode::Partial).unwrap();
        assert!(engine.get_row(1).unwrap().unwrap().dirty);
    }

    /// # Scenario
    /// Update several rows where one id is unknown.
    ///
    /// # Expected behavior
    /// `RowNotFound` and none of the rows changed.
    #[test]
    fn batch_update_is_all_or_nothing() {
        let tmp = TempDir::new().unwrap();
        let (engine, executor, _) = setup(tmp.path(), 3);

        let err = engine
            .update_rows(&[1, 2, 42], &alt_only("C"), Mode::Partial)
            .unwrap_err();
        assert!(matches!(err, EngineError::RowNotFound(42)));
        assert!(engine.rows().unwrap().iter().all(|r| !r.dirty));
        assert_eq!(executor.pending(), 0);

        let (rows, request) = engine
            .update_rows(&[1, 3], &alt_only("C"), Mode::Partial)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(request, ReconcileRequest::Started);
        assert_eq!(executor.pending(), 1);
    }

    /// # Scenario
    /// Delete row 3 of 5.
    ///
    /// # Expected behavior
    /// The row is gone, a tombstone holds line 3 and the other rows keep
    /// their positions until a pass commits.
    #[test]
    fn delete_leaves_tombstone() {
        let tmp = TempDir::new().unwrap();
        let (engine, _executor, _) = setup(tmp.path(), 5);

        assert_eq!(engine.delete_row(3).unwrap(), ReconcileRequest::Started);
        assert!(engine.get_row(3).unwrap().is_none());
        assert_eq!(engine.get_row(4).unwrap().unwrap().line_id, 4);

        let status = engine.file_status().unwrap().unwrap();
        assert_eq!(status.tombstones, 1);
        assert_eq!(status.rows, 4);
        assert!(status.needs_update);

        assert!(matches!(
            engine.delete_row(3).unwrap_err(),
            EngineError::RowNotFound(3)
        ));
        assert!(matches!(
            engine.delete_rows(&[1, 99]).unwrap_err(),
            EngineError::RowNotFound(99)
        ));
        assert!(engine.get_row(1).unwrap().is_some());
    }

    /// # Scenario
    /// Look rows up by variant identifier after an update that gives a
    /// second row the same identifier.
    ///
    /// # Expected behavior
    /// Both rows are returned in file order.
    #[test]
    fn lookup_by_variant_id() {
        let tmp = TempDir::new().unwrap();
        let (engine, _executor, _) = setup(tmp.path(), 4);

        let same_id = RowInput {
            id: Some("rs2".into()),
            ..RowInput::default()
        };
        engine.update_row(4, &same_id, Mode::Partial).unwrap();

        let rows = engine.rows_with_variant_id("rs2").unwrap();
        assert_eq!(rows.iter().map(|r| r.row_id).collect::<Vec<_>>(), vec![2, 4]);
        assert!(engine.rows_with_variant_id("rs99").unwrap().is_empty());
    }

    /// # Scenario
    /// Manual reconcile request with and without a file.
    ///
    /// # Expected behavior
    /// `NoFile` without one; otherwise a run is started even with nothing
    /// pending.
    #[test]
    fn manual_reconcile_request() {
        let tmp = TempDir::new().unwrap();
        let executor = ManualExecutor::new();
        let (engine, _) =
            Engine::open(tmp.path().join("empty"), test_config(), executor.clone()).unwrap();
        assert!(matches!(engine.reconcile().unwrap_err(), EngineError::NoFile));

        let (engine, executor, _) = setup(tmp.path(), 1);
        assert_eq!(engine.reconcile().unwrap(), ReconcileRequest::Started);
        assert_eq!(executor.run_all(), 1);
        assert_eq!(engine.sync_state().unwrap(), SyncState::Idle);
        assert_eq!(engine.stats().unwrap().passes_committed, 0);
    }
}
