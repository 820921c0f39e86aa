//! Import, edit, persist and pin datasets through the store.

use serde_json::json;
use tally_core::dataset::import_csv;
use tally_core::{ColumnRoles, DatasetStore, DatasetVersionError, RecordPatch, StagedEdit};

const CAPITALS: &str = "\
id,country,capital,source
fr,France,Paris,atlas
de,Germany,Berlin,atlas
";

fn imported_store() -> DatasetStore {
    let roles = ColumnRoles::new(["country"]).expected(["capital"]).id_column("id");
    let records = import_csv(CAPITALS.as_bytes(), &roles).unwrap();
    let store = DatasetStore::new();
    store.create("capitals", records).unwrap();
    store
}

#[test]
fn imported_records_keep_roles() {
    let store = imported_store();
    let snapshot = store.current("capitals").unwrap();

    assert_eq!(snapshot.version, 0);
    assert_eq!(snapshot.len(), 2);
    let france = &snapshot.records[0];
    assert_eq!(france.id, "fr");
    assert_eq!(france.input_data, json!({"country": "France"}));
    assert_eq!(france.expected_output, Some(json!({"capital": "Paris"})));
    assert_eq!(france.metadata, Some(json!({"source": "atlas"})));
}

#[test]
fn pinned_snapshot_survives_later_commits() {
    let store = imported_store();
    let pinned = store.resolve("capitals", None).unwrap();

    {
        let handle = store.dataset("capitals").unwrap();
        let mut dataset = handle.write();
        dataset
            .stage(StagedEdit::Update {
                index: 1,
                patch: RecordPatch::new().expected_output(json!({"capital": "Bonn"})),
            })
            .unwrap();
        assert_eq!(dataset.commit().unwrap(), 1);
    }

    assert_eq!(pinned.version, 0);
    assert_eq!(pinned.records[1].expected_output, Some(json!({"capital": "Berlin"})));
    assert_eq!(store.current("capitals").unwrap().version, 1);
    assert_eq!(store.resolve("capitals", Some(0)).unwrap(), pinned);
}

#[test]
fn store_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("datasets.json");

    let store = imported_store();
    {
        let handle = store.dataset("capitals").unwrap();
        let mut dataset = handle.write();
        dataset
            .stage(StagedEdit::Delete { index: 0 })
            .unwrap();
        dataset.commit().unwrap();
    }
    store.save(&path).unwrap();

    let reloaded = DatasetStore::load(&path).unwrap();
    let current = reloaded.current("capitals").unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.records[0].id, "de");
    assert_eq!(reloaded.resolve("capitals", Some(0)).unwrap().len(), 2);

    let err = reloaded.create("capitals", vec![]).unwrap_err();
    assert_eq!(err, DatasetVersionError::DuplicateName("capitals".to_string()));
}

#[test]
fn unknown_version_is_not_found() {
    let store = imported_store();
    let err = store.resolve("capitals", Some(7)).unwrap_err();
    assert!(matches!(err, DatasetVersionError::NotFound { version: 7, .. }));
}
