mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

fn single_row_csv() -> tempfile::NamedTempFile {
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "txn_id, merchant_id, terminal_id, amount_minor_units, currency, card_pan").unwrap();
    writeln!(csv, "1, m-1, t-1, 100, USD, 4111111111111111").unwrap();
    csv
}

#[cfg(not(feature = "storage-rocksdb"))]
#[test]
fn test_rocksdb_fallback_warning() {
    let csv = single_row_csv();
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("gateway.toml");
    common::write_offline_config(&config, "").unwrap();

    let mut cmd = Command::new(cargo_bin!("fraudgate"));
    cmd.env("RUST_LOG", "off")
        .arg("replay")
        .arg(csv.path())
        .arg("--config")
        .arg(&config)
        .arg("--db-path")
        .arg("some_db");

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."));
}

#[cfg(feature = "storage-rocksdb")]
#[test]
fn test_rocksdb_no_fallback_warning() {
    let csv = single_row_csv();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test_db");
    let config = dir.path().join("gateway.toml");
    common::write_offline_config(&config, "").unwrap();

    let mut cmd = Command::new(cargo_bin!("fraudgate"));
    cmd.env("RUST_LOG", "off")
        .arg("replay")
        .arg(csv.path())
        .arg("--config")
        .arg(&config)
        .arg("--db-path")
        .arg(&db_path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("WARNING").not());
}
