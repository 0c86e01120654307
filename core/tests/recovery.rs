use std::fs::OpenOptions;
use std::io::Write;

use keel_core::{Config, Database, IsolationLevel, KeelError};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

const RC: IsolationLevel = IsolationLevel::ReadCommitted;

#[test]
fn test_crash_keeps_committed_and_drops_uncommitted() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("crash"));

    let (kept, updated, lost, deleted) = {
        let db = Database::create(&config).unwrap();

        let setup = db.begin(RC);
        let kept = db.insert(setup, b"kept").unwrap();
        let original = db.insert(setup, b"original").unwrap();
        let deleted = db.insert(setup, b"survives").unwrap();
        db.commit(setup).unwrap();

        let committed = db.begin(RC);
        let updated = db.update(committed, original, b"updated").unwrap().unwrap();
        db.commit(committed).unwrap();

        let in_flight = db.begin(RC);
        let lost = db.insert(in_flight, b"lost").unwrap();
        assert!(db.delete(in_flight, deleted).unwrap());

        // Dropped without close
        (kept, updated, lost, deleted)
    };

    let db = Database::open(&config).unwrap();
    assert!(!db.clean_shutdown());
    assert_eq!(db.recovery_report().aborted.len(), 1);

    let xid = db.begin(RC);
    assert_eq!(db.read(xid, kept).unwrap(), Some(b"kept".to_vec()));
    assert_eq!(db.read(xid, updated).unwrap(), Some(b"updated".to_vec()));
    assert_eq!(db.read(xid, lost).unwrap(), None);
    assert_eq!(db.read(xid, deleted).unwrap(), Some(b"survives".to_vec()));
    db.commit(xid).unwrap();
    db.close().unwrap();

    // A second open finds nothing left to undo
    let db = Database::open(&config).unwrap();
    assert!(db.clean_shutdown());
    assert!(db.recovery_report().aborted.is_empty());
    assert_eq!(db.recovery_report().undone, 0);
}

#[test]
fn test_reopen_reproduces_bytes() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("bytes"));
    let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();

    let uid = {
        let db = Database::create(&config).unwrap();
        let xid = db.begin(RC);
        let uid = db.insert(xid, &payload).unwrap();
        db.commit(xid).unwrap();
        db.close().unwrap();
        uid
    };

    let db = Database::open(&config).unwrap();
    let xid = db.begin(IsolationLevel::RepeatableRead);
    assert_eq!(db.read(xid, uid).unwrap(), Some(payload));
}

#[test]
fn test_torn_log_tail_is_ignored() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("torn"));

    let uid = {
        let db = Database::create(&config).unwrap();
        let xid = db.begin(RC);
        let uid = db.insert(xid, b"before the tear").unwrap();
        db.commit(xid).unwrap();
        uid
    };

    let mut log = OpenOptions::new().append(true).open(config.log_path()).unwrap();
    log.write_all(&[0, 0, 1, 0, 0xde, 0xad]).unwrap();
    drop(log);

    let db = Database::open(&config).unwrap();
    assert_eq!(db.recovery_report().records, 1);
    let xid = db.begin(RC);
    assert_eq!(db.read(xid, uid).unwrap(), Some(b"before the tear".to_vec()));
}

#[test]
fn test_corrupt_ledger_refuses_to_open() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("corrupt"));
    Database::create(&config).unwrap().close().unwrap();

    let mut ledger = OpenOptions::new().append(true).open(config.ledger_path()).unwrap();
    ledger.write_all(&[0, 0, 0]).unwrap();
    drop(ledger);

    assert!(matches!(Database::open(&config), Err(KeelError::CorruptLedger(_))));
}

#[test]
fn test_oversized_insert_rejected() {
    let dir = tempdir().unwrap();
    let db = Database::create(&Config::new(dir.path().join("big"))).unwrap();
    let xid = db.begin(RC);

    let err = db.insert(xid, &vec![0u8; 9000]).unwrap_err();
    assert_eq!(err.kind(), "data_too_large");

    // The transaction is still usable
    let uid = db.insert(xid, b"small").unwrap();
    assert_eq!(db.read(xid, uid).unwrap(), Some(b"small".to_vec()));
}
