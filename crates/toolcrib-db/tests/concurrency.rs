//! Concurrency tests for schema initialization and barcode allocation.
//!
//! These run against on-disk databases (WAL mode needs a real file) with
//! many threads racing through a `Barrier` so the critical sections overlap.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection};
use tempfile::TempDir;
use toolcrib_db::{
    allocate, Database, DbError, DbRuntimeSettings, SchemaManager, TOOL_BARCODES,
};
use toolcrib_types::BarcodeRequest;

fn settings() -> DbRuntimeSettings {
    DbRuntimeSettings {
        busy_timeout_ms: 5_000,
        pool_max_size: 8,
        auto_migrate: true,
    }
}

fn open_db(dir: &TempDir) -> Database {
    Database::open(dir.path().join("inventory.db"), settings()).expect("database should open")
}

fn raw_connection(path: &Path) -> Connection {
    let conn = Connection::open(path).expect("should open raw connection");
    conn.busy_timeout(Duration::from_secs(5))
        .expect("should set busy timeout");
    conn
}

fn insert_tool(db: &Database, name: &str, request: BarcodeRequest) -> Result<Option<i64>, DbError> {
    let mut session = db.session()?;
    let allocation = allocate(
        &mut session,
        &TOOL_BARCODES,
        request,
        None,
        |tx, barcode| -> Result<(), DbError> {
            tx.execute(
                "INSERT INTO inventory (name, barcode) VALUES (?1, ?2)",
                params![name, barcode],
            )?;
            Ok(())
        },
    )?;
    session.close()?;
    Ok(allocation.identifier)
}

fn tool_barcodes(db: &Database) -> Vec<(String, Option<i64>)> {
    let session = db.session().expect("should open session");
    let conn = session.conn().expect("open");
    let mut stmt = conn
        .prepare("SELECT name, barcode FROM inventory ORDER BY id")
        .expect("should prepare");
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .expect("should query");
    rows.map(|r| r.expect("should read row")).collect()
}

#[test]
fn concurrent_allocations_fill_one_to_n() {
    const WRITERS: usize = 24;

    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = open_db(&dir);
    db.session().expect("initial session should migrate");

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                // Busy is retryable by the caller; retry from the start.
                loop {
                    match insert_tool(&db, &format!("tool-{i}"), BarcodeRequest::Allocate) {
                        Err(e) if e.is_retryable() => continue,
                        other => break other,
                    }
                }
            })
        })
        .collect();

    let mut assigned = BTreeSet::new();
    for handle in handles {
        let barcode = handle
            .join()
            .expect("writer should not panic")
            .expect("allocation should succeed")
            .expect("allocation should assign a barcode");
        assert!(assigned.insert(barcode), "barcode {barcode} assigned twice");
    }

    let expected: BTreeSet<i64> = (1..=WRITERS as i64).collect();
    assert_eq!(assigned, expected);

    let stored: BTreeSet<i64> = tool_barcodes(&db)
        .into_iter()
        .filter_map(|(_, barcode)| barcode)
        .collect();
    assert_eq!(stored, expected);
}

#[test]
fn allocation_reuses_lowest_gap() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = open_db(&dir);

    insert_tool(&db, "hammer", BarcodeRequest::Explicit(1)).expect("insert");
    insert_tool(&db, "saw", BarcodeRequest::Explicit(3)).expect("insert");

    let barcode = insert_tool(&db, "drill", BarcodeRequest::Allocate).expect("allocate");
    assert_eq!(barcode, Some(2));

    let barcode = insert_tool(&db, "level", BarcodeRequest::Allocate).expect("allocate");
    assert_eq!(barcode, Some(4));
}

#[test]
fn explicit_conflict_leaves_table_unchanged() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = open_db(&dir);

    insert_tool(&db, "hammer", BarcodeRequest::Explicit(7)).expect("insert");
    insert_tool(&db, "saw", BarcodeRequest::Unassigned).expect("insert");
    let before = tool_barcodes(&db);

    let err = insert_tool(&db, "drill", BarcodeRequest::Explicit(7))
        .expect_err("duplicate barcode should be refused");
    match err {
        DbError::AlreadyAllocated { identifier, owner } => {
            assert_eq!(identifier, 7);
            assert_eq!(owner, "hammer");
        }
        other => panic!("unexpected error type: {other:?}"),
    }

    assert_eq!(tool_barcodes(&db), before);
}

#[test]
fn failed_dependent_write_rolls_back() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = open_db(&dir);

    let mut session = db.session().expect("should open session");
    let err = allocate(
        &mut session,
        &TOOL_BARCODES,
        BarcodeRequest::Allocate,
        None,
        |tx, barcode| -> Result<(), DbError> {
            tx.execute(
                "INSERT INTO inventory (name, barcode) VALUES ('ghost', ?1)",
                params![barcode],
            )?;
            // holder 99 does not exist; foreign keys are enforced
            tx.execute(
                "UPDATE inventory SET holder_id = 99 WHERE name = 'ghost'",
                [],
            )?;
            Ok(())
        },
    )
    .expect_err("foreign key violation should fail the allocation");
    assert!(matches!(err, DbError::Database(_)));
    session.close().expect("close");

    assert!(tool_barcodes(&db).is_empty(), "partial allocation must not be visible");
    assert_eq!(
        insert_tool(&db, "drill", BarcodeRequest::Allocate).expect("allocate"),
        Some(1)
    );
}

#[test]
fn contended_lock_surfaces_busy() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("inventory.db");
    let db = Database::open(
        &path,
        DbRuntimeSettings {
            busy_timeout_ms: 50,
            ..settings()
        },
    )
    .expect("database should open");
    let mut session = db.session().expect("initial session should migrate");

    let holder = raw_connection(&path);
    holder
        .execute_batch("BEGIN EXCLUSIVE;")
        .expect("holder should take the write lock");

    let err = allocate(
        &mut session,
        &TOOL_BARCODES,
        BarcodeRequest::Allocate,
        None,
        |_, _| Ok::<_, DbError>(()),
    )
    .expect_err("allocation should time out");
    assert!(matches!(err, DbError::Busy(_)), "got {err:?}");
    assert!(err.is_retryable());

    holder.execute_batch("ROLLBACK;").expect("holder should release");
    let retried = allocate(
        &mut session,
        &TOOL_BARCODES,
        BarcodeRequest::Allocate,
        None,
        |_, barcode| Ok::<_, DbError>(barcode),
    )
    .expect("retry should succeed");
    assert_eq!(retried.value, Some(1));
}

#[test]
fn concurrent_initializers_migrate_once() {
    const INITIALIZERS: usize = 10;

    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("inventory.db");
    let schema = Arc::new(SchemaManager::inventory());
    let barrier = Arc::new(Barrier::new(INITIALIZERS));

    let handles: Vec<_> = (0..INITIALIZERS)
        .map(|_| {
            let path = path.clone();
            let schema = Arc::clone(&schema);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut conn = raw_connection(&path);
                barrier.wait();
                schema.ensure_up_to_date(&mut conn, true)
            })
        })
        .collect();

    let applied: Vec<usize> = handles
        .into_iter()
        .map(|h| {
            h.join()
                .expect("initializer should not panic")
                .expect("initializer should succeed")
        })
        .collect();

    assert_eq!(applied.iter().sum::<usize>(), 2, "one batch of two steps");
    assert_eq!(applied.iter().filter(|&&n| n > 0).count(), 1);
    assert_eq!(schema.cached_version(), Some(2));

    let conn = raw_connection(&path);
    let stored: String = conn
        .query_row(
            "SELECT value FROM db_meta_props WHERE name = 'db_version'",
            [],
            |row| row.get(0),
        )
        .expect("version should be stored");
    assert_eq!(stored, "2");
}

#[test]
fn independent_managers_never_double_apply() {
    // Two managers model two processes sharing one file.
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("inventory.db");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let schema = SchemaManager::inventory();
                let mut conn = raw_connection(&path);
                barrier.wait();
                let applied = schema.ensure_up_to_date(&mut conn, true)?;
                Ok::<_, DbError>((applied, schema.cached_version()))
            })
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        let (applied, cached) = handle
            .join()
            .expect("initializer should not panic")
            .expect("initializer should succeed");
        total += applied;
        assert_eq!(cached, Some(2));
    }
    assert_eq!(total, 2);
}

#[test]
fn refused_handle_is_accepted_after_external_migration() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let strict = Database::open(
        dir.path().join("inventory.db"),
        DbRuntimeSettings {
            auto_migrate: false,
            ..settings()
        },
    )
    .expect("database should open");

    let err = strict.session().expect_err("stale schema should be refused");
    assert!(matches!(err, DbError::VersionMismatch { found: 0, required: 2 }));
    assert_eq!(strict.schema().cached_version(), Some(0));

    // Another handle, standing in for another process, migrates the file.
    let migrating = Database::open(dir.path().join("inventory.db"), settings())
        .expect("database should open");
    migrating.session().expect("auto-migrating session should succeed");

    let session = strict
        .session()
        .expect("the same handle should see the migrated schema");
    assert_eq!(session.schema_version().expect("version"), 2);
    assert_eq!(strict.schema().cached_version(), Some(2));
}
