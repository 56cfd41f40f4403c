use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use anyhow::Result;
use tempfile::tempdir;
use vibestore::concurrency::IsolationLevel;
use vibestore::database::{Database, DatabaseConfig};
use vibestore::error::Error;

fn create(base: &Path) -> Result<Database> {
    Ok(Database::create(base, DatabaseConfig::default())?)
}

fn open(base: &Path) -> Result<Database> {
    Ok(Database::open(base, DatabaseConfig::default())?)
}

#[test]
fn test_hello_end_to_end() -> Result<()> {
    let dir = tempdir()?;
    let db = create(&dir.path().join("hello"))?;
    let vm = db.vm();

    let xid = vm.begin(IsolationLevel::ReadCommitted)?;
    let uid = vm.insert(xid, b"hello")?;
    vm.commit(xid)?;

    let xid2 = vm.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(vm.read(xid2, uid)?, Some(b"hello".to_vec()));
    vm.commit(xid2)?;

    db.close()?;
    Ok(())
}

#[test]
fn test_read_committed_sees_committed_delete() -> Result<()> {
    let dir = tempdir()?;
    let db = create(&dir.path().join("rc"))?;
    let vm = db.vm();

    let writer = vm.begin(IsolationLevel::ReadCommitted)?;
    let uid = vm.insert(writer, b"row")?;
    vm.commit(writer)?;

    let reader = vm.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(vm.read(reader, uid)?, Some(b"row".to_vec()));

    let deleter = vm.begin(IsolationLevel::ReadCommitted)?;
    assert!(vm.delete(deleter, uid)?);
    // Uncommitted delete from another transaction is not observed.
    assert_eq!(vm.read(reader, uid)?, Some(b"row".to_vec()));

    vm.commit(deleter)?;
    assert_eq!(vm.read(reader, uid)?, None);

    db.close()?;
    Ok(())
}

#[test]
fn test_repeatable_read_is_stable() -> Result<()> {
    let dir = tempdir()?;
    let db = create(&dir.path().join("rr"))?;
    let vm = db.vm();

    let setup = vm.begin(IsolationLevel::ReadCommitted)?;
    let uid = vm.insert(setup, b"original")?;
    vm.commit(setup)?;

    let reader = vm.begin(IsolationLevel::RepeatableRead)?;
    let first = vm.read(reader, uid)?;

    let writer = vm.begin(IsolationLevel::ReadCommitted)?;
    assert!(vm.delete(writer, uid)?);
    vm.insert(writer, b"replacement")?;
    vm.commit(writer)?;

    assert_eq!(vm.read(reader, uid)?, first);
    assert_eq!(first, Some(b"original".to_vec()));

    db.close()?;
    Ok(())
}

#[test]
fn test_deadlock_aborts_exactly_one() -> Result<()> {
    let dir = tempdir()?;
    let db = create(&dir.path().join("deadlock"))?;
    let vm = Arc::clone(db.vm());

    let setup = vm.begin(IsolationLevel::ReadCommitted)?;
    let a = vm.insert(setup, b"a")?;
    let b = vm.insert(setup, b"b")?;
    vm.commit(setup)?;

    let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
    let t2 = vm.begin(IsolationLevel::ReadCommitted)?;
    assert!(vm.delete(t1, a)?);
    assert!(vm.delete(t2, b)?);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [(t1, b), (t2, a)]
        .into_iter()
        .map(|(xid, uid)| {
            let vm = Arc::clone(&vm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let result = vm.delete(xid, uid);
                match result {
                    Ok(deleted) => {
                        vm.commit(xid).map_err(anyhow::Error::from)?;
                        Ok(Some(deleted))
                    }
                    Err(Error::Deadlock(x)) if x == xid => {
                        vm.abort(xid).map_err(anyhow::Error::from)?;
                        Ok(None)
                    }
                    Err(e) => Err(anyhow::Error::from(e)),
                }
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        let outcome: Result<Option<bool>> = handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker panicked"))?;
        outcomes.push(outcome?);
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_none()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == Some(true)).count(), 1);

    // The survivor deleted both records.
    let check = vm.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(vm.read(check, a)?, None);
    assert_eq!(vm.read(check, b)?, None);
    vm.commit(check)?;

    db.close()?;
    Ok(())
}

#[test]
fn test_abort_rolls_back() -> Result<()> {
    let dir = tempdir()?;
    let db = create(&dir.path().join("abort"))?;
    let vm = db.vm();

    let setup = vm.begin(IsolationLevel::ReadCommitted)?;
    let kept = vm.insert(setup, b"kept")?;
    vm.commit(setup)?;

    let xid = vm.begin(IsolationLevel::ReadCommitted)?;
    let discarded = vm.insert(xid, b"discarded")?;
    assert!(vm.delete(xid, kept)?);
    vm.abort(xid)?;
    assert!(db.tm().is_aborted(xid));

    let check = vm.begin(IsolationLevel::RepeatableRead)?;
    assert_eq!(vm.read(check, kept)?, Some(b"kept".to_vec()));
    assert_eq!(vm.read(check, discarded)?, None);
    vm.commit(check)?;

    db.close()?;
    Ok(())
}

#[test]
fn test_data_too_large() -> Result<()> {
    let dir = tempdir()?;
    let db = create(&dir.path().join("large"))?;
    let vm = db.vm();

    let xid = vm.begin(IsolationLevel::ReadCommitted)?;
    let result = vm.insert(xid, &vec![7u8; 8192]);
    assert!(matches!(result, Err(Error::DataTooLarge { .. })));

    // A record that just fits still goes in.
    let fits = vec![7u8; 8190 - 3 - 16];
    let uid = vm.insert(xid, &fits)?;
    assert_eq!(vm.read(xid, uid)?, Some(fits));
    vm.commit(xid)?;

    db.close()?;
    Ok(())
}

#[test]
fn test_crash_recovery() -> Result<()> {
    let dir = tempdir()?;
    let base = dir.path().join("crash");

    let (committed, uncommitted, t1, t2) = {
        let db = create(&base)?;
        let vm = db.vm();

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let committed = vm.insert(t1, b"survives")?;
        vm.commit(t1)?;

        let t2 = vm.begin(IsolationLevel::ReadCommitted)?;
        let uncommitted = vm.insert(t2, b"lost")?;

        // Simulate a crash: nothing is closed and no dirty page is flushed.
        std::mem::forget(db);
        (committed, uncommitted, t1, t2)
    };

    let db = open(&base)?;
    assert!(db.tm().is_committed(t1));
    assert!(db.tm().is_aborted(t2));
    assert!(db.tm().active_transactions().is_empty());

    let vm = db.vm();
    let xid = vm.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(vm.read(xid, committed)?, Some(b"survives".to_vec()));
    assert_eq!(vm.read(xid, uncommitted)?, None);

    // New inserts land after the recovered records.
    let fresh = vm.insert(xid, b"fresh")?;
    assert_ne!(fresh, committed);
    assert_ne!(fresh, uncommitted);
    vm.commit(xid)?;
    db.close()?;

    // A clean reopen keeps everything.
    let db = open(&base)?;
    let vm = db.vm();
    let xid = vm.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(vm.read(xid, committed)?, Some(b"survives".to_vec()));
    assert_eq!(vm.read(xid, fresh)?, Some(b"fresh".to_vec()));
    assert_eq!(vm.read(xid, uncommitted)?, None);
    vm.commit(xid)?;
    db.close()?;
    Ok(())
}

#[test]
fn test_log_bad_tail_is_dropped() -> Result<()> {
    let dir = tempdir()?;
    let base = dir.path().join("tail");

    let uid = {
        let db = create(&base)?;
        let vm = db.vm();
        let xid = vm.begin(IsolationLevel::ReadCommitted)?;
        let uid = vm.insert(xid, b"durable")?;
        vm.commit(xid)?;
        db.close()?;
        uid
    };

    // A torn append: a size prefix promising more bytes than follow.
    let log_path = dir.path().join("tail.log");
    let before = std::fs::metadata(&log_path)?.len();
    {
        let mut log = OpenOptions::new().append(true).open(&log_path)?;
        log.write_all(&[0, 0, 0, 64, 1, 2, 3, 4, 5])?;
    }

    let db = open(&base)?;
    assert_eq!(std::fs::metadata(&log_path)?.len(), before);

    let vm = db.vm();
    let xid = vm.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(vm.read(xid, uid)?, Some(b"durable".to_vec()));
    vm.commit(xid)?;
    db.close()?;
    Ok(())
}

#[test]
fn test_concurrent_inserts() -> Result<()> {
    let dir = tempdir()?;
    let db = create(&dir.path().join("concurrent"))?;
    let vm = Arc::clone(db.vm());

    let workers = 8;
    let per_worker = 50;
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let vm = Arc::clone(&vm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> vibestore::error::Result<Vec<_>> {
                barrier.wait();
                let xid = vm.begin(IsolationLevel::ReadCommitted)?;
                let mut written = Vec::new();
                for i in 0..per_worker {
                    let data = format!("worker-{}-row-{}", w, i).into_bytes();
                    written.push((vm.insert(xid, &data)?, data));
                }
                vm.commit(xid)?;
                Ok(written)
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        let written = handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        all.extend(written);
    }
    assert_eq!(all.len(), workers * per_worker);

    let xid = vm.begin(IsolationLevel::RepeatableRead)?;
    for (uid, data) in &all {
        assert_eq!(vm.read(xid, *uid)?.as_ref(), Some(data));
    }
    vm.commit(xid)?;

    db.close()?;
    Ok(())
}
