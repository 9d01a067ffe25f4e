use agentws::core::atomic::{self, WriteOptions, backup_path};
use agentws::core::error::WorkspaceError;
use agentws::core::lock::{LockDescriptor, LockOptions, LockRegistry, LockStatus, lock_path};
use agentws::core::time;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn options() -> LockOptions {
    LockOptions {
        timeout: Duration::from_secs(20),
        stale_threshold: Duration::from_secs(30),
        max_backoff: Duration::from_millis(20),
    }
}

fn read_counter(path: &Path) -> u64 {
    atomic::load_file(path)
        .expect("load counter")
        .map(|s| s.trim().parse().expect("counter is numeric"))
        .unwrap_or(0)
}

fn increment(locks: &LockRegistry, path: &Path) -> Result<(), WorkspaceError> {
    locks.with_lock(path, options(), || {
        let value = read_counter(path);
        // Widen the read-modify-write window so a missing lock would show.
        thread::sleep(Duration::from_millis(15));
        atomic::atomic_write(path, format!("{}\n", value + 1), WriteOptions::default())
    })
}

#[test]
fn five_concurrent_increments_from_threads_yield_five() {
    let tmp = tempdir().expect("tempdir");
    let counter = tmp.path().join("counter.txt");
    atomic::atomic_write(&counter, "0\n", WriteOptions::default()).expect("seed");

    let locks = Arc::new(LockRegistry::new());
    let barrier = Arc::new(Barrier::new(5));
    let handles: Vec<_> = (0..5)
        .map(|_| {
            let locks = Arc::clone(&locks);
            let barrier = Arc::clone(&barrier);
            let counter = counter.clone();
            thread::spawn(move || {
                barrier.wait();
                increment(&locks, &counter)
            })
        })
        .collect();
    for h in handles {
        h.join().expect("join").expect("increment");
    }

    assert_eq!(read_counter(&counter), 5);
    assert!(!lock_path(&counter).exists());
}

#[test]
fn independent_registries_exclude_each_other() {
    let tmp = tempdir().expect("tempdir");
    let counter = tmp.path().join("counter.txt");
    atomic::atomic_write(&counter, "0\n", WriteOptions::default()).expect("seed");

    // Each registry plays a separate process with its own holder id.
    let inside = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(5));
    let handles: Vec<_> = (0..5u32)
        .map(|i| {
            let counter = counter.clone();
            let inside = Arc::clone(&inside);
            let overlapped = Arc::clone(&overlapped);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let locks = LockRegistry::with_holder(100 + i, Arc::new(|_: u32| true));
                barrier.wait();
                locks.with_lock(&counter, options(), || {
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    let value = read_counter(&counter);
                    thread::sleep(Duration::from_millis(10));
                    let result = atomic::atomic_write(
                        &counter,
                        format!("{}\n", value + 1),
                        WriteOptions::no_backup(),
                    );
                    inside.fetch_sub(1, Ordering::SeqCst);
                    result
                })
            })
        })
        .collect();
    for h in handles {
        h.join().expect("join").expect("increment");
    }

    assert!(!overlapped.load(Ordering::SeqCst));
    assert_eq!(read_counter(&counter), 5);
}

#[test]
fn reentrant_increment_inside_locked_section() {
    let tmp = tempdir().expect("tempdir");
    let counter = tmp.path().join("counter.txt");
    let locks = LockRegistry::new();

    locks
        .with_lock(&counter, options(), || {
            increment(&locks, &counter)?;
            assert!(lock_path(&counter).exists(), "inner release kept the lock");
            increment(&locks, &counter)
        })
        .expect("nested increments");
    assert_eq!(read_counter(&counter), 2);
    assert!(!lock_path(&counter).exists());
}

#[test]
fn same_path_spelled_differently_shares_one_lock() {
    let tmp = tempdir().expect("tempdir");
    fs::create_dir_all(tmp.path().join("a")).expect("mkdir");
    let plain = tmp.path().join("r.json");
    let dotted = tmp.path().join("a/../r.json");
    let locks = LockRegistry::new();

    locks
        .with_lock(&plain, options(), || {
            locks.with_lock(&dotted, options(), || {
                assert_eq!(locks.hold_count(&plain), 2);
                Ok(())
            })
        })
        .expect("reentrant via normalized path");
}

#[test]
fn dead_holder_descriptor_is_reclaimed_immediately() {
    let tmp = tempdir().expect("tempdir");
    let record = tmp.path().join("r.json");
    let descriptor = LockDescriptor {
        pid: 999_999_999,
        created_at: time::now_epoch_ms(),
    };
    fs::write(lock_path(&record), serde_json::to_vec(&descriptor).unwrap()).expect("seed lock");

    // Real liveness probe: no such pid on the host.
    let locks = LockRegistry::new();
    let started = Instant::now();
    locks
        .with_lock(&record, options(), || {
            atomic::atomic_write(&record, "mine", WriteOptions::default())
        })
        .expect("reclaimed");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(fs::read_to_string(&record).unwrap(), "mine");
}

#[test]
fn live_fresh_holder_blocks_until_timeout() {
    let tmp = tempdir().expect("tempdir");
    let record = tmp.path().join("r.json");
    let holder = LockRegistry::with_holder(7, Arc::new(|_: u32| true));
    let waiter = LockRegistry::with_holder(8, Arc::new(|_: u32| true));
    let short = LockOptions {
        timeout: Duration::from_millis(250),
        ..options()
    };

    holder
        .with_lock(&record, options(), || {
            let started = Instant::now();
            let err = waiter
                .with_lock(&record, short, || Ok(()))
                .expect_err("must time out");
            assert!(started.elapsed() >= short.timeout);
            assert!(matches!(err, WorkspaceError::LockTimeout { holder: Some(7), .. }));
            assert!(err.to_string().contains("busy"));
            assert!(matches!(
                waiter.inspect(&record, short.stale_threshold).unwrap(),
                LockStatus::Held { .. }
            ));
            Ok(())
        })
        .expect("holder section");
}

#[test]
fn waiter_proceeds_once_holder_releases() {
    let tmp = tempdir().expect("tempdir");
    let record = tmp.path().join("r.json");
    let holder = Arc::new(LockRegistry::with_holder(7, Arc::new(|_: u32| true)));
    let waiter = LockRegistry::with_holder(8, Arc::new(|_: u32| true));
    let entered = Arc::new(Barrier::new(2));

    let h = {
        let holder = Arc::clone(&holder);
        let entered = Arc::clone(&entered);
        let record = record.clone();
        thread::spawn(move || {
            holder.with_lock(&record, options(), || {
                entered.wait();
                thread::sleep(Duration::from_millis(100));
                Ok(())
            })
        })
    };
    entered.wait();
    let started = Instant::now();
    waiter.with_lock(&record, options(), || Ok(())).expect("acquire after release");
    assert!(started.elapsed() >= Duration::from_millis(50));
    h.join().expect("join").expect("holder");
}

#[test]
fn readers_never_observe_torn_writes() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("blob.txt");
    let a = "A".repeat(256 * 1024);
    let b = "B".repeat(256 * 1024);
    atomic::atomic_write(&path, &a, WriteOptions::no_backup()).expect("seed");

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let path = path.clone();
        let stop = Arc::clone(&stop);
        let (a, b) = (a.clone(), b.clone());
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let content = fs::read_to_string(&path).expect("read");
                assert!(content == a || content == b, "torn read of {} bytes", content.len());
            }
        })
    };
    for i in 0..40 {
        let body = if i % 2 == 0 { &b } else { &a };
        atomic::atomic_write(&path, body, WriteOptions::no_backup()).expect("write");
    }
    stop.store(true, Ordering::SeqCst);
    reader.join().expect("reader");
}

#[test]
fn backup_chain_tracks_history_under_the_bound() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("profile.json");
    let opts = WriteOptions {
        backup: true,
        max_backups: 4,
    };
    for i in 0..12 {
        atomic::safe_write_json(&path, &serde_json::json!({ "v": i }), opts).expect("write");
    }

    let backups = fs::read_dir(tmp.path())
        .expect("read_dir")
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains(".bak")
        })
        .count();
    assert_eq!(backups, 4);
    let prior: serde_json::Value = atomic::load_json(&backup_path(&path, 0))
        .expect("load")
        .expect("present");
    assert_eq!(prior["v"], 10);
}
