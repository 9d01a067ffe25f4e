use agentws::core::config::ReputationConfig;
use agentws::core::error::WorkspaceError;
use agentws::core::lock::{LockOptions, LockRegistry};
use agentws::core::store::Workspace;
use agentws::core::time::MS_PER_DAY;
use agentws::plugins::reputation::{
    DOMAIN_COMPETENCE, NEUTRAL_SCORE, Profile, ReputationEngine, SignalInput,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

const MONTH: i64 = 30 * MS_PER_DAY;

fn engine(locks: Arc<LockRegistry>) -> ReputationEngine {
    ReputationEngine::new(locks, ReputationConfig::default()).with_lock_options(LockOptions {
        timeout: Duration::from_secs(20),
        stale_threshold: Duration::from_secs(30),
        max_backoff: Duration::from_millis(20),
    })
}

#[test]
fn concurrent_posts_lose_no_signal() {
    let tmp = tempdir().expect("tempdir");
    let ws = Workspace::init(tmp.path()).expect("init");
    let path = ws.profile_path("alice").expect("path");
    let locks = Arc::new(LockRegistry::new());
    let engine = Arc::new(engine(Arc::clone(&locks)));

    engine
        .post_signal(
            &path,
            SignalInput::new("seed", "reliability", 0.5, 0).new_profile("alice", "Alice"),
        )
        .expect("seed");

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.post_signal(
                    &path,
                    SignalInput::new(&format!("worker-{}", i), "reliability", 0.9, 1_000 + i),
                )
            })
        })
        .collect();
    for h in handles {
        h.join().expect("join").expect("post");
    }

    let profile = engine.read_profile(&path, 2_000).expect("read").expect("present");
    assert_eq!(profile.signal_count, 9);
    assert_eq!(profile.dimensions["reliability"].stored.sample_size, 9);
}

#[test]
fn separate_engines_share_profile_safely() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("bob.json");
    let barrier = Arc::new(Barrier::new(5));

    // Five "processes", each with its own registry and engine.
    let handles: Vec<_> = (0..5u32)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            thread::spawn(move || {
                let locks = Arc::new(LockRegistry::with_holder(500 + i, Arc::new(|_: u32| true)));
                let e = engine(locks);
                barrier.wait();
                e.post_signal(
                    &path,
                    SignalInput::new("peer", "quality", 0.8, i as i64).new_profile("bob", "Bob"),
                )
            })
        })
        .collect();
    for h in handles {
        h.join().expect("join").expect("post");
    }

    let raw: Profile = agentws::core::atomic::load_json(&path)
        .expect("load")
        .expect("present");
    assert_eq!(raw.signals.len(), 5);
    assert_eq!(raw.dimensions["quality"].sample_size, 5);
    assert_eq!(raw.display_name, "Bob");
}

#[test]
fn repeated_signal_converges_to_its_value() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("carol.json");
    let e = engine(Arc::new(LockRegistry::new()));

    let mut last = e
        .post_signal(
            &path,
            SignalInput::new("t", "quality", 0.1, 0).new_profile("carol", "Carol"),
        )
        .expect("first");
    for n in 1..120 {
        last = e
            .post_signal(&path, SignalInput::new("t", "quality", 0.95, n))
            .expect("post");
        assert!(last.confidence < 1.0 && last.confidence > 0.0);
        assert!((0.0..=1.0).contains(&last.score));
    }
    assert!((last.score - 0.95).abs() < 1e-3, "score {}", last.score);
    assert!(last.confidence > 0.9);
}

#[test]
fn effective_scores_relax_toward_neutral_on_read() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("dan.json");
    let e = engine(Arc::new(LockRegistry::new()));
    e.post_signal(
        &path,
        SignalInput::new("t", "honesty", 0.95, 0).new_profile("dan", "Dan"),
    )
    .expect("post");
    e.post_signal(&path, SignalInput::new("t", "collaboration", 0.05, 0))
        .expect("post");

    let mut prev_high = 0.95;
    let mut prev_low = 0.05;
    for months in [1, 6, 24, 120] {
        let p = e.read_profile(&path, MONTH * months).expect("read").expect("present");
        let high = p.dimensions["honesty"].effective_score;
        let low = p.dimensions["collaboration"].effective_score;
        assert!(high < prev_high && high > NEUTRAL_SCORE);
        assert!(low > prev_low && low < NEUTRAL_SCORE);
        prev_high = high;
        prev_low = low;
    }
}

#[test]
fn decay_then_fuse_after_long_silence() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("eve.json");
    let e = engine(Arc::new(LockRegistry::new()));
    e.post_signal(
        &path,
        SignalInput::new("t", "reliability", 1.0, 0).new_profile("eve", "Eve"),
    )
    .expect("post");

    let now = MONTH * 12;
    let updated = e
        .post_signal(&path, SignalInput::new("t", "reliability", 1.0, now))
        .expect("post");
    let decayed = 0.5 + 0.5 * (-0.02f64 * 12.0).exp();
    assert!((updated.score - (0.15 + 0.85 * decayed)).abs() < 1e-9);
    assert_eq!(updated.last_signal, now);
}

#[test]
fn domain_competence_is_tracked_per_domain() {
    let tmp = tempdir().expect("tempdir");
    let ws = Workspace::init(tmp.path()).expect("init");
    let path = ws.profile_path("frank").expect("path");
    let e = ReputationEngine::for_workspace(&ws, Arc::new(LockRegistry::new()));

    e.post_signal(
        &path,
        SignalInput::new("contract", DOMAIN_COMPETENCE, 0.9, 1)
            .domain("frontend")
            .new_profile("frank", "Frank"),
    )
    .expect("post");
    e.post_signal(&path, SignalInput::new("contract", "domain-competence:backend", 0.3, 2))
        .expect("post");

    let p = e.read_profile(&path, 2).expect("read").expect("present");
    assert_eq!(p.domains.len(), 2);
    assert_eq!(p.domains["frontend"].stored.score, 0.9);
    assert_eq!(p.domains["backend"].stored.score, 0.3);
    assert!(p.dimensions.is_empty());
    assert_eq!(p.overall, NEUTRAL_SCORE);
}

#[test]
fn missing_identity_error_message() {
    let tmp = tempdir().expect("tempdir");
    let e = engine(Arc::new(LockRegistry::new()));
    let err = e
        .post_signal(
            &tmp.path().join("nobody.json"),
            SignalInput::new("t", "quality", 0.5, 0),
        )
        .expect_err("rejected");
    assert!(matches!(err, WorkspaceError::ValidationError(_)));
    assert!(err.to_string().contains("cannot create profile without identity"));
}

#[test]
fn posting_keeps_a_backup_of_the_previous_profile() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("gail.json");
    let e = engine(Arc::new(LockRegistry::new()));
    e.post_signal(
        &path,
        SignalInput::new("t", "quality", 0.6, 0).new_profile("gail", "Gail"),
    )
    .expect("post");
    e.post_signal(&path, SignalInput::new("t", "quality", 0.7, 1))
        .expect("post");

    let prior: Profile =
        agentws::core::atomic::load_json(&agentws::core::atomic::backup_path(&path, 0))
            .expect("load")
            .expect("backup present");
    assert_eq!(prior.signals.len(), 1);
}
