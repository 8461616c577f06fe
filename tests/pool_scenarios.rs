//! End-to-end pool scenarios against the dummy spawner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;

use berth::config::PoolSettings;
use berth::metrics::StaticProcessMetricsCollector;
use berth::options::SpawnMethod;
use berth::pool::snapshot::PoolSnapshot;
use berth::{GetError, Options, Pool, Session, SpawnerConfig, SpawnerFactory};

fn make_pool(max: usize, concurrency: u32) -> Arc<Pool> {
    let factory = SpawnerFactory {
        config: SpawnerConfig {
            dummy_concurrency: concurrency,
            ..SpawnerConfig::default()
        },
        ..SpawnerFactory::default()
    };
    Pool::with_collector(
        PoolSettings {
            max,
            max_idle_time_secs: 300,
        },
        factory,
        Arc::new(StaticProcessMetricsCollector { alive: Vec::new() }),
    )
}

fn dummy_options(app_root: &str, group: &str) -> Options {
    let mut options = Options::new(app_root);
    options.app_group_name = group.to_string();
    options.spawn_method = SpawnMethod::Dummy;
    options
}

/// Issue an async get and wait for its callback.
fn get_session(pool: &Arc<Pool>, options: &Options) -> Result<Session, GetError> {
    let (tx, rx) = channel::bounded(1);
    pool.async_get(
        options,
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
    );
    rx.recv_timeout(Duration::from_secs(5))
        .expect("get must complete")
}

/// Issue an async get that is expected to park; returns the receiver.
fn get_parked(
    pool: &Arc<Pool>,
    options: &Options,
) -> channel::Receiver<Result<Session, GetError>> {
    let (tx, rx) = channel::bounded(1);
    pool.async_get(
        options,
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
    );
    rx
}

fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

fn group_snapshot(snapshot: &PoolSnapshot, name: &str) -> berth::pool::snapshot::GroupSnapshot {
    snapshot
        .supergroups
        .iter()
        .find(|sg| sg.name == name)
        .unwrap_or_else(|| panic!("supergroup {name} missing"))
        .groups
        .first()
        .expect("default group")
        .clone()
}

#[test]
fn s1_single_group_routing() {
    let pool = make_pool(2, 4);
    let options = dummy_options("/a", "A");

    let session = get_session(&pool, &options).expect("spawn and checkout");
    assert_eq!(pool.process_count(), 1);
    assert_eq!(pool.supergroup_count(), 1);

    let snapshot = pool.snapshot(true);
    let group = group_snapshot(&snapshot, "A");
    assert_eq!(group.enabled_process_count, 1);
    assert_eq!(group.processes[0].sessions, 1);
    let spawn_end = group.processes[0].spawn_end_time;

    session.close();
    let snapshot = pool.snapshot(true);
    let group = group_snapshot(&snapshot, "A");
    assert_eq!(group.processes[0].sessions, 0);
    assert_eq!(group.processes[0].enabled, "enabled");
    assert!(group.processes[0].last_used >= spawn_end);
    assert_eq!(group.processes[0].processed, 1);

    let report = pool.inspect(&berth::pool::snapshot::InspectOptions::default());
    assert!(report.contains("Max pool size : 2"));
    assert!(report.contains("A#default:"));

    pool.destroy();
}

#[test]
fn s2_pool_full_oldest_idle_evicted() {
    let pool = make_pool(2, 1);
    let options_a = dummy_options("/a", "A");
    let options_b = dummy_options("/b", "B");

    // A is used first, so its process has the older last_used.
    get_session(&pool, &options_a).expect("A spawns").close();
    std::thread::sleep(Duration::from_millis(2));
    get_session(&pool, &options_b).expect("B spawns").close();
    assert_eq!(pool.process_count(), 2);
    assert!(pool.at_full_capacity());

    let session = get_session(&pool, &dummy_options("/c", "C")).expect("C evicts and spawns");
    assert_eq!(session.app_group_name(), "C");
    session.close();

    wait_until(|| pool.process_count() == 2, "eviction to settle");
    let snapshot = pool.snapshot(true);
    let names: Vec<&str> = snapshot
        .supergroups
        .iter()
        .map(|sg| sg.name.as_str())
        .collect();
    assert!(names.contains(&"C"));
    // The supergroup of the evicted process sticks around with an empty
    // group; the oldest idle process (A's) is the one that went away.
    let group_a = group_snapshot(&snapshot, "A");
    assert_eq!(group_a.enabled_process_count, 0);
    let group_b = group_snapshot(&snapshot, "B");
    assert_eq!(group_b.enabled_process_count, 1);

    pool.destroy();
}

#[test]
fn s3_pool_full_no_idle_parks_until_capacity_frees() {
    let pool = make_pool(2, 1);
    let session_a = get_session(&pool, &dummy_options("/a", "A")).expect("A spawns");
    let session_b = get_session(&pool, &dummy_options("/b", "B")).expect("B spawns");

    // Both processes are busy; C cannot evict anything and parks on the
    // pool wait list.
    let mut options_c = dummy_options("/c", "C");
    options_c.allow_trashing_non_idle_processes = false;
    let parked = get_parked(&pool, &options_c);
    wait_until(|| pool.get_wait_list_size() == 1, "C to park");
    assert!(
        parked.try_recv().is_err(),
        "C must not be served while the pool is full and busy"
    );
    assert_eq!(pool.supergroup_count(), 2);

    // A session closes: the now-idle process is detached to free
    // capacity and C's supergroup is created.
    session_a.close();
    let outcome = parked
        .recv_timeout(Duration::from_secs(5))
        .expect("C served after capacity freed");
    let session_c = outcome.expect("C gets a session");
    assert_eq!(session_c.app_group_name(), "C");
    assert_eq!(pool.get_wait_list_size(), 0);

    session_b.close();
    session_c.close();
    pool.destroy();
}

#[test]
fn s4_disable_drains_then_succeeds() {
    let pool = make_pool(4, 2);
    let options = dummy_options("/a", "A");

    let session_1 = get_session(&pool, &options).expect("spawn");
    let session_2 = get_session(&pool, &options).expect("second session, same process");
    assert_eq!(pool.process_count(), 1);
    let gupid = session_1.gupid().to_string();
    assert_eq!(session_2.gupid(), gupid);

    // The disable defers while sessions are open; run it on a side
    // thread because the pool API blocks until the drain completes.
    let disable_pool = Arc::clone(&pool);
    let disable_gupid = gupid.clone();
    let disable = std::thread::spawn(move || disable_pool.disable_process(&disable_gupid));
    wait_until(
        || {
            let snapshot = pool.snapshot(true);
            group_snapshot(&snapshot, "A").disabling_process_count == 1
        },
        "process to start disabling",
    );
    assert!(!disable.is_finished(), "disable must wait for the drain");

    session_1.close();
    session_2.close();
    let result = disable.join().expect("disable thread");
    assert_eq!(result, berth::DisableResult::Success);

    // Disabling the only process spawned a replacement.
    wait_until(
        || {
            let snapshot = pool.snapshot(true);
            let group = group_snapshot(&snapshot, "A");
            group.enabled_process_count == 1 && group.disabled_process_count == 1
        },
        "replacement spawn and disabled process",
    );

    pool.destroy();
}

#[test]
fn s5_spawn_failure_reaches_all_waiters() {
    let pool = make_pool(2, 1);
    let mut options = dummy_options("/a", "A");
    options.raise_internal_error = true;

    let err = get_session(&pool, &options).expect_err("spawn fails");
    match err {
        GetError::Spawn(spawn_err) => {
            assert_eq!(spawn_err.kind, berth::SpawnErrorKind::InternalError);
        }
        other => panic!("expected a spawn error, got {other:?}"),
    }

    // The group survives with its prior (empty) state and nothing keeps
    // spawning.
    wait_until(|| !pool.is_spawning(), "spawning to stop");
    let snapshot = pool.snapshot(true);
    let group = group_snapshot(&snapshot, "A");
    assert_eq!(group.enabled_process_count, 0);
    assert_eq!(group.get_wait_list_size, 0);

    // Other applications are unaffected.
    get_session(&pool, &dummy_options("/b", "B"))
        .expect("healthy group spawns")
        .close();

    pool.destroy();
}

#[test]
fn s6_gc_detaches_only_the_idle_process() {
    let pool = make_pool(4, 1);
    let options = dummy_options("/a", "A");

    // Two processes: occupy the first so the second spawns.
    let session_1 = get_session(&pool, &options).expect("first process");
    let session_2 = get_session(&pool, &options).expect("second process");
    let busy_gupid = session_1.gupid().to_string();
    assert_eq!(pool.process_count(), 2);
    session_2.close();
    session_1.close();

    pool.set_max_idle_time(100_000); // 100ms
    std::thread::sleep(Duration::from_millis(150));
    // Touch the first process so only the second has been idle past the
    // limit.
    get_session(&pool, &options).expect("touch").close();

    pool.run_gc_pass();
    let snapshot = pool.snapshot(true);
    let group = group_snapshot(&snapshot, "A");
    assert_eq!(group.enabled_process_count, 1, "exactly one process reaped");
    assert_eq!(group.processes[0].gupid, busy_gupid);
    assert!(!pool.is_spawning(), "at min_processes, no respawn");

    pool.destroy();
}

#[test]
fn s7_restart_drains_old_processes_and_spawns_new() {
    let pool = make_pool(6, 1);
    let options = dummy_options("/a", "A");

    // Two busy processes (concurrency 1, so the second get forces a
    // second spawn).
    let session_1 = get_session(&pool, &options).expect("first");
    let session_2 = get_session(&pool, &options).expect("second");
    let old_gupids = vec![session_1.gupid().to_string(), session_2.gupid().to_string()];
    assert_ne!(old_gupids[0], old_gupids[1]);

    assert_eq!(pool.restart_groups_by_app_root("/a"), 1);
    wait_until(
        || {
            let snapshot = pool.snapshot(true);
            let group = group_snapshot(&snapshot, "A");
            !group.restarting && group.enabled_process_count == 1
        },
        "restart to finalize and replacement to spawn",
    );

    let snapshot = pool.snapshot(true);
    let group = group_snapshot(&snapshot, "A");
    assert!(group.disabling_process_count >= 1, "old processes draining");
    let new_process = group
        .processes
        .iter()
        .find(|p| p.enabled == "enabled")
        .expect("new enabled process");
    assert!(
        !old_gupids.contains(&new_process.gupid),
        "the enabled process is a fresh one"
    );

    // Draining completes as the old sessions close.
    session_1.close();
    session_2.close();
    wait_until(
        || {
            let snapshot = pool.snapshot(true);
            let group = group_snapshot(&snapshot, "A");
            group.disabling_process_count == 0
        },
        "old processes to detach after drain",
    );

    pool.destroy();
}

#[test]
fn no_op_get_reserves_a_group() {
    let pool = make_pool(2, 1);
    let mut options = dummy_options("/a", "A");
    options.no_op = true;

    let session = get_session(&pool, &options).expect("no-op get");
    assert!(session.is_no_op());
    assert_eq!(pool.supergroup_count(), 1);
    assert_eq!(pool.process_count(), 0, "no worker spawned for no-op");
    drop(session);

    pool.destroy();
}

#[test]
fn find_or_create_group_reserves_past_capacity() {
    let pool = make_pool(1, 1);
    let session = get_session(&pool, &dummy_options("/a", "A")).expect("A fills the pool");
    pool.find_or_create_group(&dummy_options("/b", "B"))
        .expect("B reserved regardless of capacity");
    assert_eq!(pool.supergroup_count(), 2);
    session.close();
    pool.destroy();
}

#[test]
fn detach_supergroup_aborts_waiters() {
    let pool = make_pool(1, 1);
    let session = get_session(&pool, &dummy_options("/a", "A")).expect("A spawns");

    // A second request for A parks on the group (the process is full).
    let parked = get_parked(&pool, &dummy_options("/a", "A"));
    wait_until(
        || group_snapshot(&pool.snapshot(true), "A").get_wait_list_size == 1,
        "second request to park on the group",
    );

    // Detaching A aborts the parked waiter. The open session keeps the
    // teardown draining until it closes, so close it from a side thread.
    let closer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        session.close();
    });
    assert!(pool.detach_supergroup_by_name("A"));
    closer.join().expect("closer thread");

    let outcome = parked
        .recv_timeout(Duration::from_secs(5))
        .expect("waiter hears about the detach");
    assert!(matches!(outcome, Err(GetError::Aborted(_))));
    assert_eq!(pool.supergroup_count(), 0);

    pool.destroy();
}

#[test]
fn analytics_pass_detaches_vanished_processes() {
    // The static collector reports nothing alive; dummy processes are
    // skipped by the vanished check, so use a collector that knows the
    // pids and then forget them.
    let pool = make_pool(2, 1);
    let session = get_session(&pool, &dummy_options("/a", "A")).expect("spawn");
    session.close();

    // Dummy processes have no OS process, so the analytics pass must not
    // detach them just because the collector cannot see them.
    pool.run_analytics_pass();
    assert_eq!(pool.process_count(), 1);

    pool.destroy();
}

#[test]
fn session_initiate_failure_detaches_the_process() {
    let pool = make_pool(2, 2);
    let session = get_session(&pool, &dummy_options("/a", "A")).expect("spawn");
    assert_eq!(pool.process_count(), 1);
    let broken_gupid = session.gupid().to_string();

    session.initiate_failed();
    // The broken process is detached at once; being below min_processes,
    // the group spawns a fresh replacement.
    wait_until(
        || {
            let group = group_snapshot(&pool.snapshot(true), "A");
            !pool.is_spawning()
                && group.enabled_process_count == 1
                && group.processes.iter().all(|p| p.gupid != broken_gupid)
        },
        "broken process replaced",
    );

    pool.destroy();
}

#[test]
fn out_of_band_work_disables_then_restores_the_process() {
    let pool = make_pool(4, 2);
    let options = dummy_options("/a", "A");
    let session = get_session(&pool, &options).expect("spawn");
    let gupid = session.gupid().to_string();
    session.close();

    assert!(pool.request_oobw(&gupid));
    // The worker is disabled (a replacement spawns because it was the
    // only process), the exchange runs (skipped for dummies), and the
    // worker returns to service.
    wait_until(
        || {
            let snapshot = pool.snapshot(true);
            let group = group_snapshot(&snapshot, "A");
            group
                .processes
                .iter()
                .any(|p| p.gupid == gupid && p.enabled == "enabled")
                && !pool.is_spawning()
        },
        "oobw cycle to restore the process",
    );

    assert!(!pool.request_oobw("no-such-gupid"));
    pool.destroy();
}

#[test]
fn set_max_increase_serves_pool_waiters() {
    let pool = make_pool(1, 1);
    let session_a = get_session(&pool, &dummy_options("/a", "A")).expect("A spawns");

    let parked = get_parked(&pool, &dummy_options("/b", "B"));
    wait_until(|| pool.get_wait_list_size() == 1, "B to park");

    pool.set_max(2);
    let outcome = parked
        .recv_timeout(Duration::from_secs(5))
        .expect("B served after capacity increase");
    let session_b = outcome.expect("B session");
    assert_eq!(session_b.app_group_name(), "B");

    session_a.close();
    session_b.close();
    pool.destroy();
}
