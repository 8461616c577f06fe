//! Quantified pool invariants, checked over randomized operation
//! sequences.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver};
use proptest::prelude::*;

use berth::config::PoolSettings;
use berth::metrics::StaticProcessMetricsCollector;
use berth::options::SpawnMethod;
use berth::pool::snapshot::{parse_xml, render_xml, PoolSnapshot};
use berth::{GetError, Options, Pool, Session, SpawnerConfig, SpawnerFactory};

const GROUPS: [&str; 3] = ["/srv/a", "/srv/b", "/srv/c"];

#[derive(Debug, Clone)]
enum Op {
    /// Request a session for one of the test groups.
    Get(usize),
    /// Close the oldest open session.
    CloseOldest,
    /// Detach the process backing the newest open session.
    DetachNewest,
    /// Raise the capacity.
    SetMax(usize),
    /// Run a garbage collection pass.
    Gc,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..GROUPS.len()).prop_map(Op::Get),
        3 => Just(Op::CloseOldest),
        1 => Just(Op::DetachNewest),
        1 => (2usize..6).prop_map(Op::SetMax),
        1 => Just(Op::Gc),
    ]
}

fn make_pool(max: usize) -> Arc<Pool> {
    let factory = SpawnerFactory {
        config: SpawnerConfig {
            dummy_concurrency: 1,
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

fn options_for(index: usize) -> Options {
    let mut options = Options::new(GROUPS[index]);
    options.spawn_method = SpawnMethod::Dummy;
    options
}

struct PendingGet {
    rx: Receiver<Result<Session, GetError>>,
}

/// Collect sessions from gets that have completed so far.
fn drain_pending(pending: &mut Vec<PendingGet>, open: &mut VecDeque<Session>) {
    pending.retain(|p| match p.rx.try_recv() {
        Ok(Ok(session)) => {
            open.push_back(session);
            false
        }
        Ok(Err(_)) => false,
        Err(channel::TryRecvError::Empty) => true,
        Err(channel::TryRecvError::Disconnected) => false,
    });
}

/// Close every open session and keep serving pending gets until nothing
/// is outstanding and no spawn is in flight.
fn settle(pool: &Arc<Pool>, pending: &mut Vec<PendingGet>, open: &mut VecDeque<Session>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        drain_pending(pending, open);
        while let Some(session) = open.pop_front() {
            session.close();
        }
        if pending.is_empty() && !pool.is_spawning() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("pool did not quiesce");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// The invariants of §the data model, checked on a consistent snapshot.
fn check_invariants(snapshot: &PoolSnapshot) {
    // Pool waiters exist only at full capacity, and only for apps with
    // no supergroup.
    if snapshot.get_wait_list_size > 0 {
        assert!(
            snapshot.utilization >= snapshot.max,
            "waiters parked below capacity: {snapshot:?}"
        );
    }
    if let Some(waiters) = &snapshot.get_wait_list {
        for name in waiters {
            assert!(
                !snapshot.supergroups.iter().any(|sg| &sg.name == name),
                "pool waiter for resident app {name}"
            );
        }
    }

    for sg in &snapshot.supergroups {
        for group in &sg.groups {
            let enabled = group
                .processes
                .iter()
                .filter(|p| p.enabled == "enabled" && p.life_status == "alive")
                .count();
            let disabling = group
                .processes
                .iter()
                .filter(|p| p.enabled == "disabling" && p.life_status == "alive")
                .count();
            assert_eq!(group.enabled_process_count, enabled, "enabled count mirror");
            assert_eq!(
                group.disabling_process_count, disabling,
                "disabling count mirror"
            );

            for process in &group.processes {
                if process.concurrency > 0 {
                    assert!(
                        process.sessions <= process.concurrency,
                        "sessions within concurrency"
                    );
                }
                let socket_sessions: u32 =
                    process.sockets.iter().map(|s| s.sessions).sum();
                assert_eq!(
                    socket_sessions, process.sessions,
                    "socket sessions sum to process sessions"
                );
                // The advertised utilization matches the ladder.
                let expected = if process.concurrency == 0 {
                    u64::from(process.sessions.min(1))
                } else {
                    u64::from(process.sessions) * (i32::MAX as u64)
                        / u64::from(process.concurrency)
                };
                assert_eq!(process.utilization, expected, "utilization key");
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn pool_invariants_hold_over_random_operations(
        ops in proptest::collection::vec(op_strategy(), 1..16)
    ) {
        let pool = make_pool(3);
        let mut open: VecDeque<Session> = VecDeque::new();
        let mut pending: Vec<PendingGet> = Vec::new();

        for op in ops {
            match op {
                Op::Get(index) => {
                    let (tx, rx) = channel::bounded(1);
                    pool.async_get(&options_for(index), Box::new(move |outcome| {
                        let _ = tx.send(outcome);
                    }));
                    pending.push(PendingGet { rx });
                }
                Op::CloseOldest => {
                    drain_pending(&mut pending, &mut open);
                    if let Some(session) = open.pop_front() {
                        session.close();
                    }
                }
                Op::DetachNewest => {
                    drain_pending(&mut pending, &mut open);
                    if let Some(session) = open.back() {
                        let gupid = session.gupid().to_string();
                        pool.detach_process(&gupid);
                    }
                }
                Op::SetMax(max) => pool.set_max(max),
                Op::Gc => pool.run_gc_pass(),
            }
            drain_pending(&mut pending, &mut open);
            check_invariants(&pool.snapshot(true));
        }

        // Release everything so queued gets and spawns can finish, then
        // verify the quiescent state.
        settle(&pool, &mut pending, &mut open);

        let snapshot = pool.snapshot(true);
        check_invariants(&snapshot);
        prop_assert!(!pool.is_spawning(), "no spawn in flight after quiescence");

        // The XML snapshot round-trips losslessly.
        let parsed = parse_xml(&render_xml(&snapshot)).expect("own xml parses");
        prop_assert_eq!(parsed, snapshot);

        pool.destroy();
    }
}

#[test]
fn xml_of_a_live_pool_round_trips() {
    let pool = make_pool(4);
    let (tx, rx) = channel::bounded(1);
    pool.async_get(
        &options_for(0),
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
    );
    let session = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("get completes")
        .expect("session");

    let snapshot = pool.snapshot(true);
    let parsed = parse_xml(&render_xml(&snapshot)).expect("parses");
    assert_eq!(parsed, snapshot);

    // Without secrets the structural counters still round-trip.
    let public = pool.snapshot(false);
    assert!(public.get_wait_list.is_none());
    let parsed = parse_xml(&render_xml(&public)).expect("parses");
    assert_eq!(parsed, public);

    session.close();
    pool.destroy();
}
