//! The pool: global admission, capacity accounting, and background loops.
//!
//! One mutex serializes every mutation and every consistent read of
//! pool/supergroup/group/process state. Background work runs on:
//! - one garbage-collector thread (idle processes, idle preloaders),
//! - one analytics thread (process metrics, vanished-process detection),
//! - a transient thread per in-flight spawn, restart finalization,
//!   supergroup initialization and out-of-band work exchange.
//!
//! Every public method follows the same shape: take the lock, mutate,
//! collect post-lock actions and group tasks, verify invariants, release
//! the lock, run the actions.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::PoolSettings;
use crate::metrics::{self, ProcessMetricsCollector, PsProcessMetricsCollector};
use crate::options::Options;
use crate::pool::clock;
use crate::pool::group::{GetResult, Group, GroupCtx, GroupTask, SessionCloseOutcome, SpawnTask};
use crate::pool::process::{LifeStatus, SocketAddress};
use crate::pool::session::Session;
use crate::pool::snapshot::{self, InspectOptions, PoolSnapshot};
use crate::pool::supergroup::{SuperGroup, SuperGroupState};
use crate::pool::{
    run_post_lock_actions, DisableResult, GetCallback, GetError, GetWaiter, PostLockActions,
    ShutdownResult, Ticket,
};
use crate::spawn::SpawnerFactory;

/// How long the garbage collector sleeps when it has no deadline to aim
/// for.
const GC_DEFAULT_SLEEP_USEC: u64 = 5_000_000;

/// Cadence of the analytics pass, aligned to second boundaries so that
/// wakeups across the host coalesce.
const ANALYTICS_INTERVAL_USEC: u64 = 4_000_000;

/// Pool-wide facts snapshotted before entering group methods.
struct Facts {
    now: u64,
    full: bool,
    has_waiters: bool,
    another_waiting: bool,
}

pub(crate) struct PoolInner {
    supergroups: BTreeMap<String, SuperGroup>,
    /// Detached supergroups still draining sessions; removed once every
    /// group reports shut down.
    detached_supergroups: Vec<SuperGroup>,
    /// `get` requests that could not be routed: their supergroup does not
    /// exist and the pool is at capacity with nothing evictable.
    get_waitlist: VecDeque<GetWaiter>,
    max: usize,
    max_idle_time: u64,
    life_status: LifeStatus,
    supergroup_generation: u64,
    background_threads: Vec<JoinHandle<()>>,
}

impl PoolInner {
    fn utilization(&self) -> usize {
        self.supergroups.values().map(SuperGroup::utilization).sum()
    }

    fn at_full_capacity(&self) -> bool {
        self.utilization() >= self.max
    }

    fn process_count(&self) -> usize {
        self.supergroups
            .values()
            .map(SuperGroup::process_count)
            .sum()
    }

    fn is_spawning(&self) -> bool {
        self.supergroups
            .values()
            .flat_map(|sg| sg.groups.iter())
            .any(Group::spawning)
    }

    fn another_group_is_waiting_for_capacity(&self, except_app_group: Option<&str>) -> bool {
        self.supergroups.iter().any(|(name, sg)| {
            except_app_group != Some(name.as_str())
                && sg.groups.iter().any(Group::is_waiting_for_capacity)
        })
    }

    /// App group name of the group owning `gupid`, searching active
    /// supergroups only.
    fn app_group_of_gupid(&self, gupid: &str) -> Option<String> {
        self.supergroups.iter().find_map(|(name, sg)| {
            sg.groups
                .iter()
                .any(|group| group.find_process(gupid).is_some())
                .then(|| name.clone())
        })
    }

    /// Oldest idle enabled process across all groups, if any.
    fn find_oldest_idle_process(&self) -> Option<(String, String)> {
        self.enabled_processes()
            .filter(|(_, process)| process.utilization() == 0)
            .min_by_key(|(_, process)| process.last_used)
            .map(|(name, process)| (name, process.gupid.clone()))
    }

    /// Least recently used enabled process, idle or not.
    fn find_best_process_to_trash(&self) -> Option<(String, String)> {
        self.enabled_processes()
            .min_by_key(|(_, process)| process.last_used)
            .map(|(name, process)| (name, process.gupid.clone()))
    }

    fn enabled_processes(
        &self,
    ) -> impl Iterator<Item = (String, &crate::pool::process::Process)> {
        self.supergroups.iter().flat_map(|(name, sg)| {
            sg.groups.iter().flat_map(move |group| {
                group
                    .enabled
                    .iter()
                    .map(move |process| (name.clone(), process))
            })
        })
    }

    fn debug_verify(&self) {
        if !self.get_waitlist.is_empty() {
            debug_assert!(
                self.at_full_capacity(),
                "pool wait list implies full capacity"
            );
        }
        for waiter in &self.get_waitlist {
            debug_assert!(
                !self.supergroups.contains_key(waiter.options.app_group_name()),
                "pool wait list entries have no supergroup"
            );
        }
        for sg in self.supergroups.values() {
            sg.debug_verify();
        }
    }
}

pub struct Pool {
    inner: Mutex<PoolInner>,
    gc_cond: Condvar,
    analytics_gate: Mutex<()>,
    analytics_cond: Condvar,
    shutting_down: AtomicBool,
    factory: SpawnerFactory,
    collector: Arc<dyn ProcessMetricsCollector>,
    weak_self: Weak<Pool>,
}

impl Pool {
    /// Create a pool. Background threads are not started until
    /// [`Pool::start_background_threads`].
    pub fn new(settings: PoolSettings, factory: SpawnerFactory) -> Arc<Pool> {
        Self::with_collector(settings, factory, Arc::new(PsProcessMetricsCollector))
    }

    pub fn with_collector(
        settings: PoolSettings,
        factory: SpawnerFactory,
        collector: Arc<dyn ProcessMetricsCollector>,
    ) -> Arc<Pool> {
        Arc::new_cyclic(|weak| Pool {
            inner: Mutex::new(PoolInner {
                supergroups: BTreeMap::new(),
                detached_supergroups: Vec::new(),
                get_waitlist: VecDeque::new(),
                max: settings.max,
                max_idle_time: settings.max_idle_time_secs * 1_000_000,
                life_status: LifeStatus::Alive,
                supergroup_generation: 0,
                background_threads: Vec::new(),
            }),
            gc_cond: Condvar::new(),
            analytics_gate: Mutex::new(()),
            analytics_cond: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            factory,
            collector,
            weak_self: weak.clone(),
        })
    }

    /// Start the garbage collector and analytics threads.
    pub fn start_background_threads(self: &Arc<Self>) {
        let mut inner = self.lock();
        let gc_pool = Arc::clone(self);
        let gc = std::thread::Builder::new()
            .name("pool garbage collector".to_string())
            .spawn(move || gc_pool.garbage_collector_loop())
            .expect("spawn gc thread");
        let analytics_pool = Arc::clone(self);
        let analytics = std::thread::Builder::new()
            .name("pool analytics collector".to_string())
            .spawn(move || analytics_pool.analytics_loop())
            .expect("spawn analytics thread");
        inner.background_threads.push(gc);
        inner.background_threads.push(analytics);
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("pool mutex poisoned")
    }

    fn facts(&self, inner: &PoolInner, except_app_group: Option<&str>) -> Facts {
        Facts {
            now: clock::now_usec(),
            full: inner.at_full_capacity(),
            has_waiters: !inner.get_waitlist.is_empty(),
            another_waiting: inner.another_group_is_waiting_for_capacity(except_app_group),
        }
    }

    fn ctx<'a>(&'a self, facts: &Facts) -> GroupCtx<'a> {
        GroupCtx {
            now: facts.now,
            pool: &self.weak_self,
            pool_at_full_capacity: facts.full,
            pool_has_waiters: facts.has_waiters,
            another_group_waiting: facts.another_waiting,
        }
    }

    // ----- get -----------------------------------------------------------

    /// Admit a `get` request. Never blocks: the callback fires later from
    /// a post-lock action, possibly on another thread.
    pub fn async_get(self: &Arc<Self>, options: &Options, callback: GetCallback) {
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();
        {
            let mut inner = self.lock();
            if inner.life_status != LifeStatus::Alive {
                actions.push(Box::new(move || callback(Err(GetError::ShuttingDown))));
            } else {
                self.async_get_locked(&mut inner, options, callback, &mut actions, &mut tasks);
                self.process_tasks(&mut inner, tasks, &mut actions);
                inner.debug_verify();
            }
        }
        run_post_lock_actions(actions);
    }

    fn async_get_locked(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        options: &Options,
        callback: GetCallback,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) {
        let name = options.app_group_name().to_string();
        tracing::trace!(app_group = %name, "async_get");

        if inner.supergroups.contains_key(&name) {
            let facts = self.facts(inner, None);
            let ctx = self.ctx(&facts);
            let sg = inner.supergroups.get_mut(&name).expect("checked above");
            match sg.get(options, callback, &ctx, actions, tasks) {
                GetResult::CheckedOut(session, callback) => {
                    actions.push(Box::new(move || callback(Ok(session))));
                }
                GetResult::Queued => {}
            }
        } else if !inner.at_full_capacity() {
            self.create_supergroup_and_get(inner, options, callback, actions, tasks);
        } else {
            // Pool full and the app is not resident: evict the oldest
            // idle process, optionally the least recently used busy one,
            // or park the caller.
            let victim = inner.find_oldest_idle_process().or_else(|| {
                if options.allow_trashing_non_idle_processes {
                    inner.find_best_process_to_trash()
                } else {
                    None
                }
            });
            match victim {
                None => {
                    tracing::debug!(
                        app_group = %name,
                        "pool full with nothing evictable, parking request"
                    );
                    inner
                        .get_waitlist
                        .push_back(GetWaiter::new(options.clone(), callback));
                }
                Some((victim_app_group, gupid)) => {
                    tracing::debug!(
                        app_group = %name,
                        victim = %gupid,
                        "pool full, evicting a process to make room"
                    );
                    let sg = inner
                        .supergroups
                        .get_mut(&victim_app_group)
                        .expect("victim supergroup exists");
                    for group in &mut sg.groups {
                        if group.detach_by_gupid(&gupid, actions) {
                            break;
                        }
                    }
                    self.create_supergroup_and_get(inner, options, callback, actions, tasks);
                }
            }
        }
    }

    /// Synchronous `get`: block on a ticket until the callback fires.
    pub fn get(
        self: &Arc<Self>,
        options: &Options,
        ticket: &Arc<Ticket>,
    ) -> Result<Session, GetError> {
        let slot = Arc::clone(ticket);
        self.async_get(options, Box::new(move |outcome| slot.fulfill(outcome)));
        ticket.wait()
    }

    /// Reserve a group for an application without checking out a session,
    /// creating its supergroup regardless of capacity limits.
    pub fn find_or_create_group(self: &Arc<Self>, options: &Options) -> Result<(), GetError> {
        {
            let mut inner = self.lock();
            let name = options.app_group_name().to_string();
            if !inner.supergroups.contains_key(&name) {
                let mut actions = PostLockActions::new();
                self.create_supergroup(&mut inner, options, &mut actions);
                drop(inner);
                run_post_lock_actions(actions);
            }
        }
        let mut no_op = options.clone();
        no_op.no_op = true;
        let ticket = Ticket::new();
        self.get(&no_op, &ticket).map(|_session| ())
    }

    fn create_supergroup(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        options: &Options,
        actions: &mut PostLockActions,
    ) -> String {
        inner.supergroup_generation += 1;
        let generation = inner.supergroup_generation;
        let sg = SuperGroup::new(options.clone(), generation);
        let name = sg.name.clone();
        inner.supergroups.insert(name.clone(), sg);

        // Initialization completes on a transient thread, keeping the
        // INITIALIZING state observable and this critical section short.
        let pool = Arc::clone(self);
        let thread_name = name.clone();
        actions.push(Box::new(move || {
            let result = std::thread::Builder::new()
                .name(format!("supergroup init: {thread_name}"))
                .spawn(move || pool.finalize_supergroup_initialization(&thread_name, generation));
            if let Err(err) = result {
                tracing::error!("could not start supergroup init thread: {err}");
            }
        }));
        name
    }

    fn create_supergroup_and_get(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        options: &Options,
        callback: GetCallback,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) {
        let name = self.create_supergroup(inner, options, actions);
        let facts = self.facts(inner, None);
        let ctx = self.ctx(&facts);
        let sg = inner.supergroups.get_mut(&name).expect("just inserted");
        // The supergroup is still initializing, so the caller lands on
        // its wait list.
        match sg.get(options, callback, &ctx, actions, tasks) {
            GetResult::Queued => {}
            GetResult::CheckedOut(..) => unreachable!("initializing supergroup cannot serve"),
        }
    }

    fn finalize_supergroup_initialization(self: &Arc<Self>, name: &str, generation: u64) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let ready = match inner.supergroups.get_mut(name) {
                Some(sg)
                    if sg.generation == generation
                        && sg.state == SuperGroupState::Initializing =>
                {
                    Some(sg.promote_to_ready(&self.factory))
                }
                _ => None,
            };
            let Some(waiters) = ready else {
                return;
            };
            let mut tasks = Vec::new();
            for waiter in waiters {
                let facts = self.facts(&inner, None);
                let ctx = self.ctx(&facts);
                let sg = inner.supergroups.get_mut(name).expect("still present");
                match sg.get(&waiter.options, waiter.callback, &ctx, &mut actions, &mut tasks) {
                    GetResult::CheckedOut(session, callback) => {
                        actions.push(Box::new(move || callback(Ok(session))));
                    }
                    GetResult::Queued => {}
                }
            }
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
    }

    // ----- re-dispatch passes -------------------------------------------

    /// Walk the pool wait list: route waiters whose supergroup appeared,
    /// create supergroups while capacity allows, keep the rest parked.
    /// Called after any event that frees capacity.
    fn assign_sessions_to_get_waiters_locked(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) {
        let waiters = std::mem::take(&mut inner.get_waitlist);
        let mut remaining = VecDeque::new();
        for waiter in waiters {
            let name = waiter.options.app_group_name().to_string();
            if inner.supergroups.contains_key(&name) {
                let facts = self.facts(inner, None);
                let ctx = self.ctx(&facts);
                let sg = inner.supergroups.get_mut(&name).expect("checked above");
                match sg.get(&waiter.options, waiter.callback, &ctx, actions, tasks) {
                    GetResult::CheckedOut(session, callback) => {
                        actions.push(Box::new(move || callback(Ok(session))));
                    }
                    GetResult::Queued => {}
                }
            } else if !inner.at_full_capacity() {
                self.create_supergroup_and_get(inner, &waiter.options, waiter.callback, actions, tasks);
            } else {
                remaining.push_back(waiter);
            }
        }
        inner.get_waitlist = remaining;
    }

    /// Trigger spawns for groups stalled on capacity, then for groups
    /// below their minimum, until the pool fills up.
    fn possibly_spawn_more_processes_locked(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        tasks: &mut Vec<GroupTask>,
    ) {
        let names: Vec<String> = inner.supergroups.keys().cloned().collect();
        for name in &names {
            if inner.at_full_capacity() {
                return;
            }
            let sg = inner.supergroups.get_mut(name).expect("name collected");
            for group in &mut sg.groups {
                if group.is_waiting_for_capacity() {
                    tracing::debug!(group = %group.name, "group is waiting for capacity");
                    group.trigger_spawn_for_pool(tasks);
                }
            }
        }
        for name in &names {
            if inner.at_full_capacity() {
                return;
            }
            let facts = self.facts(inner, None);
            let ctx = self.ctx(&facts);
            let sg = inner.supergroups.get_mut(name).expect("name collected");
            for group in &mut sg.groups {
                if group.should_spawn(&ctx) {
                    tracing::debug!(group = %group.name, "group requests another process");
                    group.trigger_spawn_for_pool(tasks);
                }
            }
        }
    }

    // ----- group task orchestration -------------------------------------

    /// Convert group-emitted tasks into threads and follow-up work. Runs
    /// under the lock; the launched work itself happens post-lock.
    fn process_tasks(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        tasks: Vec<GroupTask>,
        actions: &mut PostLockActions,
    ) {
        let mut queue: VecDeque<GroupTask> = tasks.into();
        while let Some(task) = queue.pop_front() {
            match task {
                GroupTask::Spawn(task) => {
                    let pool = Arc::clone(self);
                    actions.push(Box::new(move || {
                        let result = std::thread::Builder::new()
                            .name(format!("spawn loop: {}", task.app_group_name))
                            .spawn(move || pool.run_spawn_loop(task));
                        if let Err(err) = result {
                            tracing::error!("could not start spawn thread: {err}");
                        }
                    }));
                }
                GroupTask::FinalizeRestart {
                    app_group_name,
                    options,
                } => {
                    let pool = Arc::clone(self);
                    actions.push(Box::new(move || {
                        let result = std::thread::Builder::new()
                            .name(format!("group restarter: {app_group_name}"))
                            .spawn(move || pool.finalize_restart(&app_group_name, options));
                        if let Err(err) = result {
                            tracing::error!("could not start restart thread: {err}");
                        }
                    }));
                }
                GroupTask::OobwCheck {
                    app_group_name,
                    gupid,
                } => {
                    self.oobw_check_locked(inner, &app_group_name, &gupid, actions, &mut queue);
                }
            }
        }
    }

    // ----- spawn loop ----------------------------------------------------

    /// Body of a spawn worker thread: spawn, apply under the lock, repeat
    /// until the group is satisfied or the pool is full.
    fn run_spawn_loop(self: &Arc<Self>, task: SpawnTask) {
        loop {
            let started = std::time::Instant::now();
            let result = task.spawner.spawn(&task.options);
            match &result {
                Ok(_) => metrics::spawn_ok(started.elapsed()),
                Err(_) => metrics::spawn_err(started.elapsed()),
            }

            let mut actions = PostLockActions::new();
            let keep_going = {
                let mut inner = self.lock();
                let mut tasks = Vec::new();
                let keep_going =
                    self.apply_spawn_result(&mut inner, &task, result, &mut actions, &mut tasks);
                self.process_tasks(&mut inner, tasks, &mut actions);
                inner.debug_verify();
                keep_going
            };
            run_post_lock_actions(actions);
            if !keep_going {
                break;
            }
        }
    }

    fn apply_spawn_result(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        task: &SpawnTask,
        result: Result<crate::pool::process::Process, crate::spawn::SpawnError>,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) -> bool {
        let name = &task.app_group_name;
        let valid = inner.supergroups.get(name).is_some_and(|sg| {
            sg.default_group().is_some_and(|group| {
                group.is_alive() && group.restarts_initiated == task.restarts_initiated
            })
        });
        if !valid {
            match result {
                Ok(process) => {
                    tracing::debug!(
                        app_group = %name,
                        "group vanished or restarted, dropping freshly spawned process"
                    );
                    actions.push(Box::new(process.into_shutdown_closure()));
                }
                Err(err) => {
                    tracing::debug!(
                        app_group = %name,
                        "group vanished or restarted, ignoring spawn failure: {err}"
                    );
                }
            }
            return false;
        }

        let mut failed = false;
        match result {
            Ok(process) => {
                let sg = inner.supergroups.get_mut(name).expect("validated");
                let group = sg.default_group_mut().expect("validated");
                group.attach(process, actions);
                tracing::debug!(
                    group = %group.name,
                    enabled = group.enabled_count(),
                    waiters = group.get_waitlist_size(),
                    "spawn completed"
                );
            }
            Err(err) => {
                failed = true;
                let err = Arc::new(err);
                let sg = inner.supergroups.get_mut(name).expect("validated");
                let group = sg.default_group_mut().expect("validated");
                tracing::error!(group = %group.name, "could not spawn process: {err}");
                if group.enabled_count() == 0 {
                    group.enable_all_disabling(actions);
                }
                group.assign_error_to_get_waiters(&err, actions);
            }
        }

        // Serve group waiters from the new capacity.
        if !failed {
            let facts = self.facts(inner, None);
            let ctx = self.ctx(&facts);
            let sg = inner.supergroups.get_mut(name).expect("validated");
            let group = sg.default_group_mut().expect("validated");
            if !group.get_waitlist.is_empty() {
                group.assign_sessions_to_get_waiters(&ctx, actions);
            }
        }

        // While deciding what happens next, the group does not count as
        // spawning, so capacity checks see the true picture.
        {
            let sg = inner.supergroups.get_mut(name).expect("validated");
            sg.default_group_mut().expect("validated").spawn_finished();
        }

        let group_waiters_empty = inner
            .supergroups
            .get(name)
            .and_then(SuperGroup::default_group)
            .map(|group| group.get_waitlist.is_empty())
            .unwrap_or(true);
        if failed || group_waiters_empty {
            self.assign_sessions_to_get_waiters_locked(inner, actions, tasks);
        }
        if failed {
            return false;
        }

        let full = inner.at_full_capacity();
        let sg = inner.supergroups.get_mut(name).expect("validated");
        let group = sg.default_group_mut().expect("validated");
        let satisfied = group.enabled_count() >= group.options.min_processes
            && group.get_waitlist.is_empty();
        let done = satisfied || full;
        if !done {
            group.continue_spawning();
        }
        !done
    }

    // ----- restart -------------------------------------------------------

    /// Restart every group whose app root matches. Returns how many
    /// groups were told to restart.
    pub fn restart_groups_by_app_root(self: &Arc<Self>, app_root: &str) -> usize {
        let mut actions = PostLockActions::new();
        let mut count = 0;
        {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            let names: Vec<String> = inner.supergroups.keys().cloned().collect();
            for name in names {
                let sg = inner.supergroups.get_mut(&name).expect("name collected");
                for group in &mut sg.groups {
                    if group.options.app_root == app_root {
                        count += 1;
                        if !group.restarting() {
                            let options = group.options.clone();
                            group.restart(options, &mut actions, &mut tasks);
                        }
                    }
                }
            }
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
        count
    }

    /// Restart every supergroup whose app root matches.
    pub fn restart_supergroups_by_app_root(self: &Arc<Self>, app_root: &str) -> usize {
        let mut actions = PostLockActions::new();
        let mut count = 0;
        {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            let names: Vec<String> = inner.supergroups.keys().cloned().collect();
            for name in names {
                let sg = inner.supergroups.get_mut(&name).expect("name collected");
                if sg.options.app_root == app_root {
                    count += 1;
                    let options = sg.options.clone();
                    sg.restart(options, &mut actions, &mut tasks);
                }
            }
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
        count
    }

    fn finalize_restart(self: &Arc<Self>, app_group_name: &str, options: Options) {
        // Build the new spawner outside the lock; there is no reason to
        // hold the pool while doing so.
        let spawner = self.factory.create(&options);
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            let Some(sg) = inner.supergroups.get_mut(app_group_name) else {
                return;
            };
            let Some(group) = sg.default_group_mut() else {
                return;
            };
            if !group.is_alive() || !group.restarting() {
                return;
            }
            let old_spawner = group.finish_restart(options, spawner);
            actions.push(Box::new(move || old_spawner.cleanup()));

            let facts = self.facts(&inner, None);
            let ctx = self.ctx(&facts);
            let sg = inner.supergroups.get_mut(app_group_name).expect("present");
            let group = sg.default_group_mut().expect("present");
            if group.should_spawn(&ctx) {
                group.trigger_spawn(&ctx, &mut tasks);
            }
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
        tracing::debug!(app_group = %app_group_name, "group restart finalized");
    }

    // ----- session lifecycle --------------------------------------------

    /// Called by [`Session`] handles when they close.
    pub(crate) fn session_closed(
        self: &Arc<Self>,
        app_group_name: &str,
        gupid: &str,
        socket_index: usize,
    ) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            if inner.supergroups.contains_key(app_group_name) {
                let facts = self.facts(&inner, Some(app_group_name));
                let ctx = self.ctx(&facts);
                let sg = inner
                    .supergroups
                    .get_mut(app_group_name)
                    .expect("checked above");
                let outcome = sg
                    .groups
                    .iter_mut()
                    .find(|group| group.find_process(gupid).is_some())
                    .map(|group| group.on_session_closed(gupid, socket_index, &ctx, &mut actions, &mut tasks))
                    .unwrap_or(SessionCloseOutcome::Ignored);
                if outcome == SessionCloseOutcome::Detached {
                    self.assign_sessions_to_get_waiters_locked(&mut inner, &mut actions, &mut tasks);
                    self.possibly_spawn_more_processes_locked(&mut inner, &mut tasks);
                }
            } else {
                self.detached_supergroup_session_closed(
                    &mut inner,
                    gupid,
                    socket_index,
                    &mut actions,
                    &mut tasks,
                );
            }
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
    }

    fn detached_supergroup_session_closed(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        gupid: &str,
        socket_index: usize,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) {
        let facts = self.facts(inner, None);
        let ctx = self.ctx(&facts);
        let mut finished = None;
        for (index, sg) in inner.detached_supergroups.iter_mut().enumerate() {
            let Some(group) = sg
                .groups
                .iter_mut()
                .find(|group| group.find_process(gupid).is_some())
            else {
                continue;
            };
            group.on_session_closed(gupid, socket_index, &ctx, actions, tasks);
            if sg.try_finish_destroy(actions) {
                finished = Some(index);
            }
            break;
        }
        if let Some(index) = finished {
            inner.detached_supergroups.remove(index);
        }
    }

    /// Called by [`Session::initiate_failed`]: the worker's socket could
    /// not be connected, so the worker is presumed broken and detached.
    pub(crate) fn session_initiate_failed(
        self: &Arc<Self>,
        app_group_name: &str,
        gupid: &str,
        socket_index: usize,
    ) {
        tracing::warn!(
            app_group = %app_group_name,
            gupid,
            "could not initiate session with process, detaching it"
        );
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            if inner.supergroups.contains_key(app_group_name) {
                let sg = inner
                    .supergroups
                    .get_mut(app_group_name)
                    .expect("checked above");
                if let Some(group) = sg
                    .groups
                    .iter_mut()
                    .find(|group| group.find_process(gupid).is_some())
                {
                    group.note_session_closed_quietly(gupid, socket_index);
                }
                self.detach_process_locked(&mut inner, gupid, &mut actions, &mut tasks);
            } else {
                // The supergroup is already being torn down; just release
                // the slot so its drain can finish.
                self.detached_supergroup_session_closed(
                    &mut inner,
                    gupid,
                    socket_index,
                    &mut actions,
                    &mut tasks,
                );
            }
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
    }

    // ----- detach / disable ---------------------------------------------

    /// Detach a process by gupid. Returns false if no such process.
    pub fn detach_process(self: &Arc<Self>, gupid: &str) -> bool {
        let mut actions = PostLockActions::new();
        let detached = {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            let detached = self.detach_process_locked(&mut inner, gupid, &mut actions, &mut tasks);
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
            detached
        };
        run_post_lock_actions(actions);
        detached
    }

    fn detach_process_locked(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        gupid: &str,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) -> bool {
        let Some(app_group) = inner.app_group_of_gupid(gupid) else {
            return false;
        };
        let sg = inner.supergroups.get_mut(&app_group).expect("located");
        let mut detached = false;
        for group in &mut sg.groups {
            if group.detach_by_gupid(gupid, actions) {
                detached = true;
                break;
            }
        }
        if detached {
            self.assign_sessions_to_get_waiters_locked(inner, actions, tasks);
            self.possibly_spawn_more_processes_locked(inner, tasks);
        }
        detached
    }

    /// Disable a process, blocking while it drains if necessary.
    pub fn disable_process(self: &Arc<Self>, gupid: &str) -> DisableResult {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let mut actions = PostLockActions::new();
        let immediate = {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            let Some(app_group) = inner.app_group_of_gupid(gupid) else {
                return DisableResult::Noop;
            };
            let sg = inner.supergroups.get_mut(&app_group).expect("located");
            let group = sg
                .groups
                .iter_mut()
                .find(|group| group.find_process(gupid).is_some())
                .expect("located");
            let result = group.disable(
                gupid,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
                &mut tasks,
            );
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
            result
        };
        run_post_lock_actions(actions);
        match immediate {
            DisableResult::Deferred => rx.recv().unwrap_or(DisableResult::Error),
            other => other,
        }
    }

    /// Detach an entire supergroup, blocking until its teardown finishes.
    pub fn detach_supergroup_by_name(self: &Arc<Self>, name: &str) -> bool {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let Some(mut sg) = inner.supergroups.remove(name) else {
                return false;
            };
            let mut tasks = Vec::new();
            sg.destroy(
                Some(Box::new(move |result| {
                    let _ = tx.send(result);
                })),
                &mut actions,
            );
            if !sg.try_finish_destroy(&mut actions) {
                inner.detached_supergroups.push(sg);
            }
            self.assign_sessions_to_get_waiters_locked(&mut inner, &mut actions, &mut tasks);
            self.possibly_spawn_more_processes_locked(&mut inner, &mut tasks);
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
        matches!(rx.recv(), Ok(ShutdownResult::Success))
    }

    pub fn detach_supergroup_by_secret(self: &Arc<Self>, secret: &str) -> bool {
        let name = {
            let inner = self.lock();
            inner
                .supergroups
                .values()
                .find(|sg| sg.secret == secret)
                .map(|sg| sg.name.clone())
        };
        match name {
            Some(name) => self.detach_supergroup_by_name(&name),
            None => false,
        }
    }

    // ----- out-of-band work ---------------------------------------------

    /// A worker signaled that it wants out-of-band work. The exchange
    /// happens once the process has drained: it is disabled, contacted,
    /// then re-enabled.
    pub fn request_oobw(self: &Arc<Self>, gupid: &str) -> bool {
        let mut actions = PostLockActions::new();
        let found = {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            let found = match inner.app_group_of_gupid(gupid) {
                Some(app_group) => {
                    let sg = inner.supergroups.get_mut(&app_group).expect("located");
                    let mut found = false;
                    for group in &mut sg.groups {
                        if let Some(process) = group.process_by_gupid_mut(gupid) {
                            process.oobw_requested = true;
                            found = true;
                            break;
                        }
                    }
                    if found {
                        tasks.push(GroupTask::OobwCheck {
                            app_group_name: app_group,
                            gupid: gupid.to_string(),
                        });
                    }
                    found
                }
                None => false,
            };
            self.process_tasks(&mut inner, tasks, &mut actions);
            found
        };
        run_post_lock_actions(actions);
        found
    }

    /// Drive the out-of-band state machine for one process. Runs under
    /// the lock; called from task processing.
    fn oobw_check_locked(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        app_group_name: &str,
        gupid: &str,
        actions: &mut PostLockActions,
        queue: &mut VecDeque<GroupTask>,
    ) {
        use crate::pool::process::Enabled;

        let Some(sg) = inner.supergroups.get_mut(app_group_name) else {
            return;
        };
        let Some(group) = sg
            .groups
            .iter_mut()
            .find(|group| group.find_process(gupid).is_some())
        else {
            return;
        };
        let Some(process) = group.process_by_gupid(gupid) else {
            return;
        };
        if !process.oobw_requested {
            return;
        }
        match process.enabled {
            Enabled::Enabled => {
                // Disable first; when the disable completes the check
                // runs again.
                let pool = Weak::clone(&self.weak_self);
                let name = app_group_name.to_string();
                let id = gupid.to_string();
                let mut tasks = Vec::new();
                let result = group.disable(
                    gupid,
                    Box::new(move |result| {
                        if result == DisableResult::Success {
                            if let Some(pool) = pool.upgrade() {
                                pool.resume_oobw(&name, &id);
                            }
                        }
                    }),
                    &mut tasks,
                );
                queue.extend(tasks);
                if result == DisableResult::Success {
                    // Disabled on the spot; re-run the check now.
                    queue.push_back(GroupTask::OobwCheck {
                        app_group_name: app_group_name.to_string(),
                        gupid: gupid.to_string(),
                    });
                }
            }
            Enabled::Disabling => {}
            Enabled::Disabled => {
                let Some(process) = group.process_by_gupid_mut(gupid) else {
                    return;
                };
                if process.sessions != 0 {
                    return;
                }
                process.oobw_requested = false;
                let target = OobwTarget {
                    app_group_name: app_group_name.to_string(),
                    gupid: gupid.to_string(),
                    dummy: process.dummy,
                    connect_password: process.connect_password.clone(),
                    address: process
                        .sockets
                        .iter()
                        .find(|socket| socket.protocol.is_session())
                        .map(|socket| socket.address.clone()),
                };
                let pool = Arc::clone(self);
                actions.push(Box::new(move || {
                    let result = std::thread::Builder::new()
                        .name(format!("oobw: {}", target.gupid))
                        .spawn(move || pool.perform_oobw(target));
                    if let Err(err) = result {
                        tracing::error!("could not start oobw thread: {err}");
                    }
                }));
            }
        }
    }

    fn resume_oobw(self: &Arc<Self>, app_group_name: &str, gupid: &str) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let tasks = vec![GroupTask::OobwCheck {
                app_group_name: app_group_name.to_string(),
                gupid: gupid.to_string(),
            }];
            self.process_tasks(&mut inner, tasks, &mut actions);
        }
        run_post_lock_actions(actions);
    }

    /// The out-of-band exchange itself, outside the lock.
    fn perform_oobw(self: &Arc<Self>, target: OobwTarget) {
        if !target.dummy {
            match &target.address {
                Some(SocketAddress::Unix(path)) => {
                    let exchange = (|| -> std::io::Result<()> {
                        let mut stream = std::os::unix::net::UnixStream::connect(path)?;
                        stream.set_read_timeout(Some(Duration::from_secs(60)))?;
                        stream.set_write_timeout(Some(Duration::from_secs(60)))?;
                        stream.write_all(
                            format!("oobw: {}\n\n", target.connect_password).as_bytes(),
                        )?;
                        // The response content does not matter, only that
                        // the worker finished its work.
                        let mut response = [0u8; 128];
                        let _ = stream.read(&mut response)?;
                        Ok(())
                    })();
                    if let Err(err) = exchange {
                        tracing::error!(gupid = %target.gupid, "out-of-band work failed: {err}");
                    }
                }
                _ => {
                    tracing::debug!(
                        gupid = %target.gupid,
                        "skipping out-of-band exchange: no unix session socket"
                    );
                }
            }
        }

        // Back under the lock: restore the process to service.
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let facts = self.facts(&inner, None);
            let ctx = self.ctx(&facts);
            if let Some(sg) = inner.supergroups.get_mut(&target.app_group_name) {
                if let Some(group) = sg
                    .groups
                    .iter_mut()
                    .find(|group| group.find_process(&target.gupid).is_some())
                {
                    group.enable(&target.gupid, &mut actions);
                    group.assign_sessions_to_get_waiters(&ctx, &mut actions);
                }
            }
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
    }

    // ----- tuning --------------------------------------------------------

    /// Raise or lower the global capacity. Raising re-dispatches pool
    /// waiters; lowering never kills existing processes.
    pub fn set_max(self: &Arc<Self>, max: usize) {
        debug_assert!(max > 0);
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let bigger = max > inner.max;
            inner.max = max;
            if bigger {
                let mut tasks = Vec::new();
                // Waiters on the pool come first: groups that already
                // queued their waiters hold the resources to finish
                // eventually, pool waiters do not.
                self.assign_sessions_to_get_waiters_locked(&mut inner, &mut actions, &mut tasks);
                self.possibly_spawn_more_processes_locked(&mut inner, &mut tasks);
                self.process_tasks(&mut inner, tasks, &mut actions);
            }
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
    }

    pub fn set_max_idle_time(&self, usec: u64) {
        let mut inner = self.lock();
        inner.max_idle_time = usec;
        drop(inner);
        self.gc_cond.notify_all();
    }

    // ----- introspection -------------------------------------------------

    pub fn utilization(&self) -> usize {
        self.lock().utilization()
    }

    pub fn at_full_capacity(&self) -> bool {
        self.lock().at_full_capacity()
    }

    pub fn process_count(&self) -> usize {
        self.lock().process_count()
    }

    pub fn supergroup_count(&self) -> usize {
        self.lock().supergroups.len()
    }

    pub fn get_wait_list_size(&self) -> usize {
        self.lock().get_waitlist.len()
    }

    pub fn is_spawning(&self) -> bool {
        self.lock().is_spawning()
    }

    pub fn max(&self) -> usize {
        self.lock().max
    }

    /// Structured state snapshot, also the base of `inspect` and
    /// `to_xml`.
    pub fn snapshot(&self, include_secrets: bool) -> PoolSnapshot {
        let inner = self.lock();
        snapshot::snapshot_pool(
            &inner.supergroups,
            &inner.get_waitlist,
            inner.max,
            inner.utilization(),
            inner.process_count(),
            include_secrets,
        )
    }

    /// Human-readable pool state.
    pub fn inspect(&self, options: &InspectOptions) -> String {
        snapshot::render_inspect(&self.snapshot(true), options)
    }

    /// Stable XML snapshot of the entire pool.
    pub fn to_xml(&self, include_secrets: bool) -> String {
        snapshot::render_xml(&self.snapshot(include_secrets))
    }

    // ----- garbage collection -------------------------------------------

    fn garbage_collector_loop(self: &Arc<Self>) {
        // Initial grace period so startup spawns settle first.
        self.gc_sleep(GC_DEFAULT_SLEEP_USEC);
        while !self.shutting_down.load(Ordering::Acquire) {
            let sleep_usec = self.garbage_collect_once();
            self.gc_sleep(sleep_usec);
        }
        tracing::debug!("garbage collector stopped");
    }

    fn gc_sleep(&self, usec: u64) {
        let inner = self.lock();
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let _ = self
            .gc_cond
            .wait_timeout(inner, Duration::from_micros(usec))
            .expect("pool mutex poisoned");
    }

    /// One garbage collection pass. Returns how long to sleep until the
    /// nearest future deadline.
    fn garbage_collect_once(self: &Arc<Self>) -> u64 {
        let mut actions = PostLockActions::new();
        let sleep_usec;
        {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            let now = clock::now_usec();
            let max_idle_time = inner.max_idle_time;
            let mut next_deadline: Option<u64> = None;
            let mut detached_any = false;
            let mut track = |deadline: u64, next: &mut Option<u64>| {
                if deadline > now {
                    *next = Some(next.map_or(deadline, |cur| cur.min(deadline)));
                }
            };

            let names: Vec<String> = inner.supergroups.keys().cloned().collect();
            for name in &names {
                let sg = inner.supergroups.get_mut(name).expect("name collected");
                for group in &mut sg.groups {
                    // Idle processes over the limit go away, but never
                    // below the group's minimum.
                    loop {
                        let min = group.options.min_processes;
                        if group.enabled_count() <= min {
                            break;
                        }
                        let candidate = group
                            .enabled
                            .iter()
                            .find(|p| {
                                p.sessions == 0 && now >= p.last_used + max_idle_time
                            })
                            .map(|p| p.gupid.clone());
                        match candidate {
                            Some(gupid) => {
                                tracing::debug!(
                                    group = %group.name,
                                    gupid = %gupid,
                                    "garbage collecting idle process"
                                );
                                group.detach_by_gupid(&gupid, &mut actions);
                                metrics::gc_detached(1);
                                detached_any = true;
                            }
                            None => break,
                        }
                    }
                    for process in &group.enabled {
                        if process.sessions == 0 {
                            track(process.last_used + max_idle_time, &mut next_deadline);
                        }
                    }

                    // Idle preloaders go away too.
                    let preloader_idle = group.options.max_preloader_idle_time;
                    if preloader_idle > 0 && group.spawner.cleanable() {
                        let deadline =
                            group.spawner.last_used() + preloader_idle * 1_000_000;
                        if now >= deadline {
                            tracing::debug!(group = %group.name, "garbage collecting idle preloader");
                            let spawner = Arc::clone(&group.spawner);
                            actions.push(Box::new(move || spawner.cleanup()));
                        } else {
                            track(deadline, &mut next_deadline);
                        }
                    }

                    group.sweep_detached(&mut actions);
                }
            }

            // Detached supergroups may have finished draining.
            let mut index = 0;
            while index < inner.detached_supergroups.len() {
                let sg = &mut inner.detached_supergroups[index];
                for group in &mut sg.groups {
                    group.sweep_detached(&mut actions);
                }
                if sg.try_finish_destroy(&mut actions) {
                    inner.detached_supergroups.remove(index);
                } else {
                    index += 1;
                }
            }

            if detached_any {
                self.assign_sessions_to_get_waiters_locked(&mut inner, &mut actions, &mut tasks);
                self.possibly_spawn_more_processes_locked(&mut inner, &mut tasks);
            }
            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();

            sleep_usec = match next_deadline {
                Some(deadline) if deadline > now => deadline - now,
                _ => max_idle_time.max(GC_DEFAULT_SLEEP_USEC),
            };
        }
        run_post_lock_actions(actions);
        sleep_usec
    }

    // ----- analytics -----------------------------------------------------

    fn analytics_loop(self: &Arc<Self>) {
        // Let the first processes arrive before measuring anything.
        self.analytics_sleep(3_000_000);
        while !self.shutting_down.load(Ordering::Acquire) {
            let sleep_usec = self.collect_analytics_once();
            self.analytics_sleep(sleep_usec);
        }
        tracing::debug!("analytics collector stopped");
    }

    fn analytics_sleep(&self, usec: u64) {
        let gate = self
            .analytics_gate
            .lock()
            .expect("analytics mutex poisoned");
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let _ = self
            .analytics_cond
            .wait_timeout(gate, Duration::from_micros(usec))
            .expect("analytics mutex poisoned");
    }

    /// One analytics pass: snapshot pids under the lock, run the external
    /// collector outside it, then fold the measurements back in. Returns
    /// the sleep until the next second-aligned run.
    fn collect_analytics_once(self: &Arc<Self>) -> u64 {
        // Phase 1: pids only.
        let pids: Vec<i32> = {
            let inner = self.lock();
            inner
                .supergroups
                .values()
                .flat_map(|sg| sg.groups.iter())
                .flat_map(|group| {
                    group
                        .enabled
                        .iter()
                        .chain(group.disabling.iter())
                        .chain(group.disabled.iter())
                })
                .filter(|process| !process.dummy)
                .map(|process| process.pid)
                .collect()
        };

        // Phase 2: measure without the lock.
        let measured = match self.collector.collect(&pids) {
            Ok(measured) => measured,
            Err(err) => {
                tracing::warn!("could not collect process metrics: {err}");
                return self.analytics_sleep_target();
            }
        };

        // Phase 3: fold back in, detaching processes that are gone.
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.lock();
            let mut tasks = Vec::new();
            let mut vanished = Vec::new();
            let names: Vec<String> = inner.supergroups.keys().cloned().collect();
            for name in &names {
                let sg = inner.supergroups.get_mut(name).expect("name collected");
                for group in &mut sg.groups {
                    let analytics_enabled = group.options.analytics;
                    let group_name = group.name.clone();
                    let union_station_key = group.options.union_station_key.clone();
                    for process in group
                        .enabled
                        .iter_mut()
                        .chain(group.disabling.iter_mut())
                        .chain(group.disabled.iter_mut())
                    {
                        if let Some(m) = measured.get(&process.pid) {
                            process.metrics = *m;
                        } else if !process.dummy && !process.os_process_exists() {
                            tracing::warn!(
                                gupid = %process.gupid,
                                pid = process.pid,
                                "process no longer exists, detaching it from the pool"
                            );
                            vanished.push(process.gupid.clone());
                        }
                    }
                    if analytics_enabled {
                        tracing::info!(
                            target: "analytics",
                            group = %group_name,
                            key = %union_station_key,
                            snapshot = %snapshot::render_group_fragment(group),
                            "group analytics snapshot"
                        );
                    }
                }
            }
            for gupid in vanished {
                self.detach_process_locked(&mut inner, &gupid, &mut actions, &mut tasks);
            }

            metrics::set_pool_utilization(inner.utilization());
            metrics::set_pool_process_count(inner.process_count());
            metrics::set_pool_wait_list_size(inner.get_waitlist.len());

            self.process_tasks(&mut inner, tasks, &mut actions);
            inner.debug_verify();
        }
        run_post_lock_actions(actions);
        self.analytics_sleep_target()
    }

    fn analytics_sleep_target(&self) -> u64 {
        let now = clock::now_usec();
        let deadline = clock::round_up_usec(now, 1_000_000) + ANALYTICS_INTERVAL_USEC;
        deadline - now
    }

    // ----- teardown ------------------------------------------------------

    /// Shut the pool down: detach every supergroup (waiting for each to
    /// finish draining), stop the background threads, abort remaining
    /// waiters.
    pub fn destroy(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.life_status != LifeStatus::Alive {
                return;
            }
            inner.life_status = LifeStatus::ShuttingDown;
        }

        loop {
            let name = {
                let inner = self.lock();
                inner.supergroups.keys().next().cloned()
            };
            match name {
                Some(name) => {
                    self.detach_supergroup_by_name(&name);
                }
                None => break,
            }
        }

        self.shutting_down.store(true, Ordering::Release);
        self.gc_cond.notify_all();
        self.analytics_cond.notify_all();

        let mut actions = PostLockActions::new();
        let handles = {
            let mut inner = self.lock();
            while let Some(mut sg) = inner.detached_supergroups.pop() {
                sg.cancel_destroy(&mut actions);
            }
            while let Some(waiter) = inner.get_waitlist.pop_front() {
                actions.push(Box::new(move || {
                    (waiter.callback)(Err(GetError::ShuttingDown))
                }));
            }
            inner.life_status = LifeStatus::ShutDown;
            std::mem::take(&mut inner.background_threads)
        };
        run_post_lock_actions(actions);
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("pool shut down");
    }

    // ----- test support --------------------------------------------------

    /// Run the garbage collector once, synchronously. Test hook.
    #[doc(hidden)]
    pub fn run_gc_pass(self: &Arc<Self>) {
        self.garbage_collect_once();
    }

    /// Run the analytics pass once, synchronously. Test hook.
    #[doc(hidden)]
    pub fn run_analytics_pass(self: &Arc<Self>) {
        self.collect_analytics_once();
    }
}

struct OobwTarget {
    app_group_name: String,
    gupid: String,
    dummy: bool,
    connect_password: String,
    address: Option<SocketAddress>,
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            if inner.life_status == LifeStatus::Alive && !inner.supergroups.is_empty() {
                tracing::warn!("pool dropped without destroy(); worker processes may leak");
            }
        }
    }
}
