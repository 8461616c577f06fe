//! Per-application routing and process lifecycle.
//!
//! A group owns every process of one application. Processes live in
//! exactly one of four lists:
//! - `enabled`: receives routed requests, ordered by a utilization queue
//! - `disabling`: draining; only used when no enabled process exists
//! - `disabled`: holds no new sessions (except out-of-band work)
//! - `detached`: shutting down, waiting for remaining sessions to close
//!
//! All methods run under the pool lock. Pool-wide facts a method needs
//! (capacity, pool waiters) arrive in a [`GroupCtx`]; side effects that
//! must not run under the lock are pushed onto the caller's post-lock
//! actions, and work the pool has to orchestrate (spawn threads, restart
//! finalization, out-of-band work) is emitted as [`GroupTask`] values.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use crate::options::Options;
use crate::pool::core::Pool;
use crate::pool::process::{Enabled, LifeStatus, Process};
use crate::pool::session::{Session, SessionSocket};
use crate::pool::{DisableCallback, DisableResult, GetCallback, GetError, GetWaiter, PostLockActions};
use crate::spawn::{self, SpawnError, Spawner};

/// Pool-wide facts computed before entering a group method.
pub(crate) struct GroupCtx<'a> {
    pub now: u64,
    pub pool: &'a Weak<Pool>,
    pub pool_at_full_capacity: bool,
    pub pool_has_waiters: bool,
    pub another_group_waiting: bool,
}

/// Work a group hands back to the pool for orchestration.
pub(crate) enum GroupTask {
    /// Launch a background spawn loop for this group.
    Spawn(SpawnTask),
    /// Build a new spawner outside the lock and swap it in.
    FinalizeRestart {
        app_group_name: String,
        options: Options,
    },
    /// Re-evaluate a process that requested out-of-band work.
    OobwCheck {
        app_group_name: String,
        gupid: String,
    },
}

/// Everything a spawn worker thread needs.
pub(crate) struct SpawnTask {
    pub app_group_name: String,
    pub spawner: Arc<Spawner>,
    pub options: Options,
    pub restarts_initiated: u32,
}

/// Outcome of a `get` against a group.
pub(crate) enum GetResult {
    /// A session was checked out; the caller schedules the callback.
    CheckedOut(Session, GetCallback),
    /// The caller was parked on the group's wait list.
    Queued,
}

/// Outcome of a session close, telling the pool whether capacity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionCloseOutcome {
    /// Bookkeeping only.
    Normal,
    /// A process was detached; pool-level re-dispatch should run.
    Detached,
    /// The session belonged to a process this group no longer tracks.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpawnState {
    NotSpawning,
    Spawning,
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupLife {
    Alive,
    ShuttingDown,
    ShutDown,
}

impl GroupLife {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            GroupLife::Alive => "alive",
            GroupLife::ShuttingDown => "shutting_down",
            GroupLife::ShutDown => "shut_down",
        }
    }
}

struct DisableWaiter {
    gupid: String,
    callback: DisableCallback,
}

/// Watches an application's restart marker files.
///
/// `restart.txt` triggers once per mtime change; `always_restart.txt`
/// triggers on every (throttled) check while it exists.
struct RestartWatch {
    restart_file: std::path::PathBuf,
    always_restart_file: std::path::PathBuf,
    last_check_usec: u64,
    baseline_mtime: Option<SystemTime>,
}

impl RestartWatch {
    fn new(app_root: &str) -> Self {
        let root = std::path::Path::new(app_root);
        let restart_file = root.join("tmp").join("restart.txt");
        let baseline_mtime = mtime_of(&restart_file);
        RestartWatch {
            restart_file,
            always_restart_file: root.join("always_restart.txt"),
            last_check_usec: 0,
            baseline_mtime,
        }
    }

    fn changed(&mut self, now: u64, throttle_secs: u64) -> bool {
        if now.saturating_sub(self.last_check_usec) < throttle_secs * 1_000_000 {
            return false;
        }
        self.last_check_usec = now;
        if self.always_restart_file.exists() {
            return true;
        }
        let current = mtime_of(&self.restart_file);
        if current != self.baseline_mtime {
            self.baseline_mtime = current;
            return true;
        }
        false
    }
}

fn mtime_of(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

pub struct Group {
    /// Uniquely identifies this group within the pool; also the display
    /// name.
    pub name: String,
    pub app_group_name: String,
    /// Token shared with group processes for intra-group control calls.
    pub secret: String,
    pub options: Options,
    pub(crate) enabled: Vec<Process>,
    pub(crate) disabling: Vec<Process>,
    pub(crate) disabled: Vec<Process>,
    /// Detached processes draining their last sessions.
    pub(crate) detached: Vec<Process>,
    /// `(utilization, queue_seq)` over `enabled`, smallest first. Ties
    /// break by insertion sequence, so routing is stable.
    pqueue: BTreeSet<(u64, u64)>,
    next_queue_seq: u64,
    pub(crate) get_waitlist: VecDeque<GetWaiter>,
    disable_waitlist: VecDeque<DisableWaiter>,
    pub(crate) spawn_state: SpawnState,
    /// Bumped on every restart; in-flight spawn loops started before the
    /// bump discard their results.
    pub(crate) restarts_initiated: u32,
    pub(crate) spawner: Arc<Spawner>,
    life: GroupLife,
    shutdown_callback: Option<Box<dyn FnOnce() + Send>>,
    restart_watch: RestartWatch,
}

impl Group {
    pub(crate) fn new(app_group_name: &str, mut options: Options, spawner: Arc<Spawner>) -> Self {
        options.clear_per_request_fields();
        let restart_watch = RestartWatch::new(&options.app_root);
        Group {
            name: format!("{app_group_name}#default"),
            app_group_name: app_group_name.to_string(),
            secret: spawn::generate_secret(),
            options,
            enabled: Vec::new(),
            disabling: Vec::new(),
            disabled: Vec::new(),
            detached: Vec::new(),
            pqueue: BTreeSet::new(),
            next_queue_seq: 0,
            get_waitlist: VecDeque::new(),
            disable_waitlist: VecDeque::new(),
            spawn_state: SpawnState::NotSpawning,
            restarts_initiated: 0,
            spawner,
            life: GroupLife::Alive,
            shutdown_callback: None,
            restart_watch,
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }

    pub fn disabling_count(&self) -> usize {
        self.disabling.len()
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.len()
    }

    pub fn process_count(&self) -> usize {
        self.enabled.len() + self.disabling.len() + self.disabled.len()
    }

    pub fn get_waitlist_size(&self) -> usize {
        self.get_waitlist.len()
    }

    pub fn disable_waitlist_size(&self) -> usize {
        self.disable_waitlist.len()
    }

    pub fn spawning(&self) -> bool {
        self.spawn_state == SpawnState::Spawning
    }

    pub fn restarting(&self) -> bool {
        self.spawn_state == SpawnState::Restarting
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.life == GroupLife::Alive
    }

    pub(crate) fn life(&self) -> GroupLife {
        self.life
    }

    /// Capacity units this group consumes: enabled processes plus one for
    /// an in-flight spawn.
    pub fn utilization(&self) -> usize {
        self.enabled.len() + usize::from(self.spawning())
    }

    /// Whether this group is stalled on pool capacity: it has waiters but
    /// no processes and no spawn in flight.
    pub(crate) fn is_waiting_for_capacity(&self) -> bool {
        self.enabled.is_empty()
            && self.spawn_state == SpawnState::NotSpawning
            && !self.get_waitlist.is_empty()
    }

    // ----- routing -------------------------------------------------------

    /// The routing algorithm. Never blocks; either checks a session out,
    /// or parks the caller on the group wait list (possibly triggering a
    /// spawn).
    pub(crate) fn get(
        &mut self,
        options: &Options,
        callback: GetCallback,
        ctx: &GroupCtx<'_>,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) -> GetResult {
        debug_assert!(self.is_alive());

        if self.spawn_state != SpawnState::Restarting {
            if self.needs_restart(ctx.now) {
                let mut restart_options = options.clone();
                restart_options.clear_per_request_fields();
                self.restart(restart_options, actions, tasks);
            } else {
                self.options.merge_volatile(options);
            }
            if !options.no_op && self.should_spawn_for_get(ctx) {
                self.trigger_spawn(ctx, tasks);
            }
        }

        if options.no_op {
            return GetResult::CheckedOut(
                Session::no_op(self.app_group_name.clone()),
                callback,
            );
        }

        if self.enabled.is_empty() {
            // Nothing to route to yet. Disabling processes still serve as
            // a fallback, except during a restart (they run the old
            // version).
            if self.spawn_state != SpawnState::Restarting {
                if let Some(index) = self.least_utilized_disabling() {
                    if !self.disabling[index].at_full_utilization() {
                        let session = self.checkout_from(ListKind::Disabling, index, ctx);
                        return GetResult::CheckedOut(session, callback);
                    }
                }
            }
            tracing::debug!(
                group = %self.name,
                "no session checked out yet: group is spawning, restarting or out of capacity"
            );
            self.get_waitlist
                .push_back(GetWaiter::new(options.clone(), callback));
            GetResult::Queued
        } else if self.queue_top_at_full_utilization() {
            tracing::debug!(
                group = %self.name,
                "no session checked out yet: all processes are at full utilization"
            );
            self.get_waitlist
                .push_back(GetWaiter::new(options.clone(), callback));
            GetResult::Queued
        } else {
            let index = self
                .queue_top_index()
                .expect("non-empty enabled list must have a queue top");
            let session = self.checkout_from(ListKind::Enabled, index, ctx);
            GetResult::CheckedOut(session, callback)
        }
    }

    /// Serve queued waiters from enabled processes, or from disabling
    /// ones when no enabled process exists. Called whenever a session
    /// slot or a new process becomes available.
    pub(crate) fn assign_sessions_to_get_waiters(
        &mut self,
        ctx: &GroupCtx<'_>,
        actions: &mut PostLockActions,
    ) {
        if !self.enabled.is_empty() {
            while !self.get_waitlist.is_empty() && !self.queue_top_at_full_utilization() {
                let index = self
                    .queue_top_index()
                    .expect("non-empty enabled list must have a queue top");
                let session = self.checkout_from(ListKind::Enabled, index, ctx);
                let waiter = self.get_waitlist.pop_front().expect("waitlist non-empty");
                actions.push(Box::new(move || (waiter.callback)(Ok(session))));
            }
        } else if !self.disabling.is_empty() && self.spawn_state != SpawnState::Restarting {
            while !self.get_waitlist.is_empty() {
                let Some(index) = self.least_utilized_disabling() else {
                    break;
                };
                if self.disabling[index].at_full_utilization() {
                    break;
                }
                let session = self.checkout_from(ListKind::Disabling, index, ctx);
                let waiter = self.get_waitlist.pop_front().expect("waitlist non-empty");
                actions.push(Box::new(move || (waiter.callback)(Ok(session))));
            }
        }
    }

    /// Fan a spawn failure out to every queued waiter.
    pub(crate) fn assign_error_to_get_waiters(
        &mut self,
        error: &Arc<SpawnError>,
        actions: &mut PostLockActions,
    ) {
        while let Some(waiter) = self.get_waitlist.pop_front() {
            let error = Arc::clone(error);
            actions.push(Box::new(move || {
                (waiter.callback)(Err(GetError::Spawn(error)))
            }));
        }
    }

    /// Abort every queued waiter, e.g. because the supergroup is being
    /// detached.
    pub(crate) fn abort_get_waiters(&mut self, reason: &str, actions: &mut PostLockActions) {
        while let Some(waiter) = self.get_waitlist.pop_front() {
            let reason = reason.to_string();
            actions.push(Box::new(move || {
                (waiter.callback)(Err(GetError::Aborted(reason)))
            }));
        }
    }

    fn checkout_from(&mut self, list: ListKind, index: usize, ctx: &GroupCtx<'_>) -> Session {
        let app_group_name = self.app_group_name.clone();
        let process = match list {
            ListKind::Enabled => &mut self.enabled[index],
            ListKind::Disabling => &mut self.disabling[index],
            ListKind::Disabled | ListKind::Detached => {
                unreachable!("sessions are never checked out from this list")
            }
        };
        let old_key = process.utilization();
        let socket_index = process
            .new_session(ctx.now)
            .expect("checkout requires a process below full utilization");
        let seq = process.queue_seq;
        let socket = &process.sockets[socket_index];
        let session = Session::checked_out(
            ctx.pool.clone(),
            app_group_name,
            process.gupid.clone(),
            process.pid,
            process.connect_password.clone(),
            SessionSocket {
                index: socket_index,
                name: socket.name.clone(),
                address: socket.address.clone(),
                protocol: socket.protocol.clone(),
            },
        );
        let new_key = process.utilization();
        if list == ListKind::Enabled {
            self.pqueue_requeue(seq, old_key, new_key);
        }
        session
    }

    fn least_utilized_disabling(&self) -> Option<usize> {
        self.disabling
            .iter()
            .enumerate()
            .min_by_key(|(_, process)| process.utilization())
            .map(|(index, _)| index)
    }

    fn queue_top_index(&self) -> Option<usize> {
        let &(_, seq) = self.pqueue.iter().next()?;
        self.enabled.iter().position(|p| p.queue_seq == seq)
    }

    fn queue_top_at_full_utilization(&self) -> bool {
        match self.queue_top_index() {
            Some(index) => self.enabled[index].at_full_utilization(),
            None => true,
        }
    }

    fn pqueue_requeue(&mut self, seq: u64, old_key: u64, new_key: u64) {
        self.pqueue.remove(&(old_key, seq));
        self.pqueue.insert((new_key, seq));
    }

    // ----- spawning ------------------------------------------------------

    /// Whether a new process should be spawned for this group.
    pub(crate) fn should_spawn(&self, ctx: &GroupCtx<'_>) -> bool {
        self.is_alive()
            && self.spawn_state == SpawnState::NotSpawning
            && self.below_group_capacity()
            && !ctx.pool_at_full_capacity
            && (!self.get_waitlist.is_empty()
                || self.enabled.len() < self.options.min_processes
                || !self.has_idle_enabled_process())
    }

    fn should_spawn_for_get(&self, ctx: &GroupCtx<'_>) -> bool {
        // An empty group always wants a worker for an incoming get, but
        // never past pool capacity: the waiter parks instead, and the
        // re-dispatch passes spawn once capacity frees up.
        self.should_spawn(ctx) || (self.enabled.is_empty() && !ctx.pool_at_full_capacity)
    }

    fn below_group_capacity(&self) -> bool {
        self.options.max_processes == 0
            || self.enabled.len() + self.disabling.len() < self.options.max_processes
    }

    fn has_idle_enabled_process(&self) -> bool {
        self.enabled.iter().any(|process| process.sessions == 0)
    }

    /// Idempotently start a background spawn. Capacity checks are the
    /// caller's business (`should_spawn`); a disable of the last process
    /// spawns regardless of limits.
    pub(crate) fn trigger_spawn(&mut self, _ctx: &GroupCtx<'_>, tasks: &mut Vec<GroupTask>) {
        self.trigger_spawn_unconditional(tasks);
    }

    /// Spawn trigger for the pool's re-dispatch passes, which have
    /// already checked capacity.
    pub(crate) fn trigger_spawn_for_pool(&mut self, tasks: &mut Vec<GroupTask>) {
        self.trigger_spawn_unconditional(tasks);
    }

    /// Leave the spawning state after one spawn-loop iteration.
    pub(crate) fn spawn_finished(&mut self) {
        if self.spawn_state == SpawnState::Spawning {
            self.spawn_state = SpawnState::NotSpawning;
        }
    }

    /// Re-enter the spawning state for the next spawn-loop iteration.
    pub(crate) fn continue_spawning(&mut self) {
        if self.spawn_state == SpawnState::NotSpawning {
            self.spawn_state = SpawnState::Spawning;
        }
    }

    /// Fix session counters for a session that ended without going
    /// through the normal close path (e.g. it could never be initiated).
    pub(crate) fn note_session_closed_quietly(&mut self, gupid: &str, socket_index: usize) {
        let Some((list, index)) = self.find_process(gupid) else {
            return;
        };
        match list {
            ListKind::Enabled => {
                let old_key = self.enabled[index].utilization();
                self.enabled[index].session_closed(socket_index);
                let seq = self.enabled[index].queue_seq;
                let new_key = self.enabled[index].utilization();
                self.pqueue_requeue(seq, old_key, new_key);
            }
            ListKind::Disabling => self.disabling[index].session_closed(socket_index),
            ListKind::Disabled => self.disabled[index].session_closed(socket_index),
            ListKind::Detached => self.detached[index].session_closed(socket_index),
        }
    }

    fn trigger_spawn_unconditional(&mut self, tasks: &mut Vec<GroupTask>) {
        if !self.is_alive() || self.spawn_state != SpawnState::NotSpawning {
            return;
        }
        tracing::debug!(group = %self.name, "requested spawning of a new process");
        self.spawn_state = SpawnState::Spawning;
        tasks.push(GroupTask::Spawn(SpawnTask {
            app_group_name: self.app_group_name.clone(),
            spawner: Arc::clone(&self.spawner),
            options: self.options.clone(),
            restarts_initiated: self.restarts_initiated,
        }));
    }

    /// Attach a freshly spawned process as enabled and resolve disable
    /// waiters that the added capacity unblocks.
    pub(crate) fn attach(&mut self, mut process: Process, actions: &mut PostLockActions) {
        debug_assert!(self.is_alive());
        debug_assert!(process.is_alive());
        tracing::debug!(group = %self.name, process = %process.inspect(), "attaching process");
        process.generation = self.restarts_initiated;
        self.insert_enabled(process);

        // Now that there is more capacity, drained disabling processes
        // can complete their disable.
        let mut index = 0;
        while index < self.disabling.len() {
            let drained = self.disabling[index].sessions == 0
                && self
                    .disable_waitlist
                    .iter()
                    .any(|w| w.gupid == self.disabling[index].gupid);
            if drained {
                let mut process = self.disabling.remove(index);
                process.enabled = Enabled::Disabled;
                let gupid = process.gupid.clone();
                self.disabled.push(process);
                self.remove_from_disable_waitlist(&gupid, DisableResult::Success, actions);
            } else {
                index += 1;
            }
        }
    }

    fn insert_enabled(&mut self, mut process: Process) {
        process.enabled = Enabled::Enabled;
        process.queue_seq = self.next_queue_seq;
        self.next_queue_seq += 1;
        self.pqueue.insert((process.utilization(), process.queue_seq));
        self.enabled.push(process);
    }

    fn remove_enabled(&mut self, index: usize) -> Process {
        let process = self.enabled.remove(index);
        self.pqueue.remove(&(process.utilization(), process.queue_seq));
        process
    }

    // ----- disable / enable ---------------------------------------------

    pub(crate) fn disable(
        &mut self,
        gupid: &str,
        callback: DisableCallback,
        tasks: &mut Vec<GroupTask>,
    ) -> DisableResult {
        debug_assert!(self.is_alive());
        if let Some(index) = self.enabled.iter().position(|p| p.gupid == gupid) {
            if self.enabled.len() <= 1 || self.enabled[index].sessions > 0 {
                let mut process = self.remove_enabled(index);
                process.enabled = Enabled::Disabling;
                tracing::debug!(
                    group = %self.name,
                    process = %process.inspect(),
                    "deferring disable until the process drains"
                );
                self.disable_waitlist.push_back(DisableWaiter {
                    gupid: process.gupid.clone(),
                    callback,
                });
                self.disabling.push(process);
                if self.enabled.is_empty() {
                    // The last worker is now draining; spawn a
                    // replacement regardless of resource limits so the
                    // disable cannot starve requests.
                    self.trigger_spawn_unconditional(tasks);
                }
                DisableResult::Deferred
            } else {
                let mut process = self.remove_enabled(index);
                process.enabled = Enabled::Disabled;
                tracing::debug!(
                    group = %self.name,
                    process = %process.inspect(),
                    "disable succeeded immediately"
                );
                self.disabled.push(process);
                DisableResult::Success
            }
        } else if self.disabling.iter().any(|p| p.gupid == gupid) {
            self.disable_waitlist.push_back(DisableWaiter {
                gupid: gupid.to_string(),
                callback,
            });
            DisableResult::Deferred
        } else if self.disabled.iter().any(|p| p.gupid == gupid) {
            DisableResult::Noop
        } else {
            DisableResult::Noop
        }
    }

    /// Move a disabling or disabled process back to enabled.
    pub(crate) fn enable(&mut self, gupid: &str, actions: &mut PostLockActions) -> bool {
        if let Some(index) = self.disabling.iter().position(|p| p.gupid == gupid) {
            let process = self.disabling.remove(index);
            self.insert_enabled(process);
            self.remove_from_disable_waitlist(gupid, DisableResult::Canceled, actions);
            true
        } else if let Some(index) = self.disabled.iter().position(|p| p.gupid == gupid) {
            let process = self.disabled.remove(index);
            self.insert_enabled(process);
            true
        } else {
            self.enabled.iter().any(|p| p.gupid == gupid)
        }
    }

    /// Used when a spawn fails while every process is draining: the
    /// drained state cannot be honored, so disabling processes return to
    /// service and their disable waiters get an error.
    pub(crate) fn enable_all_disabling(&mut self, actions: &mut PostLockActions) {
        while let Some(process) = self.disabling.pop() {
            self.insert_enabled(process);
        }
        self.clear_disable_waitlist(DisableResult::Error, actions);
    }

    fn remove_from_disable_waitlist(
        &mut self,
        gupid: &str,
        result: DisableResult,
        actions: &mut PostLockActions,
    ) {
        let mut remaining = VecDeque::new();
        while let Some(waiter) = self.disable_waitlist.pop_front() {
            if waiter.gupid == gupid {
                let callback = waiter.callback;
                actions.push(Box::new(move || callback(result)));
            } else {
                remaining.push_back(waiter);
            }
        }
        self.disable_waitlist = remaining;
    }

    fn clear_disable_waitlist(&mut self, result: DisableResult, actions: &mut PostLockActions) {
        while let Some(waiter) = self.disable_waitlist.pop_front() {
            let callback = waiter.callback;
            actions.push(Box::new(move || callback(result)));
        }
    }

    // ----- detach --------------------------------------------------------

    /// Remove a process from service and begin its shutdown. Does not
    /// touch the get wait list; callers re-dispatch afterwards.
    pub(crate) fn detach_by_gupid(&mut self, gupid: &str, actions: &mut PostLockActions) -> bool {
        let (list, index) = match self.find_process(gupid) {
            Some(found) => found,
            None => return false,
        };
        let mut process = match list {
            ListKind::Enabled => self.remove_enabled(index),
            ListKind::Disabling => {
                let process = self.disabling.remove(index);
                self.remove_from_disable_waitlist(gupid, DisableResult::Noop, actions);
                process
            }
            ListKind::Disabled => self.disabled.remove(index),
            ListKind::Detached => return false,
        };
        tracing::debug!(group = %self.name, process = %process.inspect(), "detaching process");
        process.set_shutting_down();
        self.park_or_shut_down(process, actions);
        true
    }

    /// Queue the process for full shutdown, or park it while sessions
    /// drain.
    fn park_or_shut_down(&mut self, mut process: Process, actions: &mut PostLockActions) {
        if process.sessions == 0 {
            actions.push(Box::new(process.into_shutdown_closure()));
        } else {
            debug_assert_eq!(process.life_status(), LifeStatus::ShuttingDown);
            process.enabled = Enabled::Disabled;
            self.detached.push(process);
        }
    }

    /// Detach everything. Does not touch the get wait list.
    pub(crate) fn detach_all(&mut self, actions: &mut PostLockActions) {
        let drained: Vec<Process> = self
            .enabled
            .drain(..)
            .chain(self.disabling.drain(..))
            .chain(self.disabled.drain(..))
            .collect();
        self.pqueue.clear();
        for mut process in drained {
            process.set_shutting_down();
            self.park_or_shut_down(process, actions);
        }
        self.clear_disable_waitlist(DisableResult::Noop, actions);
    }

    /// Sweep the drain list for processes whose shutdown can finish.
    pub(crate) fn sweep_detached(&mut self, actions: &mut PostLockActions) {
        let mut index = 0;
        while index < self.detached.len() {
            if self.detached[index].sessions == 0 || !self.detached[index].os_process_exists() {
                let process = self.detached.remove(index);
                actions.push(Box::new(process.into_shutdown_closure()));
            } else {
                index += 1;
            }
        }
        if self.life == GroupLife::ShuttingDown && self.shutdown_can_finish() {
            self.finish_shutdown(actions);
        }
    }

    // ----- restart -------------------------------------------------------

    fn needs_restart(&mut self, now: u64) -> bool {
        let throttle = self.options.stat_throttle_rate;
        self.restart_watch.changed(now, throttle)
    }

    /// Begin a restart: existing enabled processes drain out as
    /// disabling, already-idle ones detach immediately, and a finalize
    /// task rebuilds the spawner with the new options.
    pub(crate) fn restart(
        &mut self,
        options: Options,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) {
        debug_assert!(self.is_alive());
        if self.spawn_state == SpawnState::Restarting {
            return;
        }
        tracing::debug!(group = %self.name, "restarting group");
        self.restarts_initiated = self.restarts_initiated.wrapping_add(1);
        self.spawn_state = SpawnState::Restarting;

        // Old-version processes: idle ones go away now, busy ones drain.
        let enabled: Vec<Process> = {
            self.pqueue.clear();
            self.enabled.drain(..).collect()
        };
        for mut process in enabled {
            if process.sessions == 0 {
                process.set_shutting_down();
                self.park_or_shut_down(process, actions);
            } else {
                process.enabled = Enabled::Disabling;
                self.disabling.push(process);
            }
        }
        let disabled: Vec<Process> = self.disabled.drain(..).collect();
        for mut process in disabled {
            process.set_shutting_down();
            self.park_or_shut_down(process, actions);
        }
        // Pending disables are moot now that every old process is going
        // away.
        self.clear_disable_waitlist(DisableResult::Canceled, actions);

        tasks.push(GroupTask::FinalizeRestart {
            app_group_name: self.app_group_name.clone(),
            options,
        });
    }

    /// Swap in the spawner built for the new options and resume spawning.
    /// Returns the old spawner for cleanup outside the lock.
    pub(crate) fn finish_restart(&mut self, options: Options, spawner: Arc<Spawner>) -> Arc<Spawner> {
        debug_assert_eq!(self.spawn_state, SpawnState::Restarting);
        let mut options = options;
        options.clear_per_request_fields();
        self.restart_watch = RestartWatch::new(&options.app_root);
        self.options = options;
        let old = std::mem::replace(&mut self.spawner, spawner);
        self.spawn_state = SpawnState::NotSpawning;
        old
    }

    // ----- session close -------------------------------------------------

    /// Apply a session close and decide what follows from it.
    pub(crate) fn on_session_closed(
        &mut self,
        gupid: &str,
        socket_index: usize,
        ctx: &GroupCtx<'_>,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) -> SessionCloseOutcome {
        // Detached processes drain here and finish their shutdown on the
        // last close.
        if let Some(index) = self.detached.iter().position(|p| p.gupid == gupid) {
            self.detached[index].session_closed(socket_index);
            if self.detached[index].sessions == 0 {
                let process = self.detached.remove(index);
                actions.push(Box::new(process.into_shutdown_closure()));
                if self.life == GroupLife::ShuttingDown && self.shutdown_can_finish() {
                    self.finish_shutdown(actions);
                }
            }
            return SessionCloseOutcome::Ignored;
        }

        let Some((list, index)) = self.find_process(gupid) else {
            tracing::warn!(group = %self.name, gupid, "session closed for unknown process");
            return SessionCloseOutcome::Ignored;
        };

        let process = match list {
            ListKind::Enabled => {
                let old_key = self.enabled[index].utilization();
                self.enabled[index].session_closed(socket_index);
                let seq = self.enabled[index].queue_seq;
                let new_key = self.enabled[index].utilization();
                self.pqueue_requeue(seq, old_key, new_key);
                &self.enabled[index]
            }
            ListKind::Disabling => {
                self.disabling[index].session_closed(socket_index);
                &self.disabling[index]
            }
            ListKind::Disabled => {
                self.disabled[index].session_closed(socket_index);
                &self.disabled[index]
            }
            ListKind::Detached => unreachable!("handled above"),
        };
        debug_assert!(!process.at_full_utilization());

        // A drained old-generation process has nothing left to do.
        let stale = process.enabled == Enabled::Disabling
            && process.sessions == 0
            && process.generation != self.restarts_initiated;
        if stale {
            self.detach_by_gupid(gupid, actions);
            return SessionCloseOutcome::Detached;
        }

        let recycle = self.options.max_requests > 0
            && process.processed >= self.options.max_requests;
        if recycle {
            tracing::debug!(
                group = %self.name,
                gupid,
                max_requests = self.options.max_requests,
                "process reached its request limit, detaching"
            );
            self.detach_by_gupid(gupid, actions);
            return SessionCloseOutcome::Detached;
        }

        // Someone may be waiting for pool capacity that this now-idle
        // process is holding.
        let capacity_needed = process.sessions == 0
            && self.get_waitlist.is_empty()
            && (ctx.pool_has_waiters || ctx.another_group_waiting);
        if capacity_needed && process.enabled == Enabled::Enabled {
            tracing::debug!(
                group = %self.name,
                gupid,
                "detaching idle process to make room in the pool"
            );
            self.detach_by_gupid(gupid, actions);
            return SessionCloseOutcome::Detached;
        }

        let finished_disabling = process.enabled == Enabled::Disabling
            && process.sessions == 0
            && !self.enabled.is_empty();
        if finished_disabling {
            let mut process = self.disabling.remove(
                self.disabling
                    .iter()
                    .position(|p| p.gupid == gupid)
                    .expect("process found in disabling above"),
            );
            process.enabled = Enabled::Disabled;
            let oobw = process.oobw_requested;
            self.disabled.push(process);
            self.remove_from_disable_waitlist(gupid, DisableResult::Success, actions);
            if oobw {
                tasks.push(GroupTask::OobwCheck {
                    app_group_name: self.app_group_name.clone(),
                    gupid: gupid.to_string(),
                });
            }
            return SessionCloseOutcome::Normal;
        }

        if process.oobw_requested {
            tasks.push(GroupTask::OobwCheck {
                app_group_name: self.app_group_name.clone(),
                gupid: gupid.to_string(),
            });
        }

        if !self.get_waitlist.is_empty() {
            if let Some((ListKind::Enabled, _)) = self.find_process(gupid) {
                self.assign_sessions_to_get_waiters(ctx, actions);
            }
        }
        SessionCloseOutcome::Normal
    }

    // ----- shutdown ------------------------------------------------------

    /// Begin tearing the group down. The caller is responsible for the
    /// get wait list.
    pub(crate) fn shutdown(
        &mut self,
        callback: Option<Box<dyn FnOnce() + Send>>,
        actions: &mut PostLockActions,
    ) {
        debug_assert!(self.is_alive());
        tracing::debug!(group = %self.name, "shutting down group");
        self.shutdown_callback = callback;
        self.detach_all(actions);
        let spawner = Arc::clone(&self.spawner);
        actions.push(Box::new(move || spawner.cleanup()));
        self.life = GroupLife::ShuttingDown;
        if self.shutdown_can_finish() {
            self.finish_shutdown(actions);
        }
    }

    fn shutdown_can_finish(&self) -> bool {
        self.life == GroupLife::ShuttingDown
            && self.enabled.is_empty()
            && self.disabling.is_empty()
            && self.disabled.is_empty()
            && self.detached.is_empty()
    }

    fn finish_shutdown(&mut self, actions: &mut PostLockActions) {
        debug_assert_eq!(self.life, GroupLife::ShuttingDown);
        tracing::debug!(group = %self.name, "group shutdown finished");
        self.life = GroupLife::ShutDown;
        if let Some(callback) = self.shutdown_callback.take() {
            actions.push(callback);
        }
    }

    // ----- lookup --------------------------------------------------------

    pub(crate) fn find_process(&self, gupid: &str) -> Option<(ListKind, usize)> {
        if let Some(i) = self.enabled.iter().position(|p| p.gupid == gupid) {
            return Some((ListKind::Enabled, i));
        }
        if let Some(i) = self.disabling.iter().position(|p| p.gupid == gupid) {
            return Some((ListKind::Disabling, i));
        }
        if let Some(i) = self.disabled.iter().position(|p| p.gupid == gupid) {
            return Some((ListKind::Disabled, i));
        }
        if let Some(i) = self.detached.iter().position(|p| p.gupid == gupid) {
            return Some((ListKind::Detached, i));
        }
        None
    }

    pub(crate) fn process_by_gupid(&self, gupid: &str) -> Option<&Process> {
        let (list, index) = self.find_process(gupid)?;
        Some(match list {
            ListKind::Enabled => &self.enabled[index],
            ListKind::Disabling => &self.disabling[index],
            ListKind::Disabled => &self.disabled[index],
            ListKind::Detached => &self.detached[index],
        })
    }

    pub(crate) fn process_by_gupid_mut(&mut self, gupid: &str) -> Option<&mut Process> {
        let (list, index) = self.find_process(gupid)?;
        Some(match list {
            ListKind::Enabled => &mut self.enabled[index],
            ListKind::Disabling => &mut self.disabling[index],
            ListKind::Disabled => &mut self.disabled[index],
            ListKind::Detached => &mut self.detached[index],
        })
    }

    /// Debug-build consistency checks, run at the end of public pool
    /// operations.
    pub(crate) fn debug_verify(&self) {
        debug_assert_eq!(self.pqueue.len(), self.enabled.len());
        for process in &self.enabled {
            debug_assert_eq!(process.enabled, Enabled::Enabled);
            debug_assert!(process.is_alive());
            debug_assert!(self
                .pqueue
                .contains(&(process.utilization(), process.queue_seq)));
        }
        for process in &self.disabling {
            debug_assert_eq!(process.enabled, Enabled::Disabling);
        }
        for process in &self.disabled {
            debug_assert_eq!(process.enabled, Enabled::Disabled);
        }
        if !self.get_waitlist.is_empty() {
            debug_assert!(self.enabled.is_empty() || self.queue_top_at_full_utilization());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListKind {
    Enabled,
    Disabling,
    Disabled,
    Detached,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SpawnMethod;
    use crate::pool::process::dummy_process;
    use crate::spawn::{SpawnerConfig, SpawnerFactory};
    use std::sync::Weak;

    fn test_group(concurrency: u32) -> Group {
        let mut options = Options::new("/srv/app");
        options.spawn_method = SpawnMethod::Dummy;
        let factory = SpawnerFactory {
            config: SpawnerConfig {
                dummy_concurrency: concurrency,
                ..SpawnerConfig::default()
            },
            ..SpawnerFactory::default()
        };
        let spawner = factory.create(&options);
        Group::new("/srv/app", options, spawner)
    }

    fn ctx(pool: &Weak<Pool>) -> GroupCtx<'_> {
        GroupCtx {
            now: crate::pool::clock::now_usec(),
            pool,
            pool_at_full_capacity: false,
            pool_has_waiters: false,
            another_group_waiting: false,
        }
    }

    fn attach_n(group: &mut Group, n: usize, concurrency: u32) {
        let mut actions = PostLockActions::new();
        for i in 0..n {
            group.attach(dummy_process(&format!("g{i}"), concurrency), &mut actions);
        }
        crate::pool::run_post_lock_actions(actions);
    }

    #[test]
    fn get_routes_to_least_utilized_process() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(2);
        attach_n(&mut group, 2, 2);
        let ctx = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();

        let options = group.options.clone();
        let r1 = group.get(&options, Box::new(|_| {}), &ctx, &mut actions, &mut tasks);
        let GetResult::CheckedOut(s1, _) = r1 else {
            panic!("expected a session");
        };
        let r2 = group.get(&options, Box::new(|_| {}), &ctx, &mut actions, &mut tasks);
        let GetResult::CheckedOut(s2, _) = r2 else {
            panic!("expected a session");
        };
        // Two processes, both idle at the start: the two checkouts must
        // land on different processes.
        assert_ne!(s1.gupid(), s2.gupid());
        group.debug_verify();
        // No pool behind the weak handle: silence the close signal.
        drop(s1);
        drop(s2);
    }

    #[test]
    fn get_queues_when_all_processes_full() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(1);
        attach_n(&mut group, 1, 1);
        let ctx = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();
        let options = group.options.clone();

        let r1 = group.get(&options, Box::new(|_| {}), &ctx, &mut actions, &mut tasks);
        assert!(matches!(r1, GetResult::CheckedOut(..)));
        let r2 = group.get(&options, Box::new(|_| {}), &ctx, &mut actions, &mut tasks);
        assert!(matches!(r2, GetResult::Queued));
        assert_eq!(group.get_waitlist_size(), 1);
        // The group is at full utilization with a waiter: a spawn must
        // have been triggered.
        assert!(group.spawning());
        assert!(tasks
            .iter()
            .any(|task| matches!(task, GroupTask::Spawn(_))));
        group.debug_verify();
    }

    #[test]
    fn no_op_get_reserves_without_session() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(1);
        let ctx = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();
        let mut options = group.options.clone();
        options.no_op = true;

        let result = group.get(&options, Box::new(|_| {}), &ctx, &mut actions, &mut tasks);
        let GetResult::CheckedOut(session, _) = result else {
            panic!("no-op get must produce a session handle");
        };
        assert!(session.is_no_op());
        assert_eq!(group.process_count(), 0);
    }

    #[test]
    fn disable_with_sessions_defers_until_drain() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(2);
        attach_n(&mut group, 2, 2);
        let ctx_v = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();
        let options = group.options.clone();

        let GetResult::CheckedOut(session, _) =
            group.get(&options, Box::new(|_| {}), &ctx_v, &mut actions, &mut tasks)
        else {
            panic!("expected session");
        };
        let gupid = session.gupid().to_string();
        let socket_index = 0;

        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let result = group.disable(
            &gupid,
            Box::new(move |r| {
                let _ = done_tx.send(r);
            }),
            &mut tasks,
        );
        assert_eq!(result, DisableResult::Deferred);
        assert_eq!(group.disabling_count(), 1);
        assert_eq!(group.enabled_count(), 1);

        let outcome =
            group.on_session_closed(&gupid, socket_index, &ctx_v, &mut actions, &mut tasks);
        assert_eq!(outcome, SessionCloseOutcome::Normal);
        assert_eq!(group.disabled_count(), 1);
        crate::pool::run_post_lock_actions(actions);
        assert_eq!(done_rx.try_recv().unwrap(), DisableResult::Success);
        // Session already accounted; forget the handle silently.
        std::mem::forget(session);
        group.debug_verify();
    }

    #[test]
    fn disable_idle_process_succeeds_immediately() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(1);
        attach_n(&mut group, 2, 1);
        let _ = ctx(&weak);
        let mut tasks = Vec::new();
        let gupid = group.enabled[0].gupid.clone();
        let result = group.disable(&gupid, Box::new(|_| {}), &mut tasks);
        assert_eq!(result, DisableResult::Success);
        assert_eq!(group.enabled_count(), 1);
        assert_eq!(group.disabled_count(), 1);
        group.debug_verify();
    }

    #[test]
    fn disabling_last_process_spawns_replacement() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(1);
        attach_n(&mut group, 1, 1);
        let _ = ctx(&weak);
        let mut tasks = Vec::new();
        let gupid = group.enabled[0].gupid.clone();
        let result = group.disable(&gupid, Box::new(|_| {}), &mut tasks);
        assert_eq!(result, DisableResult::Deferred);
        assert!(group.spawning());
        assert!(tasks
            .iter()
            .any(|task| matches!(task, GroupTask::Spawn(_))));
    }

    #[test]
    fn restart_detaches_idle_and_drains_busy() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(2);
        attach_n(&mut group, 2, 2);
        let ctx_v = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();
        let options = group.options.clone();

        // One busy process, one idle.
        let GetResult::CheckedOut(session, _) =
            group.get(&options, Box::new(|_| {}), &ctx_v, &mut actions, &mut tasks)
        else {
            panic!("expected session");
        };
        let busy_gupid = session.gupid().to_string();

        group.restart(options.clone(), &mut actions, &mut tasks);
        assert!(group.restarting());
        assert_eq!(group.enabled_count(), 0);
        assert_eq!(group.disabling_count(), 1);
        assert!(tasks
            .iter()
            .any(|task| matches!(task, GroupTask::FinalizeRestart { .. })));

        // Finish the restart and let the drained old process detach on
        // session close.
        let factory = SpawnerFactory::default();
        let spawner = factory.create(&options);
        let old = group.finish_restart(options.clone(), spawner);
        drop(old);
        assert!(!group.restarting());

        let outcome =
            group.on_session_closed(&busy_gupid, 0, &ctx_v, &mut actions, &mut tasks);
        assert_eq!(outcome, SessionCloseOutcome::Detached);
        assert_eq!(group.disabling_count(), 0);
        crate::pool::run_post_lock_actions(actions);
        std::mem::forget(session);
        group.debug_verify();
    }

    #[test]
    fn spawn_failure_reenables_disabling_and_fans_out_error() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(1);
        attach_n(&mut group, 1, 1);
        let _ = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();

        let gupid = group.enabled[0].gupid.clone();
        let (disable_tx, disable_rx) = crossbeam::channel::bounded(1);
        // Put a session on the process so the disable defers.
        let ctx_v = ctx(&weak);
        let options = group.options.clone();
        let GetResult::CheckedOut(session, _) =
            group.get(&options, Box::new(|_| {}), &ctx_v, &mut actions, &mut tasks)
        else {
            panic!("expected session");
        };
        group.disable(
            &gupid,
            Box::new(move |r| {
                let _ = disable_tx.send(r);
            }),
            &mut tasks,
        );
        assert_eq!(group.enabled_count(), 0);
        std::mem::forget(session);

        // Waiter arrives while everything is draining.
        let (get_tx, get_rx) = crossbeam::channel::bounded(1);
        group.get_waitlist.push_back(GetWaiter::new(
            group.options.clone(),
            Box::new(move |outcome| {
                let _ = get_tx.send(outcome.map(|_| ()).map_err(|e| e.to_string()));
            }),
        ));

        // The spawn fails: disabling processes come back, waiters get the
        // error.
        let error = Arc::new(SpawnError::new(
            crate::spawn::SpawnErrorKind::AppStartupTimeout,
            "the application did not start in time",
        ));
        group.enable_all_disabling(&mut actions);
        group.assign_error_to_get_waiters(&error, &mut actions);
        crate::pool::run_post_lock_actions(actions);

        assert_eq!(group.enabled_count(), 1);
        assert_eq!(disable_rx.try_recv().unwrap(), DisableResult::Error);
        let got = get_rx.try_recv().unwrap();
        assert!(got.unwrap_err().contains("did not start in time"));
        group.debug_verify();
    }

    #[test]
    fn max_requests_recycles_process_on_close() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(4);
        attach_n(&mut group, 1, 4);
        group.options.max_requests = 1;
        let ctx_v = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();
        let options = group.options.clone();

        let GetResult::CheckedOut(session, _) =
            group.get(&options, Box::new(|_| {}), &ctx_v, &mut actions, &mut tasks)
        else {
            panic!("expected session");
        };
        let gupid = session.gupid().to_string();
        let outcome = group.on_session_closed(&gupid, 0, &ctx_v, &mut actions, &mut tasks);
        assert_eq!(outcome, SessionCloseOutcome::Detached);
        assert_eq!(group.enabled_count(), 0);
        crate::pool::run_post_lock_actions(actions);
        std::mem::forget(session);
    }

    #[test]
    fn capacity_needed_detach_frees_idle_process() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(1);
        attach_n(&mut group, 1, 1);
        let mut ctx_v = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();
        let options = group.options.clone();

        let GetResult::CheckedOut(session, _) =
            group.get(&options, Box::new(|_| {}), &ctx_v, &mut actions, &mut tasks)
        else {
            panic!("expected session");
        };
        let gupid = session.gupid().to_string();

        ctx_v.pool_has_waiters = true;
        let outcome = group.on_session_closed(&gupid, 0, &ctx_v, &mut actions, &mut tasks);
        assert_eq!(outcome, SessionCloseOutcome::Detached);
        assert_eq!(group.process_count(), 0);
        crate::pool::run_post_lock_actions(actions);
        std::mem::forget(session);
    }

    #[test]
    fn group_shutdown_waits_for_draining_sessions() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(2);
        attach_n(&mut group, 1, 2);
        let ctx_v = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();
        let options = group.options.clone();

        let GetResult::CheckedOut(session, _) =
            group.get(&options, Box::new(|_| {}), &ctx_v, &mut actions, &mut tasks)
        else {
            panic!("expected session");
        };
        let gupid = session.gupid().to_string();

        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        group.shutdown(
            Some(Box::new(move || {
                let _ = done_tx.send(());
            })),
            &mut actions,
        );
        crate::pool::run_post_lock_actions(std::mem::take(&mut actions));
        assert!(done_rx.try_recv().is_err(), "a session is still draining");

        let outcome = group.on_session_closed(&gupid, 0, &ctx_v, &mut actions, &mut tasks);
        assert_eq!(outcome, SessionCloseOutcome::Ignored);
        crate::pool::run_post_lock_actions(actions);
        assert!(done_rx.try_recv().is_ok(), "shutdown completes after drain");
        std::mem::forget(session);
    }

    #[test]
    fn touching_restart_file_triggers_restart_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let app_root = dir.path().to_str().unwrap().to_string();
        let mut options = Options::new(&app_root);
        options.spawn_method = SpawnMethod::Dummy;
        let spawner = SpawnerFactory::default().create(&options);
        let mut group = Group::new(&app_root, options.clone(), spawner);

        let weak: Weak<Pool> = Weak::new();
        let ctx_v = ctx(&weak);
        let mut actions = PostLockActions::new();
        let mut tasks = Vec::new();

        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("tmp").join("restart.txt"), b"now").unwrap();

        let result = group.get(&options, Box::new(|_| {}), &ctx_v, &mut actions, &mut tasks);
        assert!(matches!(result, GetResult::Queued));
        assert!(group.restarting(), "restart file appearance restarts the group");
        assert!(tasks
            .iter()
            .any(|task| matches!(task, GroupTask::FinalizeRestart { .. })));
    }

    #[test]
    fn should_spawn_respects_group_and_pool_limits() {
        let weak: Weak<Pool> = Weak::new();
        let mut group = test_group(1);
        group.options.min_processes = 2;
        let mut ctx_v = ctx(&weak);
        assert!(group.should_spawn(&ctx_v), "below min_processes");

        ctx_v.pool_at_full_capacity = true;
        assert!(!group.should_spawn(&ctx_v), "pool full");

        ctx_v.pool_at_full_capacity = false;
        group.options.min_processes = 0;
        group.options.max_processes = 1;
        attach_n(&mut group, 1, 1);
        group.get_waitlist.push_back(GetWaiter::new(
            group.options.clone(),
            Box::new(|_| {}),
        ));
        assert!(
            !group.should_spawn(&ctx_v),
            "group already at its own max_processes"
        );
    }
}
