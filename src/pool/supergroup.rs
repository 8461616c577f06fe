//! Containers of one or more groups sharing an app group name.
//!
//! A supergroup exists so that one logical application can, in principle,
//! be served by several process families behind a single name; the common
//! case is exactly one default group. Its main job is the initialization
//! state machine: `get` requests arriving before the default group exists
//! wait on the supergroup's own list and migrate to the group once it is
//! ready.

use std::collections::VecDeque;

use crate::options::Options;
use crate::pool::group::{GetResult, Group, GroupCtx, GroupLife, GroupTask};
use crate::pool::{
    GetCallback, GetError, GetWaiter, PostLockActions, ShutdownResult,
};
use crate::spawn::{self, SpawnerFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperGroupState {
    /// Created; the default group does not exist yet.
    Initializing,
    /// Groups exist and serve requests.
    Ready,
    /// Transient: re-entering `Ready` with updated options.
    Restarting,
    /// Being torn down; groups are shutting down.
    Destroying,
    /// Fully torn down; no processes remain.
    Destroyed,
}

impl SuperGroupState {
    pub fn as_str(self) -> &'static str {
        match self {
            SuperGroupState::Initializing => "initializing",
            SuperGroupState::Ready => "ready",
            SuperGroupState::Restarting => "restarting",
            SuperGroupState::Destroying => "destroying",
            SuperGroupState::Destroyed => "destroyed",
        }
    }
}

pub struct SuperGroup {
    /// The app group name.
    pub name: String,
    /// Secret for out-of-band control calls addressing this supergroup.
    pub secret: String,
    pub state: SuperGroupState,
    pub(crate) groups: Vec<Group>,
    /// Holds `get` callers only while `Initializing`; migrated to the
    /// default group on becoming `Ready`.
    pub(crate) get_waitlist: VecDeque<GetWaiter>,
    pub options: Options,
    /// Guards initialization against a supergroup that was destroyed and
    /// re-created under the same name while the init task was in flight.
    pub(crate) generation: u64,
    pub(crate) shutdown_callback: Option<Box<dyn FnOnce(ShutdownResult) + Send>>,
}

impl SuperGroup {
    pub(crate) fn new(mut options: Options, generation: u64) -> Self {
        options.clear_per_request_fields();
        SuperGroup {
            name: options.app_group_name().to_string(),
            secret: spawn::generate_secret(),
            state: SuperGroupState::Initializing,
            groups: Vec::new(),
            get_waitlist: VecDeque::new(),
            options,
            generation,
            shutdown_callback: None,
        }
    }

    pub fn default_group(&self) -> Option<&Group> {
        self.groups.first()
    }

    pub(crate) fn default_group_mut(&mut self) -> Option<&mut Group> {
        self.groups.first_mut()
    }

    /// Capacity units consumed by this supergroup. An initializing
    /// supergroup counts as one, so admission cannot overshoot while the
    /// first spawn is still being set up.
    pub fn utilization(&self) -> usize {
        match self.state {
            SuperGroupState::Initializing => 1,
            _ => self.groups.iter().map(Group::utilization).sum(),
        }
    }

    pub fn process_count(&self) -> usize {
        self.groups.iter().map(Group::process_count).sum()
    }

    pub fn get_waitlist_size(&self) -> usize {
        self.get_waitlist.len()
    }

    pub(crate) fn is_alive(&self) -> bool {
        !matches!(
            self.state,
            SuperGroupState::Destroying | SuperGroupState::Destroyed
        )
    }

    /// Dispatch a `get`: park it while initializing, delegate once ready.
    pub(crate) fn get(
        &mut self,
        options: &Options,
        callback: GetCallback,
        ctx: &GroupCtx<'_>,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) -> GetResult {
        match self.state {
            SuperGroupState::Initializing => {
                self.get_waitlist
                    .push_back(GetWaiter::new(options.clone(), callback));
                GetResult::Queued
            }
            SuperGroupState::Ready | SuperGroupState::Restarting => {
                let group = self
                    .groups
                    .first_mut()
                    .expect("a ready supergroup has a default group");
                group.get(options, callback, ctx, actions, tasks)
            }
            SuperGroupState::Destroying | SuperGroupState::Destroyed => {
                actions.push(Box::new(move || {
                    callback(Err(GetError::Aborted(
                        "the application's supergroup is being detached".to_string(),
                    )))
                }));
                GetResult::Queued
            }
        }
    }

    /// Complete initialization: create the default group, become `Ready`,
    /// and hand the parked waiters back. The pool re-dispatches them with
    /// freshly computed capacity facts (this supergroup no longer counts
    /// as a reserved unit once it is ready).
    pub(crate) fn promote_to_ready(&mut self, factory: &SpawnerFactory) -> Vec<GetWaiter> {
        debug_assert_eq!(self.state, SuperGroupState::Initializing);
        let spawner = factory.create(&self.options);
        let group = Group::new(&self.name, self.options.clone(), spawner);
        self.groups.push(group);
        self.state = SuperGroupState::Ready;
        tracing::debug!(supergroup = %self.name, "supergroup initialized");
        self.get_waitlist.drain(..).collect()
    }

    /// Restart every group with updated options. The supergroup itself
    /// passes through `Restarting` and returns to `Ready` in the same
    /// critical section; the groups keep draining in the background.
    pub(crate) fn restart(
        &mut self,
        options: Options,
        actions: &mut PostLockActions,
        tasks: &mut Vec<GroupTask>,
    ) {
        if self.state != SuperGroupState::Ready {
            return;
        }
        self.state = SuperGroupState::Restarting;
        self.options = options.clone();
        for group in &mut self.groups {
            if !group.restarting() {
                group.restart(options.clone(), actions, tasks);
            }
        }
        self.state = SuperGroupState::Ready;
    }

    /// Begin teardown: abort all waiters and shut every group down. The
    /// pool keeps the supergroup in its detached list until every group
    /// reports `ShutDown`, then fires the callback.
    pub(crate) fn destroy(
        &mut self,
        callback: Option<Box<dyn FnOnce(ShutdownResult) + Send>>,
        actions: &mut PostLockActions,
    ) {
        debug_assert!(self.is_alive());
        tracing::debug!(supergroup = %self.name, "destroying supergroup");
        self.shutdown_callback = callback;
        self.state = SuperGroupState::Destroying;

        while let Some(waiter) = self.get_waitlist.pop_front() {
            actions.push(Box::new(move || {
                (waiter.callback)(Err(GetError::Aborted(
                    "the containing supergroup was detached".to_string(),
                )))
            }));
        }
        for group in &mut self.groups {
            group.abort_get_waiters("the containing supergroup was detached", actions);
            if group.is_alive() {
                group.shutdown(None, actions);
            }
        }
    }

    /// Whether teardown has finished; if so, flips to `Destroyed` and
    /// fires the shutdown callback.
    pub(crate) fn try_finish_destroy(&mut self, actions: &mut PostLockActions) -> bool {
        if self.state != SuperGroupState::Destroying {
            return self.state == SuperGroupState::Destroyed;
        }
        if self.groups.iter().all(|g| g.life() == GroupLife::ShutDown) {
            self.state = SuperGroupState::Destroyed;
            if let Some(callback) = self.shutdown_callback.take() {
                actions.push(Box::new(move || callback(ShutdownResult::Success)));
            }
            tracing::debug!(supergroup = %self.name, "supergroup destroyed");
            return true;
        }
        false
    }

    /// Drop a still-draining supergroup at pool shutdown: its teardown is
    /// cut short.
    pub(crate) fn cancel_destroy(&mut self, actions: &mut PostLockActions) {
        if let Some(callback) = self.shutdown_callback.take() {
            actions.push(Box::new(move || callback(ShutdownResult::Canceled)));
        }
        self.state = SuperGroupState::Destroyed;
    }

    pub(crate) fn debug_verify(&self) {
        match self.state {
            SuperGroupState::Initializing => debug_assert!(self.groups.is_empty()),
            SuperGroupState::Ready | SuperGroupState::Restarting => {
                debug_assert!(!self.groups.is_empty());
                debug_assert!(self.get_waitlist.is_empty());
            }
            SuperGroupState::Destroying | SuperGroupState::Destroyed => {
                debug_assert!(self.get_waitlist.is_empty());
            }
        }
        for group in &self.groups {
            group.debug_verify();
        }
    }
}
