//! The process pool.
//!
//! Provides:
//! - [`Pool`] - global admission, capacity accounting, background reaping
//! - [`Group`] - per-application routing and process lifecycle
//! - [`SuperGroup`] - container of groups sharing one app group name
//! - [`Process`] / [`Session`] - workers and checked-out request slots
//!
//! Every mutation of pool state happens under one mutex. Callbacks and
//! other side effects never run while that mutex is held: methods collect
//! them as *post-lock actions* and run them after release.

pub mod clock;
pub mod core;
pub mod group;
pub mod process;
pub mod session;
pub mod snapshot;
pub mod supergroup;

use std::sync::{Arc, Condvar, Mutex};

use crate::options::Options;
use crate::spawn::SpawnError;

pub use self::core::Pool;
pub use group::Group;
pub use process::{
    Enabled, LifeStatus, Process, ProcessMetrics, Socket, SocketAddress, SocketProtocol,
};
pub use session::Session;
pub use supergroup::{SuperGroup, SuperGroupState};

/// Closures scheduled while the pool lock is held and executed in order
/// after it is released. Carrying callbacks and heavy side effects out of
/// the critical section is the pool's rule against deadlock and
/// reentrancy.
pub type PostLockActions = Vec<Box<dyn FnOnce() + Send>>;

pub(crate) fn run_post_lock_actions(actions: PostLockActions) {
    for action in actions {
        action();
    }
}

/// Delivered to a `get` caller: a session, or the reason there is none.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GetError {
    /// Spawning a worker for the caller's group failed. The same error is
    /// fanned out to every waiter of that group.
    #[error(transparent)]
    Spawn(Arc<SpawnError>),
    /// The caller's supergroup was detached while the caller was waiting.
    #[error("get aborted: {0}")]
    Aborted(String),
    /// The pool is shutting down and no longer serves sessions.
    #[error("the pool is shutting down")]
    ShuttingDown,
}

/// Callback invoked with the outcome of an asynchronous `get`.
pub type GetCallback = Box<dyn FnOnce(Result<Session, GetError>) + Send>;

/// Callback invoked with the final outcome of a deferred disable.
pub type DisableCallback = Box<dyn FnOnce(DisableResult) + Send>;

/// Outcome of disabling a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableResult {
    /// The process is now disabled.
    Success,
    /// The disable was superseded (e.g. the process was re-enabled or the
    /// group restarted) before it completed.
    Canceled,
    /// The process does not exist (anymore) or was already disabled.
    Noop,
    /// The disable failed.
    Error,
    /// The process is draining; the callback fires when its last session
    /// closes.
    Deferred,
}

/// Result of tearing down a supergroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownResult {
    Success,
    Canceled,
}

/// A pending `get` that could not be served immediately.
pub struct GetWaiter {
    pub options: Options,
    pub callback: GetCallback,
}

impl GetWaiter {
    /// Park a request. The options are kept verbatim: per-request fields
    /// like `no_op` must survive queueing and re-dispatch.
    pub fn new(options: Options, callback: GetCallback) -> Self {
        GetWaiter { options, callback }
    }
}

impl std::fmt::Debug for GetWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetWaiter")
            .field("app_group_name", &self.options.app_group_name())
            .finish_non_exhaustive()
    }
}

/// Rendezvous between the synchronous [`Pool::get`] and the callback of
/// its underlying `async_get`.
#[derive(Default)]
pub struct Ticket {
    slot: Mutex<Option<Result<Session, GetError>>>,
    cond: Condvar,
}

impl Ticket {
    pub fn new() -> Arc<Self> {
        Arc::new(Ticket::default())
    }

    pub(crate) fn fulfill(&self, outcome: Result<Session, GetError>) {
        let mut slot = self.slot.lock().expect("ticket mutex poisoned");
        *slot = Some(outcome);
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) -> Result<Session, GetError> {
        let mut slot = self.slot.lock().expect("ticket mutex poisoned");
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = self.cond.wait(slot).expect("ticket mutex poisoned");
        }
    }
}
