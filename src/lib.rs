#![forbid(unsafe_code)]

//! An application process pool for a multi-language web application host.
//!
//! The host accepts HTTP-like requests and dispatches each one to a worker
//! process of the correct application, identified by an app group name.
//! Worker processes are created on demand through a negotiated startup
//! protocol, reused across requests, bounded by a global capacity limit,
//! disabled/drained/replaced on request, and reaped when idle.
//!
//! The entry point is [`pool::Pool`]: callers obtain [`pool::Session`]
//! handles via [`pool::Pool::async_get`] or the blocking
//! [`pool::Pool::get`], perform request I/O against the session's socket,
//! and close the session when done.

pub mod config;
pub mod error;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod spawn;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use options::Options;
pub use pool::{DisableResult, GetError, Pool, Session, Ticket};
pub use spawn::{SpawnError, SpawnErrorKind, Spawner, SpawnerConfig, SpawnerFactory};
