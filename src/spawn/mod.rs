//! Worker spawning.
//!
//! A spawner turns [`Options`] into a negotiated [`Process`]. Three
//! variants exist:
//! - [`DirectSpawner`] forks and execs a fresh worker per spawn,
//! - [`SmartSpawner`] keeps a preloader resident and asks it to fork
//!   workers on command,
//! - [`DummySpawner`] fabricates in-memory workers for tests.
//!
//! All real spawning funnels through the negotiation protocol in
//! [`protocol`]: a line-based handshake over the child's stdout that
//! passes identity and options down and receives advertised listener
//! sockets back.

pub mod direct;
pub mod dummy;
pub mod protocol;
pub mod smart;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::options::{Options, SpawnMethod};
use crate::pool::process::Process;
use crate::pool::clock;

pub use direct::DirectSpawner;
pub use dummy::DummySpawner;
pub use smart::SmartSpawner;

/// How long a worker gets to exit after its admin channel is closed
/// before it is killed.
pub const SHUTDOWN_GRACE_MS: u64 = 5_000;

/// What went wrong while spawning a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorKind {
    /// The preloader violated the startup protocol.
    PreloaderStartupProtocolError,
    /// The preloader did not finish starting within the timeout.
    PreloaderStartupTimeout,
    /// The worker violated the startup protocol.
    AppStartupProtocolError,
    /// The worker did not finish starting within the timeout.
    AppStartupTimeout,
    /// The worker reported a structured startup error of its own.
    AppStartupExplainableError,
    /// A bug or unexpected condition on our side.
    InternalError,
}

impl SpawnErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpawnErrorKind::PreloaderStartupProtocolError => "preloader_startup_protocol_error",
            SpawnErrorKind::PreloaderStartupTimeout => "preloader_startup_timeout",
            SpawnErrorKind::AppStartupProtocolError => "app_startup_protocol_error",
            SpawnErrorKind::AppStartupTimeout => "app_startup_timeout",
            SpawnErrorKind::AppStartupExplainableError => "app_startup_explainable_error",
            SpawnErrorKind::InternalError => "internal_error",
        }
    }
}

/// A failed spawn, carrying whatever the worker wrote to stderr so the
/// HTTP layer can render a diagnostic page.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SpawnError {
    pub kind: SpawnErrorKind,
    pub message: String,
    /// Stderr captured from the child while negotiation was in progress.
    pub stderr_output: String,
    /// Whether `error_body` is HTML, as declared by the worker.
    pub html: bool,
    /// Error body the worker sent after an `Error` response.
    pub error_body: String,
    /// Remaining key/value attributes from the worker's error block.
    pub attributes: BTreeMap<String, String>,
}

impl SpawnError {
    pub fn new(kind: SpawnErrorKind, message: impl Into<String>) -> Self {
        SpawnError {
            kind,
            message: message.into(),
            stderr_output: String::new(),
            html: false,
            error_body: String::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_stderr(mut self, stderr_output: String) -> Self {
        self.stderr_output = stderr_output;
        self
    }
}

/// Which side of the smart spawner a negotiation is talking to. Timeouts
/// and protocol violations map to different error kinds per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPhase {
    Preloader,
    App,
}

impl SpawnPhase {
    pub fn timeout_kind(self) -> SpawnErrorKind {
        match self {
            SpawnPhase::Preloader => SpawnErrorKind::PreloaderStartupTimeout,
            SpawnPhase::App => SpawnErrorKind::AppStartupTimeout,
        }
    }

    pub fn protocol_kind(self) -> SpawnErrorKind {
        match self {
            SpawnPhase::Preloader => SpawnErrorKind::PreloaderStartupProtocolError,
            SpawnPhase::App => SpawnErrorKind::AppStartupProtocolError,
        }
    }
}

/// Paths and identity of the enclosing host installation, passed to every
/// worker during negotiation.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub root: PathBuf,
    pub version: String,
    pub ruby_libdir: PathBuf,
    pub generation_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        HostPaths {
            root: PathBuf::from("/usr/local/lib/berth"),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ruby_libdir: PathBuf::from("/usr/local/lib/berth/ruby"),
            generation_dir: PathBuf::from("/tmp/berth"),
        }
    }
}

/// Tuning knobs shared by all spawner variants.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Forward worker stdout lines to the log at info level (debug
    /// otherwise).
    pub forward_stdout: bool,
    /// Forward worker stderr lines to the log after a successful spawn.
    pub forward_stderr: bool,
    /// Dummy spawner: per-worker session-socket concurrency.
    pub dummy_concurrency: u32,
    /// Dummy spawner: artificial spawn latency.
    pub dummy_spawn_time_ms: u64,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        SpawnerConfig {
            forward_stdout: true,
            forward_stderr: true,
            dummy_concurrency: 1,
            dummy_spawn_time_ms: 0,
        }
    }
}

/// A capability that produces worker processes. May block; never called
/// while the pool lock is held.
pub enum Spawner {
    Direct(DirectSpawner),
    Smart(SmartSpawner),
    Dummy(DummySpawner),
}

impl Spawner {
    pub fn spawn(&self, options: &Options) -> Result<Process, SpawnError> {
        if options.raise_internal_error {
            return Err(SpawnError::new(
                SpawnErrorKind::InternalError,
                "an internal error was requested",
            ));
        }
        match self {
            Spawner::Direct(spawner) => spawner.spawn(options),
            Spawner::Smart(spawner) => spawner.spawn(options),
            Spawner::Dummy(spawner) => spawner.spawn(options),
        }
    }

    /// Whether this spawner holds resources worth reaping when idle.
    pub fn cleanable(&self) -> bool {
        match self {
            Spawner::Smart(spawner) => spawner.cleanable(),
            Spawner::Direct(_) | Spawner::Dummy(_) => false,
        }
    }

    /// Last time this spawner produced a worker, µs.
    pub fn last_used(&self) -> u64 {
        match self {
            Spawner::Direct(spawner) => spawner.last_used(),
            Spawner::Smart(spawner) => spawner.last_used(),
            Spawner::Dummy(spawner) => spawner.last_used(),
        }
    }

    /// Release idle resources (the smart spawner's preloader). May block;
    /// call outside the pool lock.
    pub fn cleanup(&self) {
        if let Spawner::Smart(spawner) = self {
            spawner.cleanup();
        }
    }

    pub fn creation_time(&self) -> u64 {
        match self {
            Spawner::Direct(spawner) => spawner.creation_time(),
            Spawner::Smart(spawner) => spawner.creation_time(),
            Spawner::Dummy(spawner) => spawner.creation_time(),
        }
    }
}

/// Chooses and builds the right spawner variant for a group's options.
#[derive(Debug, Clone, Default)]
pub struct SpawnerFactory {
    pub host: HostPaths,
    pub config: SpawnerConfig,
}

impl SpawnerFactory {
    pub fn new(host: HostPaths, config: SpawnerConfig) -> Self {
        SpawnerFactory { host, config }
    }

    pub fn create(&self, options: &Options) -> Arc<Spawner> {
        let spawner = match options.spawn_method {
            SpawnMethod::Direct => {
                Spawner::Direct(DirectSpawner::new(self.host.clone(), self.config.clone()))
            }
            SpawnMethod::Smart => {
                Spawner::Smart(SmartSpawner::new(
                    self.host.clone(),
                    self.config.clone(),
                    options.clone(),
                ))
            }
            SpawnMethod::Dummy => Spawner::Dummy(DummySpawner::new(self.config.clone())),
        };
        Arc::new(spawner)
    }
}

/// Globally unique process id: a coarse time prefix plus random ASCII,
/// never reused and distinct from the OS pid.
pub fn generate_gupid() -> String {
    let minutes = clock::now_usec() / 60_000_000;
    format!("{:x}-{}", minutes, random_ascii(11))
}

/// Password a client must present when connecting to the worker.
pub fn generate_connect_password() -> String {
    random_ascii(43)
}

/// Secret identifying a supergroup for out-of-band control calls.
pub fn generate_secret() -> String {
    random_ascii(43)
}

fn random_ascii(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gupid_shape() {
        let gupid = generate_gupid();
        let (prefix, suffix) = gupid.split_once('-').expect("time prefix");
        assert!(u64::from_str_radix(prefix, 16).is_ok());
        assert_eq!(suffix.len(), 11);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn connect_password_length() {
        assert_eq!(generate_connect_password().len(), 43);
    }

    #[test]
    fn factory_picks_variant() {
        let factory = SpawnerFactory::default();
        let mut options = Options::new("/srv/app");
        options.spawn_method = SpawnMethod::Dummy;
        assert!(matches!(*factory.create(&options), Spawner::Dummy(_)));
        options.spawn_method = SpawnMethod::Direct;
        assert!(matches!(*factory.create(&options), Spawner::Direct(_)));
        options.spawn_method = SpawnMethod::Smart;
        assert!(matches!(*factory.create(&options), Spawner::Smart(_)));
    }

    #[test]
    fn internal_error_hook_fires_before_any_io() {
        let factory = SpawnerFactory::default();
        let mut options = Options::new("/srv/app");
        options.spawn_method = SpawnMethod::Dummy;
        options.raise_internal_error = true;
        let spawner = factory.create(&options);
        let err = spawner.spawn(&options).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::InternalError);
    }
}
