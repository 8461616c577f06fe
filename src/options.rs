//! Per-request pool options.
//!
//! Every `get` carries an [`Options`] value describing the application the
//! caller wants a session for and how its workers should be spawned. The
//! pool snapshots these options per group; a later `get` on the same group
//! merges only the volatile subset (see [`Options::merge_volatile`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How worker processes are spawned for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMethod {
    /// Fork+exec a fresh worker per spawn.
    Direct,
    /// Keep a preloader process resident and fork workers from it.
    #[default]
    Smart,
    /// In-memory fake workers, for tests.
    Dummy,
}

impl SpawnMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            SpawnMethod::Direct => "direct",
            SpawnMethod::Smart => "smart",
            SpawnMethod::Dummy => "dummy",
        }
    }
}

/// The concurrency model a worker advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyModel {
    #[default]
    Process,
    Thread,
}

impl ConcurrencyModel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConcurrencyModel::Process => "process",
            ConcurrencyModel::Thread => "thread",
        }
    }
}

/// Options recognized by `Pool::get` and friends.
///
/// `app_root` is required; `app_group_name` defaults to `app_root`. All
/// other fields have usable defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Absolute path to the application root directory.
    pub app_root: String,
    /// Canonical key identifying one logical application. Distinct
    /// configurations with different keys are isolated into different
    /// supergroups. Empty means "use `app_root`".
    pub app_group_name: String,
    /// Application type tag (informational, forwarded to the worker).
    pub app_type: String,
    /// Command used to start a worker, argv style. The first element is
    /// the executable.
    pub start_command: Vec<String>,
    /// Command used to start a preloader for the smart spawn method.
    /// Empty means "use `start_command`".
    pub preloader_command: Vec<String>,
    /// Total spawn negotiation timeout in milliseconds.
    pub start_timeout_ms: u64,
    /// Deployment environment name, e.g. "production".
    pub environment: String,
    /// URI prefix the application is mounted under.
    pub base_uri: String,
    /// User to run workers as (informational here; privilege dropping is
    /// the spawner mechanism's concern).
    pub user: String,
    pub group: String,
    pub default_user: String,
    pub default_group: String,
    /// Lower bound of enabled processes kept per group.
    pub min_processes: usize,
    /// Upper bound of processes per group. 0 means unlimited.
    pub max_processes: usize,
    /// Detach a process after it has processed this many sessions.
    /// 0 means unlimited.
    pub max_requests: u64,
    /// Shut the preloader down after this many seconds of disuse.
    /// 0 disables preloader reaping.
    pub max_preloader_idle_time: u64,
    pub spawn_method: SpawnMethod,
    pub concurrency_model: ConcurrencyModel,
    /// Chroot performed before exec; advertised unix socket paths are
    /// rewritten relative to it.
    pub preexec_chroot: String,
    /// Chroot the worker performs itself after exec.
    pub postexec_chroot: String,
    /// Throttle for restart-file stat checks, in seconds.
    pub stat_throttle_rate: u64,
    /// Whether the analytics pass publishes per-group snapshots for this
    /// group.
    pub analytics: bool,
    pub union_station_key: String,
    /// When the pool is full and no idle process exists, allow evicting
    /// the least recently used busy process.
    pub allow_trashing_non_idle_processes: bool,
    /// Reserve the group without starting a session.
    pub no_op: bool,
    /// Test hook: make the spawner fail with an internal error.
    pub raise_internal_error: bool,
    /// Extra environment variables for the worker.
    pub environment_variables: BTreeMap<String, String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            app_root: String::new(),
            app_group_name: String::new(),
            app_type: String::new(),
            start_command: Vec::new(),
            preloader_command: Vec::new(),
            start_timeout_ms: 90_000,
            environment: "production".to_string(),
            base_uri: "/".to_string(),
            user: String::new(),
            group: String::new(),
            default_user: "nobody".to_string(),
            default_group: String::new(),
            min_processes: 1,
            max_processes: 0,
            max_requests: 0,
            max_preloader_idle_time: 5 * 60,
            spawn_method: SpawnMethod::default(),
            concurrency_model: ConcurrencyModel::default(),
            preexec_chroot: String::new(),
            postexec_chroot: String::new(),
            stat_throttle_rate: 1,
            analytics: false,
            union_station_key: String::new(),
            allow_trashing_non_idle_processes: false,
            no_op: false,
            raise_internal_error: false,
            environment_variables: BTreeMap::new(),
        }
    }
}

impl Options {
    pub fn new(app_root: impl Into<String>) -> Self {
        Self {
            app_root: app_root.into(),
            ..Self::default()
        }
    }

    /// The canonical supergroup key for these options.
    pub fn app_group_name(&self) -> &str {
        if self.app_group_name.is_empty() {
            &self.app_root
        } else {
            &self.app_group_name
        }
    }

    /// Merge the subset of options that may change between requests into
    /// an existing group's snapshot. Everything else keeps the values the
    /// group was created (or last restarted) with.
    pub fn merge_volatile(&mut self, other: &Options) {
        self.min_processes = other.min_processes;
        self.max_requests = other.max_requests;
        self.max_preloader_idle_time = other.max_preloader_idle_time;
        self.stat_throttle_rate = other.stat_throttle_rate;
    }

    /// Strip fields that only make sense for the request that carried
    /// them before persisting the options on a group. `raise_internal_error`
    /// deliberately persists: the test hook is meant to make every spawn
    /// of the group fail.
    pub fn clear_per_request_fields(&mut self) {
        self.no_op = false;
    }

    /// Flatten the options into `key: value` pairs for the spawn
    /// negotiation header block.
    pub fn to_key_values(&self) -> Vec<(String, String)> {
        let mut out = vec![
            kv("app_root", &self.app_root),
            kv("app_group_name", self.app_group_name()),
            kv("app_type", &self.app_type),
            kv("start_timeout", &self.start_timeout_ms.to_string()),
            kv("environment", &self.environment),
            kv("base_uri", &self.base_uri),
            kv("user", &self.user),
            kv("group", &self.group),
            kv("default_user", &self.default_user),
            kv("default_group", &self.default_group),
            kv("min_processes", &self.min_processes.to_string()),
            kv("max_processes", &self.max_processes.to_string()),
            kv("max_requests", &self.max_requests.to_string()),
            kv(
                "max_preloader_idle_time",
                &self.max_preloader_idle_time.to_string(),
            ),
            kv("spawn_method", self.spawn_method.as_str()),
            kv("concurrency_model", self.concurrency_model.as_str()),
            kv("preexec_chroot", &self.preexec_chroot),
            kv("postexec_chroot", &self.postexec_chroot),
            kv("analytics", if self.analytics { "true" } else { "false" }),
            kv("union_station_key", &self.union_station_key),
        ];
        for (key, value) in &self.environment_variables {
            out.push((format!("env_{key}"), value.clone()));
        }
        out
    }
}

fn kv(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}
