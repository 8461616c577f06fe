//! Worker processes and their listener sockets.
//!
//! A [`Process`] represents one application worker as negotiated by a
//! spawner: its OS pid, a pool-unique `gupid`, a connect password, and the
//! sockets it listens on. Only *session sockets* (protocol `session` or
//! `http_session`) receive routed requests; routing always picks the
//! session socket with the lowest utilization.
//!
//! Except for the life status, which sits behind its own small mutex so
//! that sessions and reaper threads can read it without the pool lock,
//! all fields are mutated only under the pool lock.

use std::collections::BTreeSet;
use std::fmt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ChildStdin;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::pool::clock;

/// Scale factor for utilization keys. A limited socket or process at full
/// capacity has a key of at least this value; idle-unlimited is 0 and
/// busy-unlimited is 1, so a min-ordering prefers idle unlimited workers
/// first, then the least loaded limited ones.
pub const UTILIZATION_SCALE: u64 = i32::MAX as u64;

/// Where a listener socket lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl SocketAddress {
    /// Parse the wire form: `unix:/path` or `tcp://host:port`.
    pub fn parse(raw: &str) -> Option<SocketAddress> {
        if let Some(path) = raw.strip_prefix("unix:") {
            Some(SocketAddress::Unix(PathBuf::from(path)))
        } else if raw.starts_with("tcp://") {
            Some(SocketAddress::Tcp(raw.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            SocketAddress::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketProtocol {
    Session,
    HttpSession,
    Http,
    Preloader,
    Other(String),
}

impl SocketProtocol {
    pub fn parse(raw: &str) -> SocketProtocol {
        match raw {
            "session" => SocketProtocol::Session,
            "http_session" => SocketProtocol::HttpSession,
            "http" => SocketProtocol::Http,
            "preloader" => SocketProtocol::Preloader,
            other => SocketProtocol::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SocketProtocol::Session => "session",
            SocketProtocol::HttpSession => "http_session",
            SocketProtocol::Http => "http",
            SocketProtocol::Preloader => "preloader",
            SocketProtocol::Other(other) => other,
        }
    }

    /// Whether sockets speaking this protocol receive routed requests.
    pub fn is_session(&self) -> bool {
        matches!(self, SocketProtocol::Session | SocketProtocol::HttpSession)
    }
}

/// One listener advertised by a worker during spawn negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socket {
    pub name: String,
    pub address: SocketAddress,
    pub protocol: SocketProtocol,
    /// Maximum simultaneous sessions this socket accepts. 0 = unlimited.
    pub concurrency: u32,
    /// Sessions currently open on this socket.
    pub sessions: u32,
}

impl Socket {
    pub fn new(
        name: impl Into<String>,
        address: SocketAddress,
        protocol: SocketProtocol,
        concurrency: u32,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            protocol,
            concurrency,
            sessions: 0,
        }
    }

    pub fn utilization(&self) -> u64 {
        scaled_utilization(self.sessions, self.concurrency)
    }

    pub fn at_full_capacity(&self) -> bool {
        self.concurrency != 0 && self.sessions >= self.concurrency
    }
}

fn scaled_utilization(sessions: u32, concurrency: u32) -> u64 {
    if concurrency == 0 {
        if sessions == 0 {
            0
        } else {
            1
        }
    } else {
        u64::from(sessions) * UTILIZATION_SCALE / u64::from(concurrency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifeStatus {
    Alive,
    ShuttingDown,
    ShutDown,
}

impl LifeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LifeStatus::Alive => "alive",
            LifeStatus::ShuttingDown => "shutting_down",
            LifeStatus::ShutDown => "shut_down",
        }
    }
}

/// Shared life-status cell. Sessions, spawn threads and reaper threads
/// hold a clone and may read it without taking the pool lock.
#[derive(Debug, Clone)]
pub struct LifeHandle(Arc<Mutex<LifeStatus>>);

impl LifeHandle {
    fn new() -> Self {
        LifeHandle(Arc::new(Mutex::new(LifeStatus::Alive)))
    }

    pub fn status(&self) -> LifeStatus {
        *self.0.lock().expect("process life mutex poisoned")
    }

    pub fn is_alive(&self) -> bool {
        self.status() == LifeStatus::Alive
    }

    fn set(&self, status: LifeStatus) {
        *self.0.lock().expect("process life mutex poisoned") = status;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enabled {
    Enabled,
    Disabling,
    Disabled,
}

impl Enabled {
    pub fn as_str(self) -> &'static str {
        match self {
            Enabled::Enabled => "enabled",
            Enabled::Disabling => "disabling",
            Enabled::Disabled => "disabled",
        }
    }
}

/// Per-process resource usage, refreshed by the analytics pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

/// The worker's admin channel, mapped to its stdin. Closing the write
/// side signals the worker to exit gracefully.
#[derive(Debug)]
pub enum AdminChannel {
    /// A directly spawned worker: its stdin pipe.
    Pipe(ChildStdin),
    /// A preloader-forked worker: the spawn connection it inherited.
    Stream(UnixStream),
}

impl AdminChannel {
    /// Half-close so the worker observes EOF on its stdin.
    fn close(self) {
        match self {
            // Dropping the pipe closes it.
            AdminChannel::Pipe(_) => {}
            AdminChannel::Stream(stream) => {
                // The read side may still be pumped by a log thread;
                // shut down only our write direction.
                let _ = stream.shutdown(std::net::Shutdown::Write);
            }
        }
    }
}

/// Everything a spawner hands over for a freshly negotiated worker.
pub struct ProcessSeed {
    pub pid: i32,
    pub gupid: String,
    pub connect_password: String,
    pub sockets: Vec<Socket>,
    /// The worker's stdin; closing it tells the worker to exit gracefully.
    pub admin_stdin: Option<AdminChannel>,
    /// When the spawner producing this worker was created, µs.
    pub spawner_creation_time: u64,
    /// When this particular spawn started, µs.
    pub spawn_start_time: u64,
    pub dummy: bool,
}

/// One application worker owned by a group.
///
/// A process is a member of exactly one group list (enabled, disabling,
/// disabled, or the drain list of detached processes) at any time.
pub struct Process {
    pub pid: i32,
    pub gupid: String,
    pub connect_password: String,
    pub sockets: Vec<Socket>,
    /// Session-socket indices ordered by `(utilization, index)`.
    session_queue: BTreeSet<(u64, usize)>,
    /// Sum of session-socket concurrencies; 0 if any is unlimited.
    pub concurrency: u32,
    pub sessions: u32,
    pub processed: u64,
    pub spawner_creation_time: u64,
    pub spawn_start_time: u64,
    pub spawn_end_time: u64,
    pub last_used: u64,
    life: LifeHandle,
    pub enabled: Enabled,
    pub oobw_requested: bool,
    /// Memoized "the OS process is gone" observation. Once set, liveness
    /// probes are skipped so a recycled pid is never mistaken for this
    /// worker.
    os_process_gone: bool,
    pub dummy: bool,
    /// Dummy processes minted for no-op gets skip the shutdown path.
    pub requires_shutdown: bool,
    pub metrics: ProcessMetrics,
    admin_stdin: Option<AdminChannel>,
    /// Stable tie-break key in the group routing queue, assigned at
    /// attach time.
    pub(crate) queue_seq: u64,
    /// Restart generation of the group at attach time. Old-generation
    /// disabling processes detach once they drain.
    pub(crate) generation: u32,
}

impl Process {
    pub fn new(seed: ProcessSeed) -> Self {
        let now = clock::now_usec();
        let mut process = Self {
            pid: seed.pid,
            gupid: seed.gupid,
            connect_password: seed.connect_password,
            sockets: seed.sockets,
            session_queue: BTreeSet::new(),
            concurrency: 0,
            sessions: 0,
            processed: 0,
            spawner_creation_time: seed.spawner_creation_time,
            spawn_start_time: seed.spawn_start_time,
            spawn_end_time: now,
            last_used: now,
            life: LifeHandle::new(),
            enabled: Enabled::Enabled,
            oobw_requested: false,
            os_process_gone: false,
            dummy: seed.dummy,
            requires_shutdown: true,
            metrics: ProcessMetrics::default(),
            admin_stdin: seed.admin_stdin,
            queue_seq: 0,
            generation: 0,
        };
        process.index_session_sockets();
        process
    }

    fn index_session_sockets(&mut self) {
        self.session_queue.clear();
        let mut concurrency: Option<u32> = Some(0);
        for (index, socket) in self.sockets.iter().enumerate() {
            if !socket.protocol.is_session() {
                continue;
            }
            self.session_queue.insert((socket.utilization(), index));
            concurrency = match concurrency {
                // One unlimited session socket makes the whole process
                // unlimited.
                Some(_) if socket.concurrency == 0 => None,
                Some(total) => Some(total + socket.concurrency),
                None => None,
            };
        }
        self.concurrency = concurrency.unwrap_or(0);
    }

    pub fn life(&self) -> LifeHandle {
        self.life.clone()
    }

    pub fn life_status(&self) -> LifeStatus {
        self.life.status()
    }

    pub fn is_alive(&self) -> bool {
        self.life.is_alive()
    }

    pub fn utilization(&self) -> u64 {
        scaled_utilization(self.sessions, self.concurrency)
    }

    pub fn at_full_utilization(&self) -> bool {
        self.concurrency != 0 && self.sessions >= self.concurrency
    }

    pub fn has_session_sockets(&self) -> bool {
        !self.session_queue.is_empty()
    }

    /// Check out a session slot on the least utilized session socket.
    ///
    /// Returns the index of the chosen socket, or `None` when every
    /// session socket is at full capacity.
    pub fn new_session(&mut self, now: u64) -> Option<usize> {
        let &(key, index) = self.session_queue.iter().next()?;
        if self.sockets[index].at_full_capacity() {
            // The least utilized socket is full, so all of them are.
            return None;
        }
        self.session_queue.remove(&(key, index));
        let socket = &mut self.sockets[index];
        socket.sessions += 1;
        self.sessions += 1;
        self.processed += 1;
        self.last_used = now;
        let new_key = self.sockets[index].utilization();
        self.session_queue.insert((new_key, index));
        Some(index)
    }

    /// Record that a session checked out from `socket_index` has closed.
    pub fn session_closed(&mut self, socket_index: usize) {
        let socket = &mut self.sockets[socket_index];
        debug_assert!(socket.sessions > 0, "socket session underflow");
        debug_assert!(self.sessions > 0, "process session underflow");
        let old_key = socket.utilization();
        socket.sessions = socket.sessions.saturating_sub(1);
        self.sessions = self.sessions.saturating_sub(1);
        if self.session_queue.remove(&(old_key, socket_index)) {
            let new_key = self.sockets[socket_index].utilization();
            self.session_queue.insert((new_key, socket_index));
        }
    }

    /// Whether the OS process still exists, probed with signal 0.
    ///
    /// A negative observation is memoized: once the process has been seen
    /// gone, the probe is never repeated.
    pub fn os_process_exists(&mut self) -> bool {
        if self.dummy || self.os_process_gone {
            return false;
        }
        let pid = nix::unistd::Pid::from_raw(self.pid);
        match nix::sys::signal::kill(pid, None) {
            Ok(()) => true,
            Err(nix::errno::Errno::ESRCH) => {
                self.os_process_gone = true;
                false
            }
            // EPERM and anything else means some process with that pid
            // is there.
            Err(_) => true,
        }
    }

    pub fn can_be_shut_down(&mut self) -> bool {
        self.sessions == 0 && !self.os_process_exists()
    }

    /// Begin graceful shutdown: half-close the admin channel so the
    /// worker sees EOF on its stdin and exits on its own schedule.
    pub fn set_shutting_down(&mut self) {
        debug_assert_eq!(self.life.status(), LifeStatus::Alive);
        self.life.set(LifeStatus::ShuttingDown);
        if let Some(channel) = self.admin_stdin.take() {
            channel.close();
        }
    }

    /// Consume the process and produce the closure that finishes its
    /// shutdown. Must only be called with `sessions == 0` and the process
    /// removed from every group list; the closure runs outside the pool
    /// lock and may block briefly while reaping.
    pub fn into_shutdown_closure(mut self) -> impl FnOnce() + Send {
        debug_assert_eq!(self.sessions, 0);
        let life = self.life.clone();
        if self.life.status() == LifeStatus::Alive {
            self.set_shutting_down();
        }
        let pid = self.pid;
        let dummy = self.dummy;
        let requires_shutdown = self.requires_shutdown;
        let gupid = self.gupid.clone();
        let unix_paths: Vec<PathBuf> = self
            .sockets
            .iter()
            .filter_map(|socket| match &socket.address {
                SocketAddress::Unix(path) => Some(path.clone()),
                SocketAddress::Tcp(_) => None,
            })
            .collect();
        move || {
            if !requires_shutdown || dummy {
                life.set(LifeStatus::ShutDown);
                return;
            }
            // The worker saw EOF on its admin channel when shutdown began;
            // give it a grace period on a transient reaper thread, then
            // kill. SHUT_DOWN is only recorded once the OS process is gone.
            let reaper = move || {
                if !crate::spawn::protocol::timed_waitpid(pid, crate::spawn::SHUTDOWN_GRACE_MS) {
                    tracing::debug!(gupid = %gupid, pid, "worker ignored shutdown, killing");
                    crate::spawn::protocol::kill_and_reap(pid);
                }
                for path in &unix_paths {
                    if let Err(err) = std::fs::remove_file(path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            tracing::debug!(
                                gupid = %gupid,
                                path = %path.display(),
                                "could not unlink worker socket: {err}"
                            );
                        }
                    }
                }
                life.set(LifeStatus::ShutDown);
                tracing::debug!(gupid = %gupid, pid, "worker shut down");
            };
            if let Err(err) = std::thread::Builder::new()
                .name(format!("worker reaper: pid {pid}"))
                .spawn(reaper)
            {
                tracing::warn!(pid, "could not start worker reaper thread: {err}");
            }
        }
    }

    pub fn uptime_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.spawn_end_time) / 1_000_000
    }

    pub fn inspect(&self) -> String {
        format!("(pid={}, gupid={})", self.pid, self.gupid)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("gupid", &self.gupid)
            .field("sessions", &self.sessions)
            .field("concurrency", &self.concurrency)
            .field("enabled", &self.enabled)
            .field("life", &self.life.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn dummy_process(gupid: &str, concurrency: u32) -> Process {
    let socket = Socket::new(
        "main",
        SocketAddress::Unix(PathBuf::from(format!("/tmp/{gupid}.sock"))),
        SocketProtocol::Session,
        concurrency,
    );
    let mut process = Process::new(ProcessSeed {
        pid: 0,
        gupid: gupid.to_string(),
        connect_password: "x".repeat(43),
        sockets: vec![socket],
        admin_stdin: None,
        spawner_creation_time: clock::now_usec(),
        spawn_start_time: clock::now_usec(),
        dummy: true,
    });
    process.requires_shutdown = true;
    process
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_sums_session_sockets() {
        let sockets = vec![
            Socket::new(
                "a",
                SocketAddress::Tcp("tcp://127.0.0.1:4000".into()),
                SocketProtocol::Session,
                2,
            ),
            Socket::new(
                "b",
                SocketAddress::Tcp("tcp://127.0.0.1:4001".into()),
                SocketProtocol::HttpSession,
                3,
            ),
            // Not a session socket, must not count.
            Socket::new(
                "admin",
                SocketAddress::Tcp("tcp://127.0.0.1:4002".into()),
                SocketProtocol::Http,
                1,
            ),
        ];
        let process = Process::new(ProcessSeed {
            pid: 1,
            gupid: "g1".into(),
            connect_password: "p".into(),
            sockets,
            admin_stdin: None,
            spawner_creation_time: 0,
            spawn_start_time: 0,
            dummy: true,
        });
        assert_eq!(process.concurrency, 5);
    }

    #[test]
    fn unlimited_socket_makes_process_unlimited() {
        let sockets = vec![
            Socket::new(
                "a",
                SocketAddress::Tcp("tcp://127.0.0.1:4000".into()),
                SocketProtocol::Session,
                2,
            ),
            Socket::new(
                "b",
                SocketAddress::Tcp("tcp://127.0.0.1:4001".into()),
                SocketProtocol::Session,
                0,
            ),
        ];
        let process = Process::new(ProcessSeed {
            pid: 1,
            gupid: "g1".into(),
            connect_password: "p".into(),
            sockets,
            admin_stdin: None,
            spawner_creation_time: 0,
            spawn_start_time: 0,
            dummy: true,
        });
        assert_eq!(process.concurrency, 0);
    }

    #[test]
    fn utilization_ladder() {
        let mut process = dummy_process("g1", 0);
        assert_eq!(process.utilization(), 0);
        process.new_session(1).unwrap();
        assert_eq!(process.utilization(), 1);

        let mut limited = dummy_process("g2", 4);
        limited.new_session(1).unwrap();
        assert_eq!(limited.utilization(), UTILIZATION_SCALE / 4);
        limited.new_session(2).unwrap();
        assert_eq!(limited.utilization(), UTILIZATION_SCALE / 2);
    }

    #[test]
    fn new_session_respects_socket_concurrency() {
        let mut process = dummy_process("g1", 2);
        assert!(process.new_session(1).is_some());
        assert!(process.new_session(2).is_some());
        assert!(process.new_session(3).is_none());
        assert!(process.at_full_utilization());
        process.session_closed(0);
        assert!(!process.at_full_utilization());
        assert!(process.new_session(4).is_some());
    }

    #[test]
    fn session_counters_stay_consistent() {
        let mut process = dummy_process("g1", 3);
        let a = process.new_session(1).unwrap();
        let b = process.new_session(2).unwrap();
        assert_eq!(process.sessions, 2);
        assert_eq!(process.processed, 2);
        let socket_total: u32 = process.sockets.iter().map(|s| s.sessions).sum();
        assert_eq!(socket_total, process.sessions);
        process.session_closed(a);
        process.session_closed(b);
        assert_eq!(process.sessions, 0);
        assert_eq!(process.processed, 2);
    }

    #[test]
    fn routing_prefers_idle_unlimited_socket() {
        let sockets = vec![
            Socket::new(
                "limited",
                SocketAddress::Tcp("tcp://127.0.0.1:4000".into()),
                SocketProtocol::Session,
                8,
            ),
            Socket::new(
                "unlimited",
                SocketAddress::Tcp("tcp://127.0.0.1:4001".into()),
                SocketProtocol::Session,
                0,
            ),
        ];
        let mut process = Process::new(ProcessSeed {
            pid: 1,
            gupid: "g1".into(),
            connect_password: "p".into(),
            sockets,
            admin_stdin: None,
            spawner_creation_time: 0,
            spawn_start_time: 0,
            dummy: true,
        });
        let index = process.new_session(1).unwrap();
        assert_eq!(process.sockets[index].name, "unlimited");
    }

    #[test]
    fn dummy_process_os_probe_is_false() {
        let mut process = dummy_process("g1", 1);
        assert!(!process.os_process_exists());
        assert!(process.can_be_shut_down());
    }

    #[test]
    fn shutdown_closure_marks_shut_down() {
        let process = dummy_process("g1", 1);
        let life = process.life();
        process.into_shutdown_closure()();
        assert_eq!(life.status(), LifeStatus::ShutDown);
    }

    #[test]
    fn socket_address_parse_roundtrip() {
        let unix = SocketAddress::parse("unix:/tmp/app.sock").unwrap();
        assert_eq!(unix.to_string(), "unix:/tmp/app.sock");
        let tcp = SocketAddress::parse("tcp://127.0.0.1:8080").unwrap();
        assert_eq!(tcp.to_string(), "tcp://127.0.0.1:8080");
        assert!(SocketAddress::parse("bogus").is_none());
    }
}
