//! Smart spawning through a resident preloader.
//!
//! The preloader is started once per group with the same negotiation as a
//! direct worker, except that it must advertise a unix socket speaking the
//! `preloader` protocol. Each worker spawn then connects to that socket,
//! sends a `spawn` command, and runs a fresh negotiation over the
//! connection: the preloader forks, the fork inherits the connection as
//! its stdin/stdout, announces its pid, and proceeds with the ordinary
//! handshake. Forked workers keep the connection as their admin channel.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::options::Options;
use crate::pool::clock;
use crate::pool::process::{AdminChannel, Process, ProcessSeed, SocketAddress, SocketProtocol};
use crate::spawn::protocol::{self, pump_lines, Negotiation, StderrCapturer};
use crate::spawn::{
    generate_connect_password, generate_gupid, HostPaths, SpawnError, SpawnErrorKind, SpawnPhase,
    SpawnerConfig,
};

/// The resident preloader child.
struct Preloader {
    pid: i32,
    /// The preloader's stdin; closing it asks it to exit gracefully.
    stdin: Option<ChildStdin>,
    /// Unix socket the preloader accepts spawn commands on.
    command_socket: PathBuf,
}

impl Preloader {
    fn shut_down(mut self) {
        // EOF on stdin is the graceful exit signal, same as for workers.
        self.stdin.take();
        protocol::reap_with_grace(self.pid, crate::spawn::SHUTDOWN_GRACE_MS);
    }
}

pub struct SmartSpawner {
    host: HostPaths,
    config: SpawnerConfig,
    /// Options snapshot the preloader is started with.
    options: Options,
    creation_time: u64,
    last_used: AtomicU64,
    /// Guarded by its own mutex: spawn workers call in from outside the
    /// pool lock, and two concurrent spawns for the same group must not
    /// race the preloader start.
    preloader: Mutex<Option<Preloader>>,
}

impl SmartSpawner {
    pub fn new(host: HostPaths, config: SpawnerConfig, mut options: Options) -> Self {
        options.clear_per_request_fields();
        let now = clock::now_usec();
        SmartSpawner {
            host,
            config,
            options,
            creation_time: now,
            last_used: AtomicU64::new(now),
            preloader: Mutex::new(None),
        }
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    /// Whether an idle preloader is resident and worth reaping.
    pub fn cleanable(&self) -> bool {
        self.preloader
            .lock()
            .expect("preloader mutex poisoned")
            .is_some()
    }

    /// Shut the preloader down. The next spawn restarts it.
    pub fn cleanup(&self) {
        let preloader = self
            .preloader
            .lock()
            .expect("preloader mutex poisoned")
            .take();
        if let Some(preloader) = preloader {
            tracing::debug!(pid = preloader.pid, "shutting down idle preloader");
            preloader.shut_down();
        }
    }

    pub fn spawn(&self, options: &Options) -> Result<Process, SpawnError> {
        let deadline = Instant::now() + Duration::from_millis(options.start_timeout_ms);
        let mut guard = self.preloader.lock().expect("preloader mutex poisoned");
        if guard.is_none() {
            *guard = Some(self.start_preloader(deadline)?);
        }
        let preloader = guard.as_ref().expect("preloader just ensured");
        let result = self.spawn_via_preloader(preloader, options, deadline);
        self.last_used.store(clock::now_usec(), Ordering::Release);
        match result {
            Ok(process) => Ok(process),
            Err(err) => {
                // A dead or confused preloader poisons every later spawn;
                // drop it so the next attempt starts fresh.
                if matches!(
                    err.kind,
                    SpawnErrorKind::PreloaderStartupProtocolError | SpawnErrorKind::InternalError
                ) {
                    if let Some(preloader) = guard.take() {
                        preloader.shut_down();
                    }
                }
                Err(err)
            }
        }
    }

    fn start_preloader(&self, deadline: Instant) -> Result<Preloader, SpawnError> {
        let argv = if self.options.preloader_command.is_empty() {
            &self.options.start_command
        } else {
            &self.options.preloader_command
        };
        if argv.is_empty() {
            return Err(SpawnError::new(
                SpawnErrorKind::InternalError,
                format!(
                    "no preloader command configured for application {}",
                    self.options.app_root
                ),
            ));
        }

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.options.app_root)
            .envs(&self.options.environment_variables)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                SpawnError::new(
                    SpawnErrorKind::PreloaderStartupProtocolError,
                    format!("could not execute the preloader {:?}: {err}", argv[0]),
                )
            })?;
        let pid = child.id() as i32;

        let stdout = child.stdout.take().ok_or_else(|| {
            SpawnError::new(SpawnErrorKind::InternalError, "preloader stdout missing")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SpawnError::new(SpawnErrorKind::InternalError, "preloader stderr missing")
        })?;
        let mut stdin = child.stdin.take().ok_or_else(|| {
            SpawnError::new(SpawnErrorKind::InternalError, "preloader stdin missing")
        })?;

        let capturer = StderrCapturer::start(
            stderr,
            format!("preloader {pid} stderr"),
            self.config.forward_stderr,
        );
        let lines = pump_lines(
            stdout,
            format!("preloader {pid} stdout"),
            self.config.forward_stdout,
        );

        let gupid = generate_gupid();
        let connect_password = generate_connect_password();
        let negotiation = Negotiation {
            phase: SpawnPhase::Preloader,
            pid,
            lines,
            stderr: Some(&capturer),
            deadline,
            options: &self.options,
            host: &self.host,
            gupid: &gupid,
            connect_password: &connect_password,
            forward_stdout: self.config.forward_stdout,
            expected_uid: nix::unistd::geteuid().as_raw(),
        };
        let negotiated = negotiation.run(&mut stdin)?;
        capturer.start_forwarding();

        let command_socket = negotiated
            .sockets
            .iter()
            .find_map(|socket| match (&socket.protocol, &socket.address) {
                (SocketProtocol::Preloader, SocketAddress::Unix(path)) => Some(path.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                protocol::kill_and_reap(pid);
                SpawnError::new(
                    SpawnErrorKind::PreloaderStartupProtocolError,
                    "the preloader did not advertise a unix command socket",
                )
            })?;

        tracing::info!(pid, socket = %command_socket.display(), "preloader started");
        Ok(Preloader {
            pid,
            stdin: Some(stdin),
            command_socket,
        })
    }

    fn spawn_via_preloader(
        &self,
        preloader: &Preloader,
        options: &Options,
        deadline: Instant,
    ) -> Result<Process, SpawnError> {
        let spawn_start_time = clock::now_usec();
        let mut stream = UnixStream::connect(&preloader.command_socket).map_err(|err| {
            SpawnError::new(
                SpawnErrorKind::PreloaderStartupProtocolError,
                format!(
                    "could not connect to the preloader command socket {}: {err}",
                    preloader.command_socket.display()
                ),
            )
        })?;
        stream.write_all(b"spawn\n").map_err(|err| {
            SpawnError::new(
                SpawnErrorKind::PreloaderStartupProtocolError,
                format!("could not send the spawn command to the preloader: {err}"),
            )
        })?;

        let reader = stream.try_clone().map_err(|err| {
            SpawnError::new(
                SpawnErrorKind::InternalError,
                format!("could not clone the spawn connection: {err}"),
            )
        })?;
        let lines = pump_lines(
            reader,
            format!("preloader {} fork", preloader.pid),
            self.config.forward_stdout,
        );

        // The fork announces itself before the regular handshake.
        let worker_pid = read_forked_pid(&lines, deadline)?;

        let gupid = generate_gupid();
        let connect_password = generate_connect_password();
        let negotiation = Negotiation {
            phase: SpawnPhase::App,
            pid: worker_pid,
            lines,
            stderr: None,
            deadline,
            options,
            host: &self.host,
            gupid: &gupid,
            connect_password: &connect_password,
            forward_stdout: self.config.forward_stdout,
            expected_uid: nix::unistd::geteuid().as_raw(),
        };
        let negotiated = negotiation.run(&mut stream)?;

        Ok(Process::new(ProcessSeed {
            pid: worker_pid,
            gupid,
            connect_password,
            sockets: negotiated.sockets,
            admin_stdin: Some(AdminChannel::Stream(stream)),
            spawner_creation_time: self.creation_time,
            spawn_start_time,
            dummy: false,
        }))
    }
}

/// First protocol line of a forked worker: `!> pid: <pid>`.
fn read_forked_pid(lines: &Receiver<String>, deadline: Instant) -> Result<i32, SpawnError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SpawnError::new(
                SpawnErrorKind::AppStartupTimeout,
                "the preloader did not fork a worker in time",
            ));
        }
        match lines.recv_timeout(remaining) {
            Ok(line) => {
                let Some(proto) = line.strip_prefix("!> ") else {
                    tracing::debug!(target: "worker_output", "[preloader fork] {line}");
                    continue;
                };
                let Some(("pid", value)) = protocol::parse_kv(proto) else {
                    return Err(SpawnError::new(
                        SpawnErrorKind::AppStartupProtocolError,
                        format!("the preloader fork did not announce its pid (got {proto:?})"),
                    ));
                };
                return value.parse().map_err(|_| {
                    SpawnError::new(
                        SpawnErrorKind::AppStartupProtocolError,
                        format!("the preloader fork announced a malformed pid {value:?}"),
                    )
                });
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(SpawnError::new(
                    SpawnErrorKind::AppStartupTimeout,
                    "the preloader did not fork a worker in time",
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(SpawnError::new(
                    SpawnErrorKind::AppStartupProtocolError,
                    "the preloader closed the spawn connection",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;

    fn smart_options(app_root: &str) -> Options {
        let mut options = Options::new(app_root);
        options.start_timeout_ms = 5_000;
        options
    }

    #[test]
    fn missing_preloader_command_is_internal_error() {
        let options = smart_options("/tmp");
        let spawner = SmartSpawner::new(
            HostPaths::default(),
            SpawnerConfig::default(),
            options.clone(),
        );
        let err = spawner.spawn(&options).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::InternalError);
        assert!(!spawner.cleanable());
    }

    #[test]
    fn preloader_failure_maps_to_preloader_kinds() {
        let mut options = smart_options("/tmp");
        options.start_command = vec![
            "/bin/sh".into(),
            "-c".into(),
            "echo '!> I have no idea what I am doing'".into(),
        ];
        let spawner = SmartSpawner::new(
            HostPaths::default(),
            SpawnerConfig::default(),
            options.clone(),
        );
        let err = spawner.spawn(&options).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::PreloaderStartupProtocolError);
    }

    #[test]
    fn preloader_timeout_maps_to_preloader_timeout() {
        let mut options = smart_options("/tmp");
        options.start_timeout_ms = 200;
        options.start_command = vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()];
        let spawner = SmartSpawner::new(
            HostPaths::default(),
            SpawnerConfig::default(),
            options.clone(),
        );
        let err = spawner.spawn(&options).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::PreloaderStartupTimeout);
    }

    /// Full happy path against an in-test fake preloader: a shell child
    /// plays the preloader role over stdout while a test thread answers
    /// spawn commands on the advertised unix socket.
    #[test]
    fn spawns_a_worker_through_a_fake_preloader() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("preloader.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let accept_thread = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut command = String::new();
            reader.read_line(&mut command).unwrap();
            assert_eq!(command, "spawn\n");

            let mut stream = stream;
            // Fake fork: announce a pid, then run the worker handshake.
            write!(stream, "!> pid: {}\n", std::process::id()).unwrap();
            stream.write_all(b"!> I have control 1.0\n").unwrap();
            // Drain the handshake header.
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).unwrap();
                if line == "\n" {
                    break;
                }
            }
            stream.write_all(b"!> Ready\n").unwrap();
            stream
                .write_all(b"!> socket: main;tcp://127.0.0.1:15000;session;3\n")
                .unwrap();
            stream.write_all(b"!> \n").unwrap();
        });

        let mut options = smart_options("/tmp");
        options.start_command = vec![
            "/bin/sh".into(),
            "-c".into(),
            format!(
                r#"
                echo '!> I have control 1.0'
                while read line; do [ -z "$line" ] && break; done
                echo '!> Ready'
                echo '!> socket: cmd;unix:{};preloader;0'
                echo '!> '
                cat >/dev/null
                "#,
                socket_path.display()
            ),
        ];

        let spawner = SmartSpawner::new(
            HostPaths::default(),
            SpawnerConfig::default(),
            options.clone(),
        );
        let process = spawner.spawn(&options).expect("smart spawn succeeds");
        assert_eq!(process.pid, std::process::id() as i32);
        assert_eq!(process.concurrency, 3);
        accept_thread.join().unwrap();

        assert!(spawner.cleanable());
        assert!(spawner.last_used() >= spawner.creation_time());
        spawner.cleanup();
        assert!(!spawner.cleanable());
    }
}
