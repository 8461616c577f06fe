//! Direct spawning: fork+exec one worker per spawn.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::options::Options;
use crate::pool::clock;
use crate::pool::process::{AdminChannel, Process, ProcessSeed};
use crate::spawn::protocol::{pump_lines, Negotiation, StderrCapturer};
use crate::spawn::{
    generate_connect_password, generate_gupid, HostPaths, SpawnError, SpawnErrorKind, SpawnPhase,
    SpawnerConfig,
};

pub struct DirectSpawner {
    host: HostPaths,
    config: SpawnerConfig,
    creation_time: u64,
    last_used: AtomicU64,
}

impl DirectSpawner {
    pub fn new(host: HostPaths, config: SpawnerConfig) -> Self {
        let now = clock::now_usec();
        DirectSpawner {
            host,
            config,
            creation_time: now,
            last_used: AtomicU64::new(now),
        }
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    /// Start a worker and negotiate with it. Blocks for up to
    /// `options.start_timeout_ms`; never called under the pool lock.
    pub fn spawn(&self, options: &Options) -> Result<Process, SpawnError> {
        self.last_used.store(clock::now_usec(), Ordering::Release);
        let spawn_start_time = clock::now_usec();

        let argv = &options.start_command;
        if argv.is_empty() {
            return Err(SpawnError::new(
                SpawnErrorKind::InternalError,
                format!(
                    "no start command configured for application {}",
                    options.app_root
                ),
            ));
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&options.app_root)
            .envs(&options.environment_variables)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| {
            SpawnError::new(
                SpawnErrorKind::InternalError,
                format!("could not execute {:?}: {err}", argv[0]),
            )
        })?;
        let pid = child.id() as i32;

        let stdout = child.stdout.take().ok_or_else(|| {
            SpawnError::new(SpawnErrorKind::InternalError, "child stdout missing")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SpawnError::new(SpawnErrorKind::InternalError, "child stderr missing")
        })?;
        let mut stdin = child.stdin.take().ok_or_else(|| {
            SpawnError::new(SpawnErrorKind::InternalError, "child stdin missing")
        })?;

        let capturer = StderrCapturer::start(
            stderr,
            format!("pid {pid} stderr"),
            self.config.forward_stderr,
        );
        let lines = pump_lines(
            stdout,
            format!("pid {pid} stdout"),
            self.config.forward_stdout,
        );

        let gupid = generate_gupid();
        let connect_password = generate_connect_password();
        let negotiation = Negotiation {
            phase: SpawnPhase::App,
            pid,
            lines,
            stderr: Some(&capturer),
            deadline: Instant::now() + Duration::from_millis(options.start_timeout_ms),
            options,
            host: &self.host,
            gupid: &gupid,
            connect_password: &connect_password,
            forward_stdout: self.config.forward_stdout,
            expected_uid: nix::unistd::geteuid().as_raw(),
        };

        let negotiated = negotiation.run(&mut stdin)?;
        capturer.start_forwarding();

        Ok(Process::new(ProcessSeed {
            pid,
            gupid,
            connect_password,
            sockets: negotiated.sockets,
            admin_stdin: Some(AdminChannel::Pipe(stdin)),
            spawner_creation_time: self.creation_time,
            spawn_start_time,
            dummy: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SpawnMethod;

    fn shell_worker(script: &str) -> Options {
        let mut options = Options::new("/tmp");
        options.spawn_method = SpawnMethod::Direct;
        options.start_command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ];
        options.start_timeout_ms = 5_000;
        options
    }

    #[test]
    fn spawns_and_negotiates_with_a_shell_worker() {
        let options = shell_worker(
            r#"
            echo '!> I have control 1.0'
            # Consume the handshake header up to the blank line.
            while read line; do [ -z "$line" ] && break; done
            echo '!> Ready'
            echo '!> socket: main;tcp://127.0.0.1:14000;session;2'
            echo '!> '
            # Stay alive until stdin closes.
            cat >/dev/null
            "#,
        );
        let spawner = DirectSpawner::new(HostPaths::default(), SpawnerConfig::default());
        let process = spawner.spawn(&options).expect("spawn succeeds");
        assert!(process.pid > 0);
        assert_eq!(process.concurrency, 2);
        assert!(process.has_session_sockets());
        process.into_shutdown_closure()();
    }

    #[test]
    fn worker_error_is_reported_with_body() {
        let options = shell_worker(
            r#"
            echo '!> Error'
            echo '!> summary: missing dependency'
            echo '!> '
            echo 'install the thing first'
            "#,
        );
        let spawner = DirectSpawner::new(HostPaths::default(), SpawnerConfig::default());
        let err = spawner.spawn(&options).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupExplainableError);
        assert!(err.error_body.contains("install the thing first"));
    }

    #[test]
    fn silent_worker_times_out() {
        let mut options = shell_worker("sleep 30");
        options.start_timeout_ms = 200;
        let spawner = DirectSpawner::new(HostPaths::default(), SpawnerConfig::default());
        let err = spawner.spawn(&options).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupTimeout);
    }

    #[test]
    fn missing_start_command_is_internal_error() {
        let mut options = Options::new("/tmp");
        options.spawn_method = SpawnMethod::Direct;
        let spawner = DirectSpawner::new(HostPaths::default(), SpawnerConfig::default());
        let err = spawner.spawn(&options).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::InternalError);
    }
}
