//! The spawn negotiation protocol.
//!
//! Startup negotiation is line-based over the child's stdout. Lines
//! prefixed with `!> ` are protocol lines; everything else is the child's
//! ordinary output and goes to the log (and into the stderr capture
//! buffer, so that a later failure report includes it).
//!
//! The exchange:
//!
//! ```text
//! child:  !> I have control 1.0
//! parent: You have control 1.0
//!         berth_root: ...            (identity + flattened options)
//!         gupid: ...
//!         connect_password: ...
//!         <blank line>
//! child:  !> Ready
//!         !> socket: main;unix:/run/app/main.sock;session;4
//!         !> <blank line>
//! ```
//!
//! On `Error` the child sends key/value attributes, a blank line, and the
//! rest of the stream is the error body (`html: true` marks it as HTML).

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::options::Options;
use crate::pool::process::{Socket, SocketAddress, SocketProtocol};
use crate::spawn::{HostPaths, SpawnError, SpawnErrorKind, SpawnPhase};

const PROTOCOL_PREFIX: &str = "!> ";
const HANDSHAKE_GREETING: &str = "I have control 1.0";
const HANDSHAKE_REPLY: &str = "You have control 1.0";

/// Pump lines from a child pipe into a channel.
///
/// The reader thread lives until EOF. While the receiver is alive, every
/// line is delivered through it; once the receiver is dropped (after a
/// successful negotiation) remaining lines are forwarded straight to the
/// log, so a worker's runtime output is never lost.
pub fn pump_lines<R>(reader: R, tag: String, forward_info: bool) -> Receiver<String>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = channel::unbounded();
    std::thread::Builder::new()
        .name(format!("pipe pump: {tag}"))
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end_matches('\n').to_string();
                        if tx.send(trimmed.clone()).is_err() {
                            log_child_line(&tag, &trimmed, forward_info);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(tag = %tag, "pipe read error: {err}");
                        break;
                    }
                }
            }
        })
        .expect("spawn pipe pump thread");
    rx
}

fn log_child_line(tag: &str, line: &str, forward_info: bool) {
    if forward_info {
        tracing::info!(target: "worker_output", "[{tag}] {line}");
    } else {
        tracing::debug!(target: "worker_output", "[{tag}] {line}");
    }
}

/// Captures a child's stderr in the background.
///
/// While negotiation is in progress everything is buffered; on failure
/// the buffer is attached to the resulting [`SpawnError`]. After success
/// [`StderrCapturer::start_forwarding`] switches the thread over to
/// forwarding lines to the log.
pub struct StderrCapturer {
    buffer: std::sync::Arc<std::sync::Mutex<String>>,
    forwarding: std::sync::Arc<std::sync::atomic::AtomicBool>,
    done: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl StderrCapturer {
    pub fn start<R>(reader: R, tag: String, forward_info: bool) -> Self
    where
        R: Read + Send + 'static,
    {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{Arc, Mutex};

        let buffer = Arc::new(Mutex::new(String::new()));
        let forwarding = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let thread_buffer = Arc::clone(&buffer);
        let thread_forwarding = Arc::clone(&forwarding);
        let thread_done = Arc::clone(&done);
        std::thread::Builder::new()
            .name(format!("stderr capture: {tag}"))
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if thread_forwarding.load(Ordering::Acquire) {
                                log_child_line(&tag, line.trim_end_matches('\n'), forward_info);
                            } else {
                                let mut buf =
                                    thread_buffer.lock().expect("stderr buffer poisoned");
                                buf.push_str(&line);
                            }
                        }
                    }
                }
                thread_done.store(true, Ordering::Release);
            })
            .expect("spawn stderr capture thread");

        StderrCapturer {
            buffer,
            forwarding,
            done,
        }
    }

    /// Append negotiation-time stdout noise so failure reports carry it.
    pub fn append(&self, line: &str) {
        let mut buf = self.buffer.lock().expect("stderr buffer poisoned");
        buf.push_str(line);
        buf.push('\n');
    }

    /// Stop buffering and forward subsequent stderr lines to the log.
    pub fn start_forwarding(&self) {
        self.forwarding
            .store(true, std::sync::atomic::Ordering::Release);
    }

    /// Snapshot the captured output, giving the reader thread up to
    /// `drain_ms` to pick up whatever the (already killed) child still
    /// had in flight.
    pub fn snapshot(&self, drain_ms: u64) -> String {
        let deadline = Instant::now() + Duration::from_millis(drain_ms);
        while !self.done.load(std::sync::atomic::Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.buffer.lock().expect("stderr buffer poisoned").clone()
    }
}

/// Internal failure states of a negotiation, mapped to [`SpawnError`]
/// once the phase and captured stderr are known.
enum Failure {
    Timeout,
    Eof,
    Protocol(String),
    /// The child reported a structured error of its own.
    Reported {
        attributes: BTreeMap<String, String>,
        body: String,
    },
}

/// Everything the negotiation needs to talk to one child.
pub struct Negotiation<'a> {
    pub phase: SpawnPhase,
    pub pid: i32,
    pub lines: Receiver<String>,
    pub stderr: Option<&'a StderrCapturer>,
    pub deadline: Instant,
    pub options: &'a Options,
    pub host: &'a HostPaths,
    pub gupid: &'a str,
    pub connect_password: &'a str,
    pub forward_stdout: bool,
    /// Uid advertised unix sockets must be owned by.
    pub expected_uid: u32,
}

/// Outcome of a successful negotiation.
#[derive(Debug)]
pub struct NegotiatedSockets {
    pub sockets: Vec<Socket>,
}

impl Negotiation<'_> {
    /// Run the negotiation over an already-started child whose stdout is
    /// pumped into `self.lines` and whose stdin is `writer`.
    pub fn run<W: Write>(mut self, writer: &mut W) -> Result<NegotiatedSockets, SpawnError> {
        match self.drive(writer) {
            Ok(sockets) => Ok(sockets),
            Err(failure) => Err(self.fail(failure)),
        }
    }

    fn drive<W: Write>(&mut self, writer: &mut W) -> Result<NegotiatedSockets, Failure> {
        let first = self.read_protocol_line()?;
        if first != HANDSHAKE_GREETING {
            if first == "Error" {
                return Err(self.read_error_block()?);
            }
            return Err(Failure::Protocol(format!(
                "the process sent an unknown handshake message {first:?}"
            )));
        }

        self.send_handshake_reply(writer);

        let response = self.read_protocol_line()?;
        match response.as_str() {
            "Ready" => self.read_ready_block(),
            "Error" => Err(self.read_error_block()?),
            other => Err(Failure::Protocol(format!(
                "the process sent an unknown startup response type {other:?}"
            ))),
        }
    }

    fn send_handshake_reply<W: Write>(&self, writer: &mut W) {
        // A broken pipe here is not fatal: the child may have written an
        // error response before reading our reply, and that response is
        // the more useful thing to report.
        if let Err(err) = write_handshake(
            writer,
            self.host,
            self.gupid,
            self.connect_password,
            self.options,
        ) {
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                tracing::debug!(pid = self.pid, "handshake write failed: {err}");
            }
        }
    }

    fn read_ready_block(&mut self) -> Result<NegotiatedSockets, Failure> {
        let mut sockets = Vec::new();
        loop {
            let line = self.read_protocol_line()?;
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = parse_kv(&line) else {
                return Err(Failure::Protocol(format!(
                    "the process sent a startup response line without separator: {line:?}"
                )));
            };
            if key == "socket" {
                sockets.push(self.parse_socket(value)?);
            } else {
                return Err(Failure::Protocol(format!(
                    "the process sent an unknown startup response key {key:?}"
                )));
            }
        }
        match self.phase {
            SpawnPhase::App => {
                if !sockets.iter().any(|socket| socket.protocol.is_session()) {
                    return Err(Failure::Protocol(
                        "the process did not advertise any session sockets".to_string(),
                    ));
                }
            }
            SpawnPhase::Preloader => {
                if !sockets
                    .iter()
                    .any(|socket| socket.protocol == SocketProtocol::Preloader)
                {
                    return Err(Failure::Protocol(
                        "the preloader did not advertise a command socket".to_string(),
                    ));
                }
            }
        }
        Ok(NegotiatedSockets { sockets })
    }

    /// Parse `name;address;protocol;concurrency`, rewriting and
    /// validating the address.
    fn parse_socket(&self, value: &str) -> Result<Socket, Failure> {
        let parts: Vec<&str> = value.split(';').collect();
        let [name, address, protocol, concurrency] = parts.as_slice() else {
            return Err(Failure::Protocol(format!(
                "the process advertised a malformed socket: {value:?}"
            )));
        };
        let concurrency: u32 = concurrency.parse().map_err(|_| {
            Failure::Protocol(format!(
                "the process advertised a non-numeric socket concurrency: {value:?}"
            ))
        })?;
        let address = fixup_socket_address(self.options, address);
        let address = SocketAddress::parse(&address).ok_or_else(|| {
            Failure::Protocol(format!(
                "the process advertised an unsupported socket address: {value:?}"
            ))
        })?;
        if let SocketAddress::Unix(path) = &address {
            validate_unix_socket(path, self.expected_uid).map_err(Failure::Protocol)?;
        }
        // TODO: validate that TCP session sockets point at localhost and
        // are owned by the worker.
        Ok(Socket::new(
            name.to_string(),
            address,
            SocketProtocol::parse(protocol),
            concurrency,
        ))
    }

    fn read_error_block(&mut self) -> Result<Failure, Failure> {
        let mut attributes = BTreeMap::new();
        loop {
            let line = self.read_protocol_line()?;
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = parse_kv(&line) else {
                return Err(Failure::Protocol(format!(
                    "the process sent an error attribute line without separator: {line:?}"
                )));
            };
            attributes.insert(key.to_string(), value.to_string());
        }
        // The rest of the stream, protocol-prefixed or not, is the error
        // body.
        let mut body = String::new();
        loop {
            match self.next_raw_line() {
                Ok(Some(line)) => {
                    let line = line.strip_prefix(PROTOCOL_PREFIX).unwrap_or(&line);
                    body.push_str(line);
                    body.push('\n');
                }
                Ok(None) => break,
                Err(failure) => return Err(failure),
            }
        }
        Ok(Failure::Reported { attributes, body })
    }

    /// Next protocol line (the `!> ` prefix stripped). Raw output lines
    /// are logged and folded into the stderr capture buffer.
    fn read_protocol_line(&mut self) -> Result<String, Failure> {
        loop {
            match self.next_raw_line()? {
                None => return Err(Failure::Eof),
                Some(line) => {
                    if let Some(proto) = line.strip_prefix(PROTOCOL_PREFIX) {
                        tracing::debug!(pid = self.pid, "[worker stdout >>] {proto}");
                        return Ok(proto.to_string());
                    }
                    if let Some(capturer) = self.stderr {
                        capturer.append(&line);
                    }
                    log_child_line(&format!("pid {}", self.pid), &line, self.forward_stdout);
                }
            }
        }
    }

    fn next_raw_line(&mut self) -> Result<Option<String>, Failure> {
        let now = Instant::now();
        let remaining = self.deadline.saturating_duration_since(now);
        if remaining.is_zero() {
            return Err(Failure::Timeout);
        }
        match self.lines.recv_timeout(remaining) {
            Ok(line) => Ok(Some(line)),
            Err(RecvTimeoutError::Timeout) => Err(Failure::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Convert a failure into a [`SpawnError`], killing the child and
    /// attaching captured stderr.
    fn fail(&self, failure: Failure) -> SpawnError {
        kill_and_reap(self.pid);
        let stderr_output = self
            .stderr
            .map(|capturer| capturer.snapshot(STDERR_DRAIN_MS))
            .unwrap_or_default();
        let phase_noun = match self.phase {
            SpawnPhase::Preloader => "preloader",
            SpawnPhase::App => "application",
        };
        match failure {
            Failure::Timeout => SpawnError::new(
                self.phase.timeout_kind(),
                format!("the {phase_noun} did not finish starting within the timeout"),
            )
            .with_stderr(stderr_output),
            Failure::Eof => SpawnError::new(
                self.phase.protocol_kind(),
                format!("the {phase_noun} closed the connection during startup negotiation"),
            )
            .with_stderr(stderr_output),
            Failure::Protocol(message) => SpawnError::new(
                self.phase.protocol_kind(),
                format!("error negotiating with the {phase_noun}: {message}"),
            )
            .with_stderr(stderr_output),
            Failure::Reported { attributes, body } => {
                let html = attributes.get("html").is_some_and(|v| v == "true");
                let message = attributes
                    .get("summary")
                    .cloned()
                    .unwrap_or_else(|| format!("the {phase_noun} reported a startup error"));
                let mut err = SpawnError::new(SpawnErrorKind::AppStartupExplainableError, message)
                    .with_stderr(stderr_output);
                err.html = html;
                err.error_body = body;
                err.attributes = attributes;
                err
            }
        }
    }
}

const STDERR_DRAIN_MS: u64 = 200;

/// Write the parent's half of the handshake.
pub fn write_handshake<W: Write>(
    writer: &mut W,
    host: &HostPaths,
    gupid: &str,
    connect_password: &str,
    options: &Options,
) -> std::io::Result<()> {
    let mut data = String::new();
    data.push_str(HANDSHAKE_REPLY);
    data.push('\n');
    push_kv(&mut data, "berth_root", &host.root.display().to_string());
    push_kv(&mut data, "berth_version", &host.version);
    push_kv(
        &mut data,
        "ruby_libdir",
        &host.ruby_libdir.display().to_string(),
    );
    push_kv(
        &mut data,
        "generation_dir",
        &host.generation_dir.display().to_string(),
    );
    push_kv(&mut data, "gupid", gupid);
    push_kv(&mut data, "connect_password", connect_password);
    for (key, value) in options.to_key_values() {
        push_kv(&mut data, &key, &value);
    }
    data.push('\n');
    writer.write_all(data.as_bytes())?;
    writer.flush()
}

fn push_kv(data: &mut String, key: &str, value: &str) {
    data.push_str(key);
    data.push_str(": ");
    data.push_str(value);
    data.push('\n');
}

pub(crate) fn parse_kv(line: &str) -> Option<(&str, &str)> {
    line.split_once(": ")
}

/// Rewrite a unix socket address for a worker that was chrooted before
/// exec: the path it reports is relative to its jail.
pub fn fixup_socket_address(options: &Options, address: &str) -> String {
    if options.preexec_chroot.is_empty() && options.postexec_chroot.is_empty() {
        return address.to_string();
    }
    match address.strip_prefix("unix:") {
        Some(path) => format!(
            "unix:{}{}{}",
            options.preexec_chroot, options.postexec_chroot, path
        ),
        None => address.to_string(),
    }
}

/// A unix session socket must have an absolute, canonical path, must
/// exist, and must be owned by the uid the worker runs as.
pub fn validate_unix_socket(path: &Path, expected_uid: u32) -> Result<(), String> {
    if !path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::CurDir | Component::ParentDir))
    {
        return Err(format!(
            "it reported a non-canonical socket filename: {:?}",
            path.display().to_string()
        ));
    }
    let meta = match nix::sys::stat::lstat(path) {
        Ok(meta) => meta,
        Err(err) => {
            return Err(format!(
                "it reported an inaccessible socket filename {:?} ({err})",
                path.display().to_string()
            ));
        }
    };
    if meta.st_uid != expected_uid {
        return Err(format!(
            "it advertised a socket owned by uid {} instead of uid {expected_uid}",
            meta.st_uid
        ));
    }
    Ok(())
}

/// Like `waitpid(pid, WNOHANG)` retried for up to `timeout_ms`. Returns
/// true once the child has been reaped (or is not ours to reap).
pub fn timed_waitpid(pid: i32, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) => return true,
            Err(nix::errno::Errno::ECHILD) => return true,
            Err(_) => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// SIGKILL the child and reap it with a bounded wait.
pub fn kill_and_reap(pid: i32) {
    if pid <= 0 {
        return;
    }
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    timed_waitpid(pid, 1_000);
}

/// Give a worker whose admin channel was closed `grace_ms` to exit on its
/// own, then kill it. Runs on a transient reaper thread so shutdown
/// closures never block their caller.
pub fn reap_with_grace(pid: i32, grace_ms: u64) {
    if pid <= 0 {
        return;
    }
    std::thread::Builder::new()
        .name(format!("reaper: pid {pid}"))
        .spawn(move || {
            if !timed_waitpid(pid, grace_ms) {
                tracing::debug!(pid, "worker did not exit within grace period, killing");
                kill_and_reap(pid);
            }
        })
        .map(|_| ())
        .unwrap_or_else(|err| tracing::warn!(pid, "could not start reaper thread: {err}"));
}
