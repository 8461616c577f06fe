//! Dummy spawning for the test suite.
//!
//! Produces `Process` objects with no OS process behind them. The usual
//! shutdown obligations are preserved so tests exercise the same
//! destruction path as real workers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::options::Options;
use crate::pool::clock;
use crate::pool::process::{
    Process, ProcessSeed, Socket, SocketAddress, SocketProtocol,
};
use crate::spawn::{generate_connect_password, generate_gupid, SpawnError, SpawnerConfig};

static NEXT_DUMMY_PID: AtomicU64 = AtomicU64::new(1);

pub struct DummySpawner {
    config: SpawnerConfig,
    creation_time: u64,
    last_used: AtomicU64,
}

impl DummySpawner {
    pub fn new(config: SpawnerConfig) -> Self {
        let now = clock::now_usec();
        DummySpawner {
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

    pub fn spawn(&self, options: &Options) -> Result<Process, SpawnError> {
        let spawn_start_time = clock::now_usec();
        if self.config.dummy_spawn_time_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.dummy_spawn_time_ms));
        }
        self.last_used.store(clock::now_usec(), Ordering::Release);

        let pid = NEXT_DUMMY_PID.fetch_add(1, Ordering::Relaxed) as i32;
        let gupid = generate_gupid();
        let socket = Socket::new(
            "main",
            SocketAddress::Unix(PathBuf::from(format!(
                "/tmp/dummy-{}-{pid}.sock",
                options.app_group_name().replace('/', "_")
            ))),
            SocketProtocol::Session,
            self.config.dummy_concurrency,
        );
        let mut process = Process::new(ProcessSeed {
            pid,
            gupid,
            connect_password: generate_connect_password(),
            sockets: vec![socket],
            admin_stdin: None,
            spawner_creation_time: self.creation_time,
            spawn_start_time,
            dummy: true,
        });
        process.requires_shutdown = true;
        Ok(process)
    }
}
