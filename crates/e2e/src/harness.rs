//! Process harness - spawning, health checking and stopping the SUT
//!
//! Startup walks a fixed sequence of states:
//!
//! ```text
//! INIT -> PORT_RESERVED -> TEMP_READY -> CONFIG_WRITTEN -> PROCESS_STARTED -> READY
//! READY -> STOPPING -> STOPPED
//! ```
//!
//! Any failure before READY stops whatever was started and removes the data
//! directory. The data directory is never tied to a scope guard once the
//! harness is READY: the inspector keeps connections to files inside it, so it
//! is only removed by [`Harness::stop`].

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use arbor_common::CONFIG_FILE;

use crate::error::{E2eError, E2eResult};
use crate::options::HarnessOptions;

/// Health endpoint polled for readiness
pub const HEALTH_PATH: &str = "/api/bot/status";

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_FACTOR: f64 = 1.5;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Init,
    PortReserved,
    TempReady,
    ConfigWritten,
    ProcessStarted,
    Ready,
    Stopping,
    Stopped,
}

/// Absolute paths of the three SUT databases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPaths {
    pub nodes: PathBuf,
    pub flows: PathBuf,
    pub metrics: PathBuf,
}

/// Handle to a running SUT process
pub struct Harness {
    base_url: String,
    port: u16,
    data_dir: PathBuf,
    config_path: PathBuf,
    db_paths: DbPaths,
    has_llm: bool,
    pub(crate) client: Client,
    shutdown_timeout: Duration,
    child: Mutex<Option<Child>>,
    state: Mutex<HarnessState>,
}

/// Owns partially-acquired startup resources and releases them on drop
/// unless startup completes.
struct Startup {
    state: HarnessState,
    data_dir: Option<PathBuf>,
    child: Option<Child>,
    shutdown_timeout: Duration,
}

impl Startup {
    fn advance(&mut self, next: HarnessState) {
        debug!("Harness state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

impl Drop for Startup {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            warn!("Startup aborted in state {:?}; stopping SUT", self.state);
            terminate(child, self.shutdown_timeout);
        }
        if let Some(dir) = self.data_dir.take() {
            if let Err(e) = remove_data_dir(&dir) {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
    }
}

impl Harness {
    /// Start a SUT and block until it answers its health endpoint.
    pub fn start(options: &HarnessOptions) -> E2eResult<Self> {
        let mut startup = Startup {
            state: HarnessState::Init,
            data_dir: None,
            child: None,
            shutdown_timeout: options.shutdown_timeout,
        };

        let port = reserve_port()?;
        startup.advance(HarnessState::PortReserved);

        let data_dir = create_data_dir()?;
        startup.data_dir = Some(data_dir.clone());
        startup.advance(HarnessState::TempReady);

        let config = options.render_config(port, &data_dir);
        let config_path = data_dir.join(CONFIG_FILE);
        config.save(&config_path).map_err(|e| {
            E2eError::ServerStartup(format!(
                "writing config to {}: {}",
                config_path.display(),
                e
            ))
        })?;
        startup.advance(HarnessState::ConfigWritten);

        let binary = options.resolve_binary()?;
        info!("Spawning {} on port {}", binary.display(), port);

        let (stdout, stderr) = if options.forward_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };
        let child = Command::new(&binary)
            .arg("serve")
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| {
                E2eError::ServerStartup(format!("failed to spawn {}: {}", binary.display(), e))
            })?;
        startup.child = Some(child);
        startup.advance(HarnessState::ProcessStarted);

        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(options.request_timeout)
            .build()?;
        let base_url = format!("https://127.0.0.1:{}", port);

        if let Some(child) = startup.child.as_mut() {
            wait_for_ready(&client, &base_url, child, options.startup_timeout)?;
        }
        startup.advance(HarnessState::Ready);
        info!("SUT is ready at {} (data dir {})", base_url, data_dir.display());

        let db_paths = DbPaths {
            nodes: config.database.path.clone(),
            flows: config.database.flows_path.clone(),
            metrics: config.database.metrics_path.clone(),
        };

        // Startup succeeded; ownership moves to the harness.
        let child = startup.child.take();
        startup.data_dir = None;

        Ok(Self {
            base_url,
            port,
            data_dir,
            config_path,
            db_paths,
            has_llm: options.has_llm(),
            client,
            shutdown_timeout: options.shutdown_timeout,
            child: Mutex::new(child),
            state: Mutex::new(HarnessState::Ready),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn db_paths(&self) -> &DbPaths {
        &self.db_paths
    }

    pub fn state(&self) -> HarnessState {
        *self.state.lock()
    }

    /// PID of the SUT while it is running
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().map(Child::id)
    }

    /// True when an LLM provider key was passed to the SUT.
    pub fn has_llm(&self) -> bool {
        self.has_llm
    }

    /// Skip the calling case unless an LLM provider is configured.
    pub fn skip_unless_llm(&self) -> E2eResult<()> {
        if self.has_llm {
            Ok(())
        } else {
            Err(E2eError::skipped(
                "no LLM provider key set (ANTHROPIC_API_KEY / GEMINI_API_KEY)",
            ))
        }
    }

    /// Stop the SUT and remove the data directory. Safe to call repeatedly;
    /// a failed removal leaves the harness in `Stopping` and is retried.
    pub fn stop(&self) -> E2eResult<()> {
        let child = {
            let mut state = self.state.lock();
            if *state == HarnessState::Stopped {
                return Ok(());
            }
            *state = HarnessState::Stopping;
            self.child.lock().take()
        };

        if let Some(child) = child {
            info!("Stopping SUT (pid: {})", child.id());
            terminate(child, self.shutdown_timeout);
        }

        remove_data_dir(&self.data_dir)?;
        *self.state.lock() = HarnessState::Stopped;
        debug!("Harness state -> Stopped");
        Ok(())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Harness cleanup failed: {}", e);
        }
    }
}

/// Bind an ephemeral port on loopback and release it for the SUT.
///
/// The port is free again between release and the SUT's bind; the readiness
/// probe tolerates a lost race by timing out.
pub fn reserve_port() -> E2eResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| E2eError::ServerStartup(format!("reserving a port: {}", e)))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Create a fresh, uniquely named data dir under the system temp dir.
///
/// The dir is detached from its guard; removal is up to the caller.
fn create_data_dir() -> E2eResult<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix("arbor-e2e-")
        .tempdir()
        .map_err(|e| E2eError::ServerStartup(format!("creating data dir: {}", e)))?;
    Ok(dir.keep())
}

fn remove_data_dir(dir: &Path) -> E2eResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!("Removed data dir {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Poll the health endpoint with growing backoff until 200 or the deadline.
fn wait_for_ready(client: &Client, base_url: &str, child: &mut Child, deadline: Duration) -> E2eResult<()> {
    let health_url = format!("{}{}", base_url, HEALTH_PATH);
    let start = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts = 0;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(E2eError::ServerExited(status.to_string()));
        }

        attempts += 1;
        match client.get(&health_url).timeout(PROBE_TIMEOUT).send() {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                debug!("SUT healthy after {} attempts ({:?})", attempts, start.elapsed());
                return Ok(());
            }
            Ok(resp) => {
                warn!("Health check returned {}", resp.status());
            }
            Err(e) => {
                if attempts == 1 {
                    info!("Waiting for SUT to start...");
                }
                // Connection refused is expected while the SUT is binding
                if !e.is_connect() {
                    warn!("Health check error: {}", e);
                }
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return Err(E2eError::ServerHealthCheck { attempts, elapsed });
        }
        sleep(backoff.min(deadline - elapsed));
        backoff = backoff.mul_f64(BACKOFF_FACTOR).min(MAX_BACKOFF);
    }
}

/// SIGTERM, wait up to `grace`, then kill.
fn terminate(mut child: Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("SUT already exited with {}", status);
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(child.id() as i32);
        if kill(pid, Signal::SIGTERM).is_ok() {
            let start = Instant::now();
            while start.elapsed() < grace {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("SUT exited with {}", status);
                        return;
                    }
                    Ok(None) => sleep(EXIT_POLL_INTERVAL),
                    Err(e) => {
                        warn!("Waiting for SUT failed: {}", e);
                        break;
                    }
                }
            }
            warn!("SUT did not exit within {:?}; killing", grace);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    let _ = child.wait();
}
