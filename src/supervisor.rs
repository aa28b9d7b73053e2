//! Process supervisor: launches backend services as child processes
//!
//! Each child gets an isolated environment (baseline variables, forwarded
//! secrets, overrides and its own `PORT`), has its output re-emitted through
//! `tracing`, and is watched by a dedicated task that records the exit.
//! Termination sends SIGINT and falls back to SIGKILL after a grace period.
//! Crashed children are recorded as `Exited`; nothing restarts them unless
//! `restart` is called explicitly.

use crate::error::{GatewayError, Result};
use crate::service::ServiceDescriptor;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Variables every child inherits from the gateway when present
const BASELINE_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM", "TZ", "SYSTEMROOT"];

/// Lifecycle event buffer
const EVENT_BUFFER: usize = 64;

/// Child process lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Spawn requested, OS handle not obtained yet
    Starting,
    /// Process is alive
    Running,
    /// Process ended, on its own or by request
    Exited,
    /// Process could not be launched
    Failed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Supervisor-side view of one child process
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProcessHandle {
    #[serde(skip)]
    pub descriptor: Arc<ServiceDescriptor>,
    pub service: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ServiceProcessHandle {
    fn new(descriptor: Arc<ServiceDescriptor>) -> Self {
        Self {
            service: descriptor.name.clone(),
            descriptor,
            pid: None,
            status: ProcessStatus::Starting,
            exit_code: None,
            last_error: None,
            started_at: None,
        }
    }
}

/// Lifecycle notification published to interested components
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProcessEvent {
    Started {
        service: String,
        pid: Option<u32>,
    },
    Exited {
        service: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        /// False when the child died without being asked to
        requested: bool,
    },
    Failed {
        service: String,
        reason: String,
    },
}

/// Owner-side control for a live child
struct ProcessControl {
    stop: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
}

/// Process supervisor: the only owner of child handles
pub struct Supervisor {
    descriptors: BTreeMap<String, Arc<ServiceDescriptor>>,
    handles: Arc<RwLock<BTreeMap<String, ServiceProcessHandle>>>,
    controls: Mutex<HashMap<String, ProcessControl>>,
    grace: Duration,
    events: broadcast::Sender<ProcessEvent>,
}

impl Supervisor {
    /// Create a supervisor for the given descriptors
    pub fn new(
        descriptors: impl IntoIterator<Item = Arc<ServiceDescriptor>>,
        grace: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            handles: Arc::new(RwLock::new(BTreeMap::new())),
            controls: Mutex::new(HashMap::new()),
            grace,
            events,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    /// Spawn every descriptor marked `autostart`
    ///
    /// A failure is recorded on that service's handle and returned alongside
    /// the others; it never stops the remaining services from starting.
    pub async fn start_all(&self) -> Vec<(String, Result<ServiceProcessHandle>)> {
        let mut results = Vec::new();
        for descriptor in self.descriptors.values().filter(|d| d.autostart) {
            let result = self.spawn(descriptor.clone()).await;
            results.push((descriptor.name.clone(), result));
        }
        results
    }

    /// Launch one service as a child process
    pub async fn spawn(&self, descriptor: Arc<ServiceDescriptor>) -> Result<ServiceProcessHandle> {
        let name = descriptor.name.clone();
        let mut controls = self.controls.lock().await;

        if controls.get(&name).is_some_and(|c| !c.watcher.is_finished()) {
            return Err(GatewayError::Other(format!(
                "Service '{}' is already running",
                name
            )));
        }

        self.set_handle(ServiceProcessHandle::new(descriptor.clone()));

        let mut command = match build_command(&descriptor, |key| std::env::var(key).ok()) {
            Ok(command) => command,
            Err(e) => return Err(self.mark_failed(&name, e)),
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = GatewayError::Spawn {
                    service: name.clone(),
                    reason: e.to_string(),
                };
                return Err(self.mark_failed(&name, err));
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            forward_output(name.clone(), OutputStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.clone(), OutputStream::Stderr, stderr);
        }

        let handle = self.update_handle(&name, |h| {
            h.status = ProcessStatus::Running;
            h.pid = pid;
            h.started_at = Some(Utc::now());
        });

        let (stop, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_child(
            child,
            stop_rx,
            name.clone(),
            self.handles.clone(),
            self.grace,
            self.events.clone(),
        ));
        controls.insert(name.clone(), ProcessControl { stop, watcher });

        tracing::info!(
            service = name,
            pid = ?pid,
            port = descriptor.upstream_port,
            "Service process started"
        );
        let _ = self.events.send(ProcessEvent::Started {
            service: name,
            pid,
        });

        handle.ok_or_else(|| GatewayError::Other("process handle vanished".into()))
    }

    /// Terminate one service (SIGINT, then SIGKILL after the grace period)
    pub async fn terminate(&self, name: &str) -> Result<ServiceProcessHandle> {
        if !self.descriptors.contains_key(name) {
            return Err(GatewayError::Config(format!("Unknown service '{}'", name)));
        }

        let control = self.controls.lock().await.remove(name);
        if let Some(control) = control {
            let _ = control.stop.send(());
            let _ = control.watcher.await;
        }

        self.status(name)
            .ok_or_else(|| GatewayError::Other(format!("Service '{}' was never started", name)))
    }

    /// Terminate then spawn a fresh process for one service
    pub async fn restart(&self, name: &str) -> Result<ServiceProcessHandle> {
        let descriptor = self
            .descriptors
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("Unknown service '{}'", name)))?;

        if self.status(name).is_some() {
            self.terminate(name).await?;
        }
        tracing::info!(service = name, "Restarting service");
        self.spawn(descriptor).await
    }

    /// Terminate every live child, concurrently, waiting for each to exit
    pub async fn terminate_all(&self) {
        let controls: Vec<(String, ProcessControl)> =
            self.controls.lock().await.drain().collect();
        if controls.is_empty() {
            return;
        }

        tracing::info!(count = controls.len(), "Terminating service processes");
        let waits = controls.into_iter().map(|(name, control)| async move {
            let _ = control.stop.send(());
            if let Err(e) = control.watcher.await {
                tracing::warn!(service = name, error = %e, "Process watcher aborted");
            }
        });
        join_all(waits).await;
    }

    /// Current handle for one service
    pub fn status(&self, name: &str) -> Option<ServiceProcessHandle> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Handles for every service that was ever spawned, in name order
    pub fn snapshot(&self) -> Vec<ServiceProcessHandle> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Descriptors known to this supervisor
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.descriptors.values()
    }

    fn set_handle(&self, handle: ServiceProcessHandle) {
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.service.clone(), handle);
    }

    fn update_handle(
        &self,
        name: &str,
        f: impl FnOnce(&mut ServiceProcessHandle),
    ) -> Option<ServiceProcessHandle> {
        update_handle(&self.handles, name, f)
    }

    fn mark_failed(&self, name: &str, err: GatewayError) -> GatewayError {
        let reason = err.to_string();
        tracing::error!(service = name, error = %reason, "Service failed to start");
        self.update_handle(name, |h| {
            h.status = ProcessStatus::Failed;
            h.pid = None;
            h.last_error = Some(reason.clone());
        });
        let _ = self.events.send(ProcessEvent::Failed {
            service: name.to_string(),
            reason,
        });
        err
    }
}

fn update_handle(
    handles: &RwLock<BTreeMap<String, ServiceProcessHandle>>,
    name: &str,
    f: impl FnOnce(&mut ServiceProcessHandle),
) -> Option<ServiceProcessHandle> {
    let mut handles = handles.write().unwrap_or_else(|e| e.into_inner());
    handles.get_mut(name).map(|h| {
        f(h);
        h.clone()
    })
}

/// Wait for a child to exit on its own or for a stop request
async fn watch_child(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    name: String,
    handles: Arc<RwLock<BTreeMap<String, ServiceProcessHandle>>>,
    grace: Duration,
    events: broadcast::Sender<ProcessEvent>,
) {
    // A dropped sender counts as a stop request: the supervisor is gone.
    let (result, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = stop_rx => (stop_child(&mut child, &name, grace).await, true),
    };

    let exit_code = result.as_ref().ok().and_then(ExitStatus::code);
    let error = result.as_ref().err().map(|e| e.to_string());

    update_handle(&handles, &name, |h| {
        h.status = ProcessStatus::Exited;
        h.exit_code = exit_code;
        if error.is_some() {
            h.last_error = error.clone();
        }
    });

    if requested {
        tracing::info!(service = name, exit_code = ?exit_code, "Service process stopped");
    } else {
        tracing::warn!(
            service = name,
            exit_code = ?exit_code,
            "Service process exited unexpectedly"
        );
    }

    let _ = events.send(ProcessEvent::Exited {
        service: name,
        exit_code,
        requested,
    });
}

/// Interrupt the child, escalating to a kill once `grace` runs out
async fn stop_child(child: &mut Child, name: &str, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        send_interrupt(pid, name);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => {
                tracing::warn!(
                    service = name,
                    grace_ms = grace.as_millis() as u64,
                    "Service ignored SIGINT, killing"
                );
            }
        }
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn send_interrupt(pid: u32, name: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        tracing::debug!(service = name, pid, error = %e, "SIGINT delivery failed");
    }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32, name: &str) {
    tracing::debug!(service = name, "No SIGINT on this platform, waiting for grace period");
}

/// Environment handed to a child process
pub fn child_env<F>(descriptor: &ServiceDescriptor, lookup: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = BTreeMap::new();

    for key in BASELINE_ENV {
        if let Some(value) = lookup(key) {
            env.insert(key.to_string(), value);
        }
    }

    for key in &descriptor.forward_env {
        match lookup(key) {
            Some(value) => {
                env.insert(key.clone(), value);
            }
            None => tracing::warn!(
                service = descriptor.name,
                variable = key,
                "Forwarded variable is not set"
            ),
        }
    }

    env.extend(descriptor.env_overrides.clone());
    env.insert("PORT".to_string(), descriptor.upstream_port.to_string());
    env.insert("HOST".to_string(), descriptor.upstream_host.clone());
    env
}

fn build_command<F>(descriptor: &ServiceDescriptor, lookup: F) -> Result<Command>
where
    F: Fn(&str) -> Option<String>,
{
    let program = descriptor.spawn_command.as_deref().ok_or_else(|| {
        GatewayError::Config(format!("Service '{}' has no command", descriptor.name))
    })?;

    let mut command = Command::new(program);
    command
        .args(&descriptor.spawn_args)
        .env_clear()
        .envs(child_env(descriptor, lookup))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &descriptor.working_dir {
        command.current_dir(dir);
    }

    Ok(command)
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Re-emit a child's output line by line through `tracing`
fn forward_output<R>(service: String, stream: OutputStream, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match stream {
                OutputStream::Stdout => {
                    tracing::info!(target: "child", service = %service, "{}", line)
                }
                OutputStream::Stderr => {
                    tracing::warn!(target: "child", service = %service, "{}", line)
                }
            }
        }
    });
}
