//! Local process launcher
//!
//! `start_ref` is a command line (`/opt/lab/bin/auth-service --port 8081`).
//! The PID and the process start time are recorded in `<run_dir>/<service>.pid`
//! (and as the handle id, `<pid>@<start time>`) so that idempotent starts and
//! later stops work across separate CLI invocations. A live PID whose start
//! time differs belongs to some other process and is never signalled. Output
//! goes to `<run_dir>/<service>.log`.

use super::{Handle, LaunchError, Launcher};
use crate::catalog::ServiceSpec;
use async_trait::async_trait;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// PID plus start time (seconds since the epoch)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcessIdentity {
    pid: u32,
    started_at: u64,
}

impl ProcessIdentity {
    fn parse(id: &str) -> Result<Self, String> {
        let (pid, started_at) = id
            .trim()
            .split_once('@')
            .ok_or_else(|| "expected <pid>@<start time>".to_string())?;
        Ok(Self {
            pid: pid.parse::<u32>().map_err(|e| format!("bad pid: {}", e))?,
            started_at: started_at
                .parse::<u64>()
                .map_err(|e| format!("bad start time: {}", e))?,
        })
    }

    /// Identity of whatever currently runs under `pid`, zombies included
    fn of(pid: u32) -> Option<Self> {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        system.process(sys_pid).map(|process| Self {
            pid,
            started_at: process.start_time(),
        })
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.started_at)
    }
}

pub struct ProcessLauncher {
    run_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn pidfile(&self, service: &str) -> PathBuf {
        self.run_dir.join(format!("{}.pid", service))
    }

    fn logfile(&self, service: &str) -> PathBuf {
        self.run_dir.join(format!("{}.log", service))
    }

    fn read_pidfile(&self, service: &str) -> Option<ProcessIdentity> {
        fs::read_to_string(self.pidfile(service))
            .ok()
            .and_then(|content| ProcessIdentity::parse(&content).ok())
    }

    fn parse_handle(handle: &Handle) -> Result<ProcessIdentity, LaunchError> {
        ProcessIdentity::parse(&handle.id).map_err(|reason| LaunchError::InvalidHandle {
            handle: handle.to_string(),
            reason,
        })
    }

    fn is_alive(identity: ProcessIdentity) -> bool {
        let pid = Pid::from_u32(identity.pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) if process.start_time() != identity.started_at => {
                debug!(pid = identity.pid, "PID now belongs to another process");
                false
            }
            Some(process) => !matches!(
                process.status(),
                ProcessStatus::Zombie | ProcessStatus::Dead
            ),
            None => false,
        }
    }

    fn signal(identity: ProcessIdentity, signal: Signal) -> bool {
        let pid = Pid::from_u32(identity.pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) if process.start_time() == identity.started_at => {
                process.kill_with(signal).unwrap_or_else(|| process.kill())
            }
            _ => false,
        }
    }

    async fn wait_for_exit(identity: ProcessIdentity, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !Self::is_alive(identity) {
                return true;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        !Self::is_alive(identity)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn start(&self, spec: &ServiceSpec) -> Result<Handle, LaunchError> {
        if let Some(identity) = self.read_pidfile(&spec.name) {
            if Self::is_alive(identity) {
                debug!(service = %spec.name, %identity, "Process already running");
                return Ok(Handle::new(&spec.name, identity.to_string()));
            }
        }

        let mut parts = spec.start_ref.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| LaunchError::start_failed(&spec.name, "empty command line"))?;

        fs::create_dir_all(&self.run_dir).map_err(|e| LaunchError::start_failed(&spec.name, e))?;
        let log = File::create(self.logfile(&spec.name))
            .map_err(|e| LaunchError::start_failed(&spec.name, e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| LaunchError::start_failed(&spec.name, e))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(parts)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // Own process group: a Ctrl-C aimed at the orchestrator must not reach services
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| LaunchError::start_failed(&spec.name, format!("{}: {}", program, e)))?;
        let identity = child
            .id()
            .and_then(ProcessIdentity::of)
            .ok_or_else(|| LaunchError::start_failed(&spec.name, "process exited immediately"))?;

        let service = spec.name.clone();
        tokio::spawn(async move {
            if let Ok(status) = child.wait().await {
                debug!(service = %service, %status, "Process exited");
            }
        });

        fs::write(self.pidfile(&spec.name), identity.to_string())
            .map_err(|e| LaunchError::start_failed(&spec.name, e))?;

        info!(service = %spec.name, pid = identity.pid, command = %spec.start_ref, "Process started");
        Ok(Handle::new(&spec.name, identity.to_string()))
    }

    async fn stop(&self, handle: &Handle, timeout: Duration) -> Result<(), LaunchError> {
        let identity = Self::parse_handle(handle)?;

        if Self::is_alive(identity) {
            Self::signal(identity, Signal::Term);
            if !Self::wait_for_exit(identity, timeout).await {
                warn!(handle = %handle, "Graceful stop timed out, killing");
                Self::signal(identity, Signal::Kill);
                if !Self::wait_for_exit(identity, Duration::from_secs(2)).await {
                    return Err(LaunchError::stop_failed(
                        &handle.service,
                        format!("pid {} survived SIGKILL", identity.pid),
                    ));
                }
            }
            info!(handle = %handle, "Process stopped");
        } else {
            debug!(handle = %handle, "Process already stopped");
        }

        if self.read_pidfile(&handle.service) == Some(identity) {
            let _ = fs::remove_file(self.pidfile(&handle.service));
        }
        Ok(())
    }

    async fn is_running(&self, handle: &Handle) -> bool {
        Self::parse_handle(handle).map(Self::is_alive).unwrap_or(false)
    }

    async fn check_available(&self) -> Result<(), LaunchError> {
        fs::create_dir_all(&self.run_dir).map_err(|e| {
            LaunchError::Unavailable(format!(
                "Cannot create run directory {}: {}",
                self.run_dir.display(),
                e
            ))
        })
    }

    fn name(&self) -> &str {
        "process"
    }
}
