//! Service layer — which services consume a certificate, and how to restart them.
//!
//! Bindings live in the configuration document as `[[service]]` entries. Each
//! restart runs synchronously and is bounded by a timeout.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::RestartError;

/// How a service picks up new certificate material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RestartMethod {
    Systemd {
        unit: String,
    },
    Launchd {
        label: String,
    },
    Signal {
        pid_file: PathBuf,
        #[serde(default = "default_signal")]
        signal: String,
    },
    Command {
        argv: Vec<String>,
    },
}

fn default_signal() -> String {
    "HUP".into()
}

/// A service bound to a certificate at setup time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub name: String,
    pub certref: String,
    pub restart: RestartMethod,
}

/// A service that consumes a given certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReference {
    pub name: String,
    pub method: RestartMethod,
}

/// The service operations the restart coordinator consumes.
pub trait ServiceManager {
    /// Every service configured to use the certificate `refid`.
    fn list_consumers(&self, refid: &str) -> Vec<ServiceReference>;

    /// Restart or reload one service, blocking until it finishes.
    fn restart(&self, service: &ServiceReference) -> Result<(), RestartError>;
}

/// Service manager backed by the host's init system and process table.
pub struct SystemServices {
    bindings: Vec<ServiceBinding>,
    timeout: Duration,
}

impl SystemServices {
    pub fn new(bindings: Vec<ServiceBinding>, timeout: Duration) -> Self {
        Self { bindings, timeout }
    }

    fn restart_systemd(&self, unit: &str) -> Result<(), RestartError> {
        let unit = if unit.contains('.') {
            unit.to_string()
        } else {
            format!("{unit}.service")
        };
        let mut cmd = Command::new("systemctl");
        cmd.args(["restart", &unit]);
        run_bounded(cmd, "systemctl", self.timeout)
    }

    fn restart_launchd(&self, label: &str) -> Result<(), RestartError> {
        // kickstart -k kills the running instance before starting it again
        let mut cmd = Command::new("launchctl");
        cmd.args(["kickstart", "-k", &format!("system/{label}")]);
        run_bounded(cmd, "launchctl", self.timeout)
    }

    fn restart_command(&self, argv: &[String]) -> Result<(), RestartError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RestartError::InvalidMethod("empty argv".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        run_bounded(cmd, program, self.timeout)
    }
}

impl ServiceManager for SystemServices {
    fn list_consumers(&self, refid: &str) -> Vec<ServiceReference> {
        let mut seen = HashSet::new();
        self.bindings
            .iter()
            .filter(|b| b.certref == refid)
            .filter(|b| seen.insert(b.name.clone()))
            .map(|b| ServiceReference {
                name: b.name.clone(),
                method: b.restart.clone(),
            })
            .collect()
    }

    fn restart(&self, service: &ServiceReference) -> Result<(), RestartError> {
        info!("Restarting {}...", service.name);
        match &service.method {
            RestartMethod::Systemd { unit } => self.restart_systemd(unit),
            RestartMethod::Launchd { label } => self.restart_launchd(label),
            RestartMethod::Signal { pid_file, signal } => signal_pid_file(pid_file, signal),
            RestartMethod::Command { argv } => self.restart_command(argv),
        }
    }
}

/// Send `signal` to the process whose PID is recorded in `pid_file`.
fn signal_pid_file(pid_file: &Path, signal: &str) -> Result<(), RestartError> {
    let name = if signal.starts_with("SIG") {
        signal.to_string()
    } else {
        format!("SIG{signal}")
    };
    let sig = Signal::from_str(&name)
        .map_err(|_| RestartError::InvalidMethod(format!("unknown signal {signal}")))?;

    let raw = std::fs::read_to_string(pid_file).map_err(|e| RestartError::PidFile {
        path: pid_file.display().to_string(),
        reason: e.to_string(),
    })?;
    let pid = raw
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|&p| p > 0)
        .ok_or_else(|| RestartError::PidFile {
            path: pid_file.display().to_string(),
            reason: format!("invalid PID {:?}", raw.trim()),
        })?;

    debug!("Sending {name} to PID {pid}");
    kill(Pid::from_raw(pid), sig).map_err(|e| RestartError::Signal {
        signal: name,
        pid,
        reason: e.to_string(),
    })
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// stderr is drained on a separate thread while the child runs, so a chatty
/// helper never stalls on a full pipe.
fn run_bounded(mut cmd: Command, program: &str, timeout: Duration) -> Result<(), RestartError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| RestartError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let start = Instant::now();
    let check_interval = Duration::from_millis(50);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                break Err(RestartError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            break Err(RestartError::Timeout {
                program: program.to_string(),
                timeout,
            });
        }
        thread::sleep(check_interval);
    };

    // Descendants of the helper may keep the pipe open, so the reader is only
    // joined when its output goes into the error.
    let status = status?;
    if status.success() {
        return Ok(());
    }
    let stderr = stderr_reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();

    Err(RestartError::Failed {
        program: program.to_string(),
        code: status.code().unwrap_or(-1),
        stderr: stderr.trim().to_string(),
    })
}
