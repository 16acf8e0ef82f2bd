//! Lifecycle of a single kernel subprocess: start, shutdown, restart,
//! interrupt, signal (§4.2 Kernel Manager).
//!
//! A `KernelManager` owns the subprocess handle, the connection info it was
//! launched with, and the control socket. It does not own a restarter --
//! per §9's note on circular coupling, the restarter is constructed
//! separately with a [`RestartObserver`] view onto this manager, and the
//! pool (`MultiKernelManager`) is the one that wires the two together.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use zasper_protocol::{ConnectionInfo, InterruptMode};

use crate::connection::ClientControlConnection;
use crate::kernelspec::KernelspecDir;
use crate::provisioner::{self, LaunchedKernel};
use crate::{connection_file, Result, RuntimeError};

/// §3 Kernel Record `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Starting,
    Idle,
    Busy,
    Dead,
    Unknown,
}

impl KernelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelState::Starting => "starting",
            KernelState::Idle => "idle",
            KernelState::Busy => "busy",
            KernelState::Dead => "dead",
            KernelState::Unknown => "unknown",
        }
    }
}

/// §4.2 shutdown state machine. `Unset` is the resting state; a shutdown
/// request walks forward through increasingly forceful steps until the
/// process exits, at which point the manager resets to `Unset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownStatus {
    #[default]
    Unset,
    ShutdownRequest,
    SigtermRequest,
    SigkillRequest,
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const SIGTERM_GRACE: Duration = Duration::from_secs(5);
const SIGKILL_GRACE: Duration = Duration::from_secs(5);

/// One running (or pending) kernel and everything needed to manage it.
pub struct KernelManager {
    pub kernel_id: String,
    pub kernel_name: String,
    pub kernelspec: KernelspecDir,
    pub state: KernelState,
    pub reason: String,
    pub last_activity: DateTime<Utc>,
    pub execution_state_known: bool,
    pub connection_info: Option<ConnectionInfo>,

    ip: IpAddr,
    runtime_dir: PathBuf,
    extra_env: HashMap<String, String>,
    cwd: Option<PathBuf>,

    launched: Option<LaunchedKernel>,
    control: Option<ClientControlConnection>,
    owns_connection_file: bool,
    shutdown_status: ShutdownStatus,
    pub shutting_down: bool,
    last_extra_args: Vec<String>,
}

impl KernelManager {
    pub fn new(
        kernel_id: String,
        kernelspec: KernelspecDir,
        runtime_dir: PathBuf,
        ip: IpAddr,
        extra_env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Self {
        KernelManager {
            kernel_name: kernelspec.kernel_name.clone(),
            kernelspec,
            kernel_id,
            state: KernelState::Starting,
            reason: String::new(),
            last_activity: Utc::now(),
            execution_state_known: false,
            connection_info: None,
            ip,
            runtime_dir,
            extra_env,
            cwd,
            launched: None,
            control: None,
            owns_connection_file: true,
            shutdown_status: ShutdownStatus::default(),
            shutting_down: false,
            last_extra_args: Vec::new(),
        }
    }

    pub fn has_kernel(&self) -> bool {
        self.launched.is_some()
    }

    /// §4.2 Startup: allocate/launch, reconcile, open the control socket.
    /// Starting the restarter (phase 6) is the caller's (MKM's)
    /// responsibility, since the restarter needs an observer onto `self`
    /// that only exists once `self` is behind a shared pointer.
    pub async fn start(&mut self, extra_args: &[String], new_ports: bool) -> Result<()> {
        if self.has_kernel() {
            return Err(RuntimeError::AlreadyRunning {
                kernel_id: self.kernel_id.clone(),
            });
        }
        self.shutting_down = false;
        self.shutdown_status = ShutdownStatus::Unset;
        self.last_extra_args = extra_args.to_vec();

        let ports = if new_ports {
            None
        } else {
            self.connection_info.as_ref().map(|info| {
                [
                    info.shell_port,
                    info.iopub_port,
                    info.stdin_port,
                    info.control_port,
                    info.hb_port,
                ]
            })
        };

        let result = provisioner::launch(
            &self.kernelspec,
            &self.runtime_dir,
            self.ip,
            ports,
            Some(self.extra_env.clone()),
            extra_args,
        )
        .await;

        let mut launched = match result {
            Ok(l) => l,
            Err(e) => {
                self.state = KernelState::Dead;
                self.reason = e.to_string();
                return Err(RuntimeError::StartupFailed {
                    kernel_id: self.kernel_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        connection_file::reconcile(&launched.connection_info, &launched.connection_file)
            .await?;

        let control = crate::connection::create_client_control_connection(
            &launched.connection_info,
            &self.kernel_id,
        )
        .await?;

        self.connection_info = Some(launched.connection_info.clone());
        self.control = Some(control);
        self.state = KernelState::Starting;
        self.reason.clear();
        self.last_activity = Utc::now();
        self.launched = Some(launched);
        self.owns_connection_file = true;

        Ok(())
    }

    /// §4.1 `open_channel`: a fresh socket connected to this kernel's
    /// channel, for the bridge or the activity tap to use.
    pub async fn connect_channel(
        &self,
        channel: zasper_protocol::Channel,
    ) -> Result<ChannelSocket> {
        let info = self
            .connection_info
            .as_ref()
            .ok_or_else(|| RuntimeError::NotRunning {
                kernel_id: self.kernel_id.clone(),
            })?;
        Ok(match channel {
            zasper_protocol::Channel::Shell => ChannelSocket::Shell(
                crate::connection::create_client_shell_connection(info, &self.kernel_id).await?,
            ),
            zasper_protocol::Channel::Stdin => ChannelSocket::Stdin(
                crate::connection::create_client_stdin_connection(info, &self.kernel_id).await?,
            ),
            zasper_protocol::Channel::Control => ChannelSocket::Control(
                crate::connection::create_client_control_connection(info, &self.kernel_id)
                    .await?,
            ),
            zasper_protocol::Channel::IoPub => ChannelSocket::IoPub(
                crate::connection::create_client_iopub_connection(info, "", &self.kernel_id)
                    .await?,
            ),
            zasper_protocol::Channel::Heartbeat => ChannelSocket::Heartbeat(
                crate::connection::create_client_heartbeat_connection(info).await?,
            ),
        })
    }

    /// §4.2 `is_alive`: has the subprocess exited yet.
    pub async fn is_alive(&mut self) -> bool {
        match &mut self.launched {
            None => false,
            Some(launched) => match launched.process.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => false,
            },
        }
    }

    /// §4.2 `wait`: busy-poll until the process exits, then run its
    /// blocking `wait()` to reap it.
    pub async fn wait(&mut self, poll_interval: Duration) -> Result<()> {
        loop {
            if !self.is_alive().await {
                if let Some(launched) = &mut self.launched {
                    let _ = launched.process.wait().await;
                }
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// §4.2 `interrupt`: dispatch per the kernelspec's `interrupt_mode`.
    pub async fn interrupt(&mut self) -> Result<()> {
        match self.kernelspec.kernelspec.interrupt_mode {
            InterruptMode::Signal => self.signal(interrupt_signal()).await,
            InterruptMode::Message => {
                let control = self.control.as_mut().ok_or_else(|| RuntimeError::NotRunning {
                    kernel_id: self.kernel_id.clone(),
                })?;
                let session = self.kernel_id.clone();
                let request = zasper_protocol::JupyterMessage::new(
                    "interrupt_request",
                    session,
                    serde_json::to_value(zasper_protocol::InterruptRequest {})?,
                );
                control.send(request).await
            }
        }
    }

    /// §4.2 `signal`: send a platform signal to the kernel's process group.
    #[cfg(unix)]
    pub async fn signal(&mut self, signum: i32) -> Result<()> {
        let launched = self.launched.as_ref().ok_or_else(|| RuntimeError::NotRunning {
            kernel_id: self.kernel_id.clone(),
        })?;
        let pid = launched
            .process
            .id()
            .ok_or_else(|| RuntimeError::NotRunning {
                kernel_id: self.kernel_id.clone(),
            })?;
        let signal = nix::sys::signal::Signal::try_from(signum)
            .map_err(RuntimeError::NixError)?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
            .map_err(RuntimeError::NixError)?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn signal(&mut self, _signum: i32) -> Result<()> {
        // Windows only has a hard kill; there's no SIGINT/SIGTERM equivalent
        // for an arbitrary child process from a non-console API.
        if let Some(launched) = &mut self.launched {
            launched.process.start_kill()?;
        }
        Ok(())
    }

    /// §4.2 shutdown state machine: graceful control-channel request, then
    /// SIGTERM, then SIGKILL, each bounded by a grace period. `now=true`
    /// skips straight to a forceful kill.
    pub async fn shutdown(&mut self, now: bool, restart: bool) -> Result<()> {
        if !self.has_kernel() {
            return Err(RuntimeError::NotRunning {
                kernel_id: self.kernel_id.clone(),
            });
        }
        self.shutting_down = true;

        if now {
            self.force_kill().await?;
        } else {
            self.shutdown_status = ShutdownStatus::ShutdownRequest;
            if self.send_shutdown_request(restart).await.is_ok()
                && self.wait_for_exit(SHUTDOWN_GRACE).await
            {
                // exited gracefully
            } else {
                self.shutdown_status = ShutdownStatus::SigtermRequest;
                let _ = self.signal(sigterm_signal()).await;
                if !self.wait_for_exit(SIGTERM_GRACE).await {
                    self.force_kill().await?;
                }
            }
        }

        self.shutdown_status = ShutdownStatus::Unset;
        self.shutting_down = false;
        self.state = KernelState::Dead;

        self.cleanup_resources(restart).await;
        Ok(())
    }

    /// §4.2 `restart`: reuse the shutdown state machine with `restart=true`
    /// (suppressing connection-file deletion), then start again with the
    /// same extra launch-args the kernel was originally started with.
    pub async fn restart(&mut self, now: bool, new_ports: bool) -> Result<()> {
        if self.has_kernel() {
            self.shutdown(now, true).await?;
        }
        let extra_args = self.last_extra_args.clone();
        self.start(&extra_args, new_ports).await
    }

    async fn send_shutdown_request(&mut self, restart: bool) -> Result<()> {
        let kernel_id = self.kernel_id.clone();
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| RuntimeError::NotRunning {
                kernel_id: kernel_id.clone(),
            })?;
        let request = zasper_protocol::JupyterMessage::new(
            "shutdown_request",
            kernel_id,
            serde_json::to_value(zasper_protocol::ShutdownRequest { restart })?,
        );
        control.send(request).await
    }

    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        timeout(grace, self.wait(Duration::from_millis(100)))
            .await
            .is_ok()
    }

    async fn force_kill(&mut self) -> Result<()> {
        self.shutdown_status = ShutdownStatus::SigkillRequest;
        if let Some(launched) = &mut self.launched {
            let _ = launched.process.start_kill();
            timeout(SIGKILL_GRACE, launched.process.wait())
                .await
                .map_err(|_| RuntimeError::ShutdownTimeout {
                    kernel_id: self.kernel_id.clone(),
                })??;
        }
        Ok(())
    }

    /// §4.2 Resource cleanup: close the control socket, remove the
    /// connection file and logs unless this is a restart.
    async fn cleanup_resources(&mut self, restart: bool) {
        self.control = None;
        if let Some(launched) = self.launched.take() {
            if !restart && self.owns_connection_file {
                provisioner::cleanup(&launched, false, true).await;
            }
        }
    }

    /// Patches the recorded environment map a future `restart`/`start` will
    /// launch with. Never touches the live process -- only the next launch
    /// sees it (§9 supplemented `update_env`).
    pub fn update_env(&mut self, patch: HashMap<String, String>) {
        self.extra_env.extend(patch);
    }

    pub fn ports(&self) -> Option<[u16; 5]> {
        self.connection_info.as_ref().map(|info| {
            [
                info.shell_port,
                info.iopub_port,
                info.stdin_port,
                info.control_port,
                info.hb_port,
            ]
        })
    }
}

#[cfg(unix)]
fn interrupt_signal() -> i32 {
    nix::sys::signal::Signal::SIGINT as i32
}

#[cfg(not(unix))]
fn interrupt_signal() -> i32 {
    0
}

#[cfg(unix)]
fn sigterm_signal() -> i32 {
    nix::sys::signal::Signal::SIGTERM as i32
}

#[cfg(not(unix))]
fn sigterm_signal() -> i32 {
    0
}

/// One of the five channel sockets, returned by `connect_channel` so a
/// caller can match on which it got without the enum carrying every
/// variant's generic parameters around.
pub enum ChannelSocket {
    Shell(crate::connection::ClientShellConnection),
    Control(crate::connection::ClientControlConnection),
    Stdin(crate::connection::ClientStdinConnection),
    IoPub(crate::connection::ClientIoPubConnection),
    Heartbeat(crate::connection::ClientHeartbeatConnection),
}

/// The minimal surface the restarter needs from a kernel manager (§9:
/// breaking the KM/Restarter circular coupling with an observer interface).
#[async_trait]
pub trait RestartObserver: Send + Sync {
    async fn is_alive(&self) -> bool;
    async fn shutting_down(&self) -> bool;
    async fn restart(&self, new_ports: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_state_as_str_matches_spec_vocabulary() {
        assert_eq!(KernelState::Starting.as_str(), "starting");
        assert_eq!(KernelState::Idle.as_str(), "idle");
        assert_eq!(KernelState::Busy.as_str(), "busy");
        assert_eq!(KernelState::Dead.as_str(), "dead");
        assert_eq!(KernelState::Unknown.as_str(), "unknown");
    }

    #[test]
    fn shutdown_status_defaults_to_unset() {
        assert_eq!(ShutdownStatus::default(), ShutdownStatus::Unset);
    }

    fn sample_manager() -> KernelManager {
        KernelManager::new(
            "kernel-1".to_string(),
            KernelspecDir {
                kernel_name: "python3".to_string(),
                path: PathBuf::from("/tmp"),
                kernelspec: zasper_protocol::JupyterKernelspec {
                    argv: vec!["python3".to_string()],
                    display_name: "Python 3".to_string(),
                    language: "python".to_string(),
                    metadata: None,
                    interrupt_mode: InterruptMode::Signal,
                    env: None,
                },
                resources: Vec::new(),
            },
            PathBuf::from("/tmp"),
            "127.0.0.1".parse().unwrap(),
            HashMap::new(),
            None,
        )
    }

    #[test]
    fn update_env_patches_without_touching_live_process() {
        let mut manager = sample_manager();
        let mut patch = HashMap::new();
        patch.insert("FOO".to_string(), "bar".to_string());
        manager.update_env(patch);
        assert_eq!(manager.extra_env.get("FOO"), Some(&"bar".to_string()));
        assert!(!manager.has_kernel());
    }
}
