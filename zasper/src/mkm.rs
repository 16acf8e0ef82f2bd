//! Pool of kernel managers keyed by kernel id: pending-kernel tracking,
//! the IOPub activity tap, the idle culler, and offline-message buffering
//! (§4.4 Multi-Kernel Manager).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;
use zasper_protocol::Channel;
use zasper_runtime::{ChannelSocket, KernelManager, KernelState, RestartObserver, Restarter, RestarterConfig};

use crate::config::Settings;
use crate::error::{AppError, Result};

/// §3 Kernel Record projection returned by `GET /api/kernels[/:id]`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    pub last_activity: DateTime<Utc>,
    pub execution_state: String,
    pub connections: u32,
    pub reason: String,
}

#[derive(Clone)]
enum ReadyState {
    Pending,
    Ready,
    Failed(Arc<String>),
}

/// One buffered channel frame, kept in arrival order (§3 Offline Buffer).
pub struct BufferedFrame {
    pub channel: Channel,
    pub message: zasper_protocol::JupyterMessage,
}

/// Replaces a disconnected bridge's receive handlers: each buffered socket
/// keeps draining into `frames` until a reconnecting client with the same
/// `session_key` claims it back, or a mismatched one causes it to be
/// dropped (closing the sockets).
pub struct OfflineBuffer {
    pub session_key: String,
    frames: Mutex<Vec<BufferedFrame>>,
    stop_tx: watch::Sender<bool>,
    readers: Mutex<Vec<JoinHandle<(Channel, ChannelSocket)>>>,
}

struct KernelEntry {
    manager: Mutex<KernelManager>,
    connection_count: AtomicU32,
    ready_tx: watch::Sender<ReadyState>,
    restarter: Mutex<Option<Restarter>>,
    tap_task: Mutex<Option<JoinHandle<()>>>,
    buffer: Mutex<Option<Arc<OfflineBuffer>>>,
}

/// Observes one pool entry's kernel manager on the restarter's behalf,
/// breaking the KM/Restarter circular coupling (§9).
struct KmObserver {
    entry: Arc<KernelEntry>,
}

#[async_trait]
impl RestartObserver for KmObserver {
    async fn is_alive(&self) -> bool {
        self.entry.manager.lock().await.is_alive().await
    }

    async fn shutting_down(&self) -> bool {
        self.entry.manager.lock().await.shutting_down
    }

    async fn restart(&self, new_ports: bool) -> zasper_runtime::Result<()> {
        self.entry.manager.lock().await.restart(false, new_ports).await
    }
}

pub struct MultiKernelManager {
    kernels: DashMap<String, Arc<KernelEntry>>,
    ip: IpAddr,
    runtime_dir: PathBuf,
    settings: Arc<Settings>,
}

impl MultiKernelManager {
    pub fn new(settings: Arc<Settings>, ip: IpAddr, runtime_dir: PathBuf) -> Self {
        MultiKernelManager {
            kernels: DashMap::new(),
            ip,
            runtime_dir,
            settings,
        }
    }

    /// §4.4 `start`: places the kernel in the pool immediately in `Pending`
    /// state. With `use_pending_kernels` on, the caller gets the id back
    /// right away and a background task drives startup to completion; off,
    /// this awaits that same task and propagates a startup failure (§9 Open
    /// Question resolution). Either way, a kernel that never becomes ready is
    /// removed from the pool rather than left as a phantom entry (the
    /// original removes a kernel that fails to become ready).
    pub async fn start(
        self: &Arc<Self>,
        name: Option<String>,
        kernel_id: Option<String>,
        extra_env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Result<String> {
        let id = kernel_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.kernels.contains_key(&id) {
            return Err(AppError::Conflict(format!("kernel {id} is already running")));
        }

        let kernel_name = name.unwrap_or_else(|| self.settings.default_kernel_name.clone());
        let kernelspec = zasper_runtime::kernelspec::find_kernelspec(&kernel_name)?;

        let manager = KernelManager::new(
            id.clone(),
            kernelspec,
            self.runtime_dir.clone(),
            self.ip,
            extra_env,
            cwd,
        );

        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        let entry = Arc::new(KernelEntry {
            manager: Mutex::new(manager),
            connection_count: AtomicU32::new(0),
            ready_tx,
            restarter: Mutex::new(None),
            tap_task: Mutex::new(None),
            buffer: Mutex::new(None),
        });
        self.kernels.insert(id.clone(), entry.clone());

        let settings = self.settings.clone();
        let task_id = id.clone();
        let mkm = self.clone();
        let start_task = tokio::spawn(async move {
            let result = entry.manager.lock().await.start(&[], false).await;
            match result {
                Ok(()) => {
                    log::info!("kernel {task_id} started");
                    let observer = KmObserver { entry: entry.clone() };
                    let restarter = Restarter::spawn(
                        observer,
                        RestarterConfig {
                            time_to_dead: settings.time_to_dead,
                            stable_start_time: settings.stable_start_time,
                            restart_limit: settings.restart_limit,
                            random_ports_until_alive: true,
                        },
                    );
                    *entry.restarter.lock().await = Some(restarter);
                    let tap = spawn_activity_tap(entry.clone(), task_id.clone());
                    *entry.tap_task.lock().await = Some(tap);
                    let _ = entry.ready_tx.send(ReadyState::Ready);
                }
                Err(e) => {
                    log::warn!("kernel {task_id} failed to start: {e}");
                    let _ = entry.ready_tx.send(ReadyState::Failed(Arc::new(e.to_string())));
                    mkm.kernels.remove(&task_id);
                }
            }
        });

        if self.settings.use_pending_kernels {
            return Ok(id);
        }

        let _ = start_task.await;
        await_ready(ready_rx, &id).await?;
        Ok(id)
    }

    /// §4.4 `shutdown`: stops the restarter and activity tap first so they
    /// don't race the kernel's own teardown, then shuts down the process.
    /// The entry is always dropped from the pool on a non-restart shutdown,
    /// even when the manager reports the kernel was never running (a start
    /// that failed before the process came up) -- otherwise a phantom entry
    /// would linger forever since there is nothing left to shut down a
    /// second time.
    pub async fn shutdown(&self, id: &str, now: bool, restart: bool) -> Result<()> {
        let entry = self.entry(id)?;
        self.teardown_background_tasks(&entry, restart).await;
        let result = entry.manager.lock().await.shutdown(now, restart).await;
        if !restart {
            self.kernels.remove(id);
        }
        match result {
            Ok(()) => Ok(()),
            Err(zasper_runtime::RuntimeError::NotRunning { .. }) if !restart => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<KernelEntry>> {
        self.kernels
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("no such kernel: {id}")))
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.kernels.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn list_models(&self) -> Vec<KernelModel> {
        let mut models = Vec::with_capacity(self.kernels.len());
        for entry in self.kernels.iter() {
            models.push(model_of(entry.value()).await);
        }
        models
    }

    pub async fn get_model(&self, id: &str) -> Result<KernelModel> {
        let entry = self.entry(id)?;
        Ok(model_of(&entry).await)
    }

    async fn teardown_background_tasks(&self, entry: &Arc<KernelEntry>, restart: bool) {
        if !restart {
            if let Some(restarter) = entry.restarter.lock().await.take() {
                restarter.stop();
            }
        }
        if let Some(tap) = entry.tap_task.lock().await.take() {
            tap.abort();
        }
    }

    pub async fn restart(&self, id: &str, now: bool) -> Result<()> {
        let entry = self.entry(id)?;
        entry.manager.lock().await.restart(now, false).await?;
        Ok(())
    }

    /// Patches a running kernel's recorded environment map for use by its
    /// next restart, without touching the live process (§9 supplemented
    /// `update_env`).
    pub async fn update_env(&self, id: &str, patch: HashMap<String, String>) -> Result<()> {
        let entry = self.entry(id)?;
        entry.manager.lock().await.update_env(patch);
        Ok(())
    }

    pub async fn interrupt(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        entry.manager.lock().await.interrupt().await?;
        Ok(())
    }

    pub async fn connect_channel(&self, id: &str, channel: Channel) -> Result<ChannelSocket> {
        let entry = self.entry(id)?;
        Ok(entry.manager.lock().await.connect_channel(channel).await?)
    }

    /// §4.4 "wait for the kernel to be alive (bounded by `kernel_info_timeout`)".
    /// §8 boundary: a zero timeout fails immediately, even against an
    /// already-alive kernel, rather than sneaking in one free aliveness probe.
    pub async fn wait_until_alive(&self, id: &str, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(AppError::Internal(format!(
                "timed out waiting for kernel {id} to come alive"
            )));
        }
        let entry = self.entry(id)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if entry.manager.lock().await.is_alive().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Internal(format!(
                    "timed out waiting for kernel {id} to come alive"
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn notify_connect(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        entry.connection_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Returns the post-decrement connection count so the caller knows
    /// whether it just dropped to zero.
    pub fn notify_disconnect(&self, id: &str) -> Result<u32> {
        let entry = self.entry(id)?;
        let previous = entry.connection_count.fetch_sub(1, Ordering::SeqCst);
        Ok(previous.saturating_sub(1))
    }

    /// §4.4 Offline buffering: takes ownership of the bridge's open
    /// sockets and starts draining them into an in-memory list.
    pub async fn start_buffering(
        &self,
        id: &str,
        session_key: String,
        sockets: Vec<(Channel, ChannelSocket)>,
    ) -> Result<()> {
        let entry = self.entry(id)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let buffer = Arc::new(OfflineBuffer {
            session_key,
            frames: Mutex::new(Vec::new()),
            stop_tx,
            readers: Mutex::new(Vec::new()),
        });

        let mut readers = Vec::new();
        for (channel, socket) in sockets {
            if let ChannelSocket::Heartbeat(_) = socket {
                continue;
            }
            readers.push(spawn_buffer_reader(channel, socket, buffer.clone(), stop_rx.clone()));
        }
        *buffer.readers.lock().await = readers;

        *entry.buffer.lock().await = Some(buffer);
        log::info!("kernel {id} buffering started");
        Ok(())
    }

    /// Returns the buffer and its live sockets if `session_key` matches,
    /// stopping the reader tasks first so no frame is lost or duplicated in
    /// the handoff. A mismatched key discards the buffer and its sockets.
    pub async fn get_buffer(
        &self,
        id: &str,
        session_key: &str,
    ) -> Result<Option<(Vec<BufferedFrame>, Vec<(Channel, ChannelSocket)>)>> {
        let entry = self.entry(id)?;
        let maybe_buffer = entry.buffer.lock().await.take();
        let Some(buffer) = maybe_buffer else {
            return Ok(None);
        };
        let _ = buffer.stop_tx.send(true);
        let mut sockets = Vec::new();
        for reader in buffer.readers.lock().await.drain(..) {
            if let Ok(pair) = reader.await {
                sockets.push(pair);
            }
        }
        if buffer.session_key != session_key {
            log::info!("kernel {id} discarding buffer for mismatched session");
            return Ok(None);
        }
        let frames = std::mem::take(&mut *buffer.frames.lock().await);
        Ok(Some((frames, sockets)))
    }

    pub async fn stop_buffering(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        if let Some(buffer) = entry.buffer.lock().await.take() {
            let _ = buffer.stop_tx.send(true);
            for reader in buffer.readers.lock().await.drain(..) {
                let _ = reader.await;
            }
        }
        Ok(())
    }

    /// §4.4 Culler: scans every kernel once, shutting down the ones that
    /// meet all of the spec's three conditions (or are already dead).
    pub async fn cull_idle(&self) {
        let now = Utc::now();
        let ids: Vec<String> = self.list_ids();
        for id in ids {
            let Ok(entry) = self.entry(&id) else { continue };
            let should_cull = {
                let manager = entry.manager.lock().await;
                if manager.state == KernelState::Dead {
                    true
                } else if self.settings.cull_enabled() {
                    let idle_for = now.signed_duration_since(manager.last_activity);
                    let idle_timeout_met = idle_for
                        >= chrono::Duration::from_std(self.settings.cull_idle_timeout)
                            .unwrap_or(chrono::Duration::zero());
                    let busy_ok = self.settings.cull_busy || manager.state != KernelState::Busy;
                    let connected_ok = self.settings.cull_connected
                        || entry.connection_count.load(Ordering::SeqCst) == 0;
                    idle_timeout_met && busy_ok && connected_ok
                } else {
                    false
                }
            };
            if should_cull {
                log::info!("culling kernel {id}");
                if let Err(e) = self.shutdown(&id, false, false).await {
                    log::warn!("failed to cull kernel {id}: {e}");
                }
            }
        }
    }

    /// Spawns the periodic culler at `cull_interval`. Returns its handle so
    /// the caller can abort it on server shutdown.
    pub fn spawn_culler(self: &Arc<Self>) -> JoinHandle<()> {
        let mkm = self.clone();
        let interval = self.settings.cull_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                mkm.cull_idle().await;
            }
        })
    }
}

/// Waits on a start task's readiness channel directly, independent of the
/// pool map -- a failed start removes its entry from the map as part of the
/// same task that sends `ReadyState::Failed`, so looking the id back up here
/// would race that removal and turn a real startup error into a generic
/// not-found.
async fn await_ready(mut rx: watch::Receiver<ReadyState>, id: &str) -> Result<()> {
    loop {
        match &*rx.borrow() {
            ReadyState::Pending => {}
            ReadyState::Ready => return Ok(()),
            ReadyState::Failed(reason) => {
                return Err(AppError::Internal(reason.to_string()));
            }
        }
        if rx.changed().await.is_err() {
            return Err(AppError::Internal(format!("kernel {id} start task dropped")));
        }
    }
}

async fn model_of(entry: &Arc<KernelEntry>) -> KernelModel {
    let manager = entry.manager.lock().await;
    KernelModel {
        id: manager.kernel_id.clone(),
        name: manager.kernel_name.clone(),
        last_activity: manager.last_activity,
        execution_state: manager.state.as_str().to_string(),
        connections: entry.connection_count.load(Ordering::SeqCst),
        reason: manager.reason.clone(),
    }
}

/// Drains one channel socket into `buffer.frames` until told to stop, then
/// hands the socket back as the task's result so the caller can either
/// close it or rehydrate a reconnecting bridge with it.
fn spawn_buffer_reader(
    channel: Channel,
    socket: ChannelSocket,
    buffer: Arc<OfflineBuffer>,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<(Channel, ChannelSocket)> {
    tokio::spawn(async move {
        macro_rules! drain {
            ($variant:ident, $conn:ident) => {{
                let mut conn = $conn;
                loop {
                    tokio::select! {
                        message = conn.read() => match message {
                            Ok(message) => buffer.frames.lock().await.push(BufferedFrame { channel, message }),
                            Err(_) => break,
                        },
                        _ = stop_rx.changed() => break,
                    }
                }
                (channel, ChannelSocket::$variant(conn))
            }};
        }

        match socket {
            ChannelSocket::Shell(conn) => drain!(Shell, conn),
            ChannelSocket::Control(conn) => drain!(Control, conn),
            ChannelSocket::Stdin(conn) => drain!(Stdin, conn),
            ChannelSocket::IoPub(conn) => drain!(IoPub, conn),
            ChannelSocket::Heartbeat(conn) => (channel, ChannelSocket::Heartbeat(conn)),
        }
    })
}

/// §4.4 Activity tap: decodes just enough of every IOPub frame to bump
/// `last_activity` and, for `status` frames, the kernel's execution state.
fn spawn_activity_tap(entry: Arc<KernelEntry>, kernel_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut iopub = match entry.manager.lock().await.connect_channel(Channel::IoPub).await {
            Ok(ChannelSocket::IoPub(conn)) => conn,
            _ => {
                log::warn!("kernel {kernel_id} activity tap failed to open iopub");
                return;
            }
        };
        loop {
            match iopub.read().await {
                Ok(message) => {
                    let mut manager = entry.manager.lock().await;
                    manager.last_activity = Utc::now();
                    if message.header.msg_type == "status" {
                        if let Ok(status) = message.content_as::<zasper_protocol::Status>() {
                            manager.state = match status.execution_state {
                                zasper_protocol::ExecutionState::Busy => KernelState::Busy,
                                zasper_protocol::ExecutionState::Idle => KernelState::Idle,
                                zasper_protocol::ExecutionState::Starting => KernelState::Starting,
                                zasper_protocol::ExecutionState::Other => manager.state,
                            };
                        }
                    }
                }
                Err(e) => {
                    log::debug!("kernel {kernel_id} activity tap closed: {e}");
                    return;
                }
            }
        }
    })
}
