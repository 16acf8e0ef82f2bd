//! Per-kernel heartbeat poll and bounded auto-restart state machine (§4.3
//! Restarter).
//!
//! The restarter only ever talks to its kernel through the
//! [`RestartObserver`](crate::kernel_manager::RestartObserver) trait, so it
//! never needs to know about `MultiKernelManager` or even about
//! `KernelManager` directly -- the pool wires the two together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::kernel_manager::RestartObserver;

#[derive(Debug, Clone, Copy)]
pub struct RestarterConfig {
    pub time_to_dead: Duration,
    pub stable_start_time: Duration,
    pub restart_limit: u32,
    pub random_ports_until_alive: bool,
}

impl Default for RestarterConfig {
    fn default() -> Self {
        RestarterConfig {
            time_to_dead: Duration::from_secs(3),
            stable_start_time: Duration::from_secs(10),
            restart_limit: 5,
            random_ports_until_alive: true,
        }
    }
}

/// Which callback bucket fired (§4.3: "two named buckets").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartEvent {
    Restart,
    Dead,
}

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    restart: Vec<(u64, Callback)>,
    dead: Vec<(u64, Callback)>,
}

impl Callbacks {
    fn bucket(&mut self, event: RestartEvent) -> &mut Vec<(u64, Callback)> {
        match event {
            RestartEvent::Restart => &mut self.restart,
            RestartEvent::Dead => &mut self.dead,
        }
    }

    fn fire(&self, event: RestartEvent) {
        let bucket = match event {
            RestartEvent::Restart => &self.restart,
            RestartEvent::Dead => &self.dead,
        };
        for (_, callback) in bucket {
            callback();
        }
    }
}

/// A handle to a running restarter task. Dropping it does not stop the
/// task -- call [`stop`](Restarter::stop) explicitly, mirroring the
/// teacher's explicit `start`/`stop` pair rather than relying on drop glue.
pub struct Restarter {
    callbacks: Arc<StdMutex<Callbacks>>,
    next_callback_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Mutable poll state, ticked once per `time_to_dead` interval. Kept
/// separate from `Restarter` so the tokio task owns it exclusively.
struct PollState {
    last_dead: Instant,
    restarting: bool,
    restart_count: u32,
    initial_startup: bool,
}

impl Restarter {
    /// Spawns the periodic poll task against `observer` and returns a
    /// handle for registering callbacks and stopping it.
    pub fn spawn<O>(observer: O, config: RestarterConfig) -> Self
    where
        O: RestartObserver + 'static,
    {
        let callbacks = Arc::new(StdMutex::new(Callbacks::default()));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_callbacks = callbacks.clone();
        let task = tokio::spawn(async move {
            let mut state = PollState {
                last_dead: Instant::now(),
                restarting: false,
                restart_count: 0,
                initial_startup: true,
            };
            let mut interval = tokio::time::interval(config.time_to_dead);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        if tick(&observer, &config, &mut state, &task_callbacks).await {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Restarter {
            callbacks,
            next_callback_id: AtomicU64::new(0),
            stop_tx,
            task,
        }
    }

    /// §4.3: "Registration is additive." Returns an id usable with
    /// [`remove_callback`](Restarter::remove_callback).
    pub fn add_callback(
        &self,
        event: RestartEvent,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap()
            .bucket(event)
            .push((id, Box::new(callback)));
        id
    }

    /// §4.3: "removal is best-effort" -- removing an unknown id is a no-op.
    pub fn remove_callback(&self, event: RestartEvent, id: u64) {
        self.callbacks
            .lock()
            .unwrap()
            .bucket(event)
            .retain(|(cb_id, _)| *cb_id != id);
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn join(self) {
        self.stop();
        let _ = self.task.await;
    }
}

/// One poll tick (§4.3 algorithm). Returns `true` if the restarter should
/// stop polling entirely (restart budget exhausted).
async fn tick<O: RestartObserver>(
    observer: &O,
    config: &RestarterConfig,
    state: &mut PollState,
    callbacks: &Arc<StdMutex<Callbacks>>,
) -> bool {
    if observer.shutting_down().await {
        return false;
    }

    let now = Instant::now();
    if observer.is_alive().await {
        let stable_start_time = config.stable_start_time;
        if state.initial_startup && now.duration_since(state.last_dead) >= stable_start_time {
            state.initial_startup = false;
        }
        if state.restarting && now.duration_since(state.last_dead) >= stable_start_time {
            state.restarting = false;
            log::debug!("restart apparently succeeded");
        }
        false
    } else {
        state.last_dead = now;
        state.restart_count = if state.restarting {
            state.restart_count + 1
        } else {
            1
        };

        if state.restart_count > config.restart_limit {
            log::warn!("restart failed after {} attempts", state.restart_count - 1);
            callbacks.lock().unwrap().fire(RestartEvent::Dead);
            state.restarting = false;
            state.restart_count = 0;
            true
        } else {
            let new_ports = config.random_ports_until_alive && state.initial_startup;
            log::info!(
                "restarting kernel ({}/{}), {} ports",
                state.restart_count,
                config.restart_limit,
                if new_ports { "new" } else { "same" }
            );
            callbacks.lock().unwrap().fire(RestartEvent::Restart);
            if let Err(e) = observer.restart(new_ports).await {
                log::warn!("restart attempt failed: {e}");
            }
            state.restarting = true;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FlakyObserver {
        alive: Arc<AtomicBool>,
        restart_calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl RestartObserver for FlakyObserver {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        async fn shutting_down(&self) -> bool {
            false
        }
        async fn restart(&self, _new_ports: bool) -> crate::Result<()> {
            self.restart_calls.fetch_add(1, Ordering::SeqCst);
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dead_kernel_triggers_restart_callback() {
        let alive = Arc::new(AtomicBool::new(false));
        let restart_calls = Arc::new(AtomicU64::new(0));
        let observer = FlakyObserver {
            alive: alive.clone(),
            restart_calls: restart_calls.clone(),
        };

        let restarter = Restarter::spawn(
            observer,
            RestarterConfig {
                time_to_dead: Duration::from_millis(20),
                stable_start_time: Duration::from_millis(50),
                restart_limit: 5,
                random_ports_until_alive: true,
            },
        );

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        restarter.add_callback(RestartEvent::Restart, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(restart_calls.load(Ordering::SeqCst) >= 1);

        restarter.join().await;
    }

    #[tokio::test]
    async fn exhausting_restart_limit_fires_dead_callback() {
        let alive = Arc::new(AtomicBool::new(false));
        struct NeverRevives {
            alive: Arc<AtomicBool>,
        }
        #[async_trait]
        impl RestartObserver for NeverRevives {
            async fn is_alive(&self) -> bool {
                self.alive.load(Ordering::SeqCst)
            }
            async fn shutting_down(&self) -> bool {
                false
            }
            async fn restart(&self, _new_ports: bool) -> crate::Result<()> {
                Ok(())
            }
        }

        let restarter = Restarter::spawn(
            NeverRevives { alive: alive.clone() },
            RestarterConfig {
                time_to_dead: Duration::from_millis(10),
                stable_start_time: Duration::from_millis(500),
                restart_limit: 2,
                random_ports_until_alive: false,
            },
        );

        let dead_fired = Arc::new(AtomicBool::new(false));
        let dead_clone = dead_fired.clone();
        restarter.add_callback(RestartEvent::Dead, move || {
            dead_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(dead_fired.load(Ordering::SeqCst));

        restarter.join().await;
    }
}
