//! Time-bounded lifetime extension for shared entities.
//!
//! The [`Expirator`] holds a strong reference to every object handed to
//! [`add_object`](Expirator::add_object) until the requested wall-clock deadline passes. It is
//! not a cache: nothing can be looked up in it. Its only effect is that an entity stays alive
//! (and therefore stays resolvable through weak references and weak caches) for a while after
//! every other owner has dropped it.
//!
//! # Lifecycle
//!
//! The expirator is constructed explicitly and shared by `Arc`. It starts `Idle`; the first
//! [`add_object`](Expirator::add_object) (or an explicit [`start`](Expirator::start)) spawns the
//! sweep thread and moves it to `Armed`. Every tick the sweep removes all records whose deadline
//! is `<= now`. [`shutdown`](Expirator::shutdown) stops the thread, waiting at most the
//! configured shutdown timeout; records still held are released when the expirator is dropped.
//!
//! # Locking
//!
//! The retention map has its own lock. Both `add_object` and the sweep only do map operations
//! under it; expired objects are dropped after the lock is released, since dropping the last
//! strong reference may run arbitrary entity destructors.
use std::{
    any::Any,
    collections::BTreeMap,
    io,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant, SystemTime},
};

use futures_channel::oneshot::{self, Sender as OSender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{config::ExpiratorConfig, runtime::RuntimeWrapper};

pub type ControlledObject = Arc<dyn Any + Send + Sync>;

type RetentionMap = BTreeMap<SystemTime, Vec<ControlledObject>>;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiratorState {
    Idle,
    Armed,
    Stopped,
}

struct SweepWorker {
    handle: JoinHandle<()>,
    stop: OSender<()>,
}

enum Lifecycle {
    Idle,
    Armed(SweepWorker),
    Stopped,
}

pub struct Expirator {
    config: ExpiratorConfig,
    controlled: Arc<Mutex<RetentionMap>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Expirator {
    pub fn new(config: ExpiratorConfig) -> Self {
        Expirator {
            config,
            controlled: Arc::new(Mutex::new(BTreeMap::new())),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn state(&self) -> ExpiratorState {
        match &*self.lifecycle.lock() {
            Lifecycle::Idle => ExpiratorState::Idle,
            Lifecycle::Armed(_) => ExpiratorState::Armed,
            Lifecycle::Stopped => ExpiratorState::Stopped,
        }
    }

    /// Keeps `object` alive until `expire_at`.
    ///
    /// The first call arms the sweep thread. After [`shutdown`](Expirator::shutdown) objects are
    /// still accepted but only released by manual [`sweep`](Expirator::sweep)s or on drop.
    pub fn add_object<O>(&self, object: Arc<O>, expire_at: SystemTime)
    where
        O: Any + Send + Sync,
    {
        self.controlled
            .lock()
            .entry(expire_at)
            .or_default()
            .push(object as ControlledObject);

        if self.state() == ExpiratorState::Idle {
            if let Err(e) = self.start() {
                warn!("cache expirator failed to start sweep thread: {e}");
            }
        }
    }

    /// Spawns the sweep thread if the expirator is idle.
    pub fn start(&self) -> io::Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Ok(());
        }

        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let controlled = self.controlled.clone();
        let interval = self.config.sweep_interval();
        let runtime_config = self.config.runtime.clone();
        let handle = std::thread::Builder::new()
            .name("relaykit-expirator".to_string())
            .spawn(move || {
                let mut runtime = match RuntimeWrapper::new(&runtime_config) {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("cache expirator failed to build runtime: {e}");
                        return;
                    }
                };
                runtime.block_on(async move {
                    info!("cache expirator timer started, period {interval:?}");
                    loop {
                        monoio::select! {
                            _ = &mut stop_rx => {
                                info!("cache expirator is notified to stop");
                                break;
                            }
                            _ = monoio::time::sleep(interval) => {
                                sweep_expired(&controlled, SystemTime::now());
                            }
                        }
                    }
                });
            })?;
        *lifecycle = Lifecycle::Armed(SweepWorker { handle, stop });
        Ok(())
    }

    /// Runs one sweep tick now. Returns the number of released objects.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.controlled, SystemTime::now())
    }

    /// Number of objects currently kept alive.
    pub fn len(&self) -> usize {
        self.controlled.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.controlled.lock().is_empty()
    }

    /// Stops the sweep thread, waiting for it at most the configured shutdown timeout.
    ///
    /// A thread that does not finish in time is detached.
    pub fn shutdown(&self) {
        let worker = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Armed(worker) => worker,
                Lifecycle::Idle | Lifecycle::Stopped => return,
            }
        };

        let _ = worker.stop.send(());
        let deadline = Instant::now() + self.config.shutdown_timeout();
        while !worker.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("cache expirator thread did not stop in time, detaching it");
                return;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
        if worker.handle.join().is_err() {
            warn!("cache expirator thread panicked");
        }
        info!("cache expirator stopped");
    }
}

impl Drop for Expirator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_expired(controlled: &Mutex<RetentionMap>, now: SystemTime) -> usize {
    let mut expired = Vec::new();
    {
        let mut map = controlled.lock();
        while let Some(entry) = map.first_entry() {
            if *entry.key() > now {
                break;
            }
            expired.push(entry.remove());
        }
    }
    let count: usize = expired.iter().map(Vec::len).sum();
    debug!("cache expirator removing {count} objects");
    drop(expired);
    count
}
