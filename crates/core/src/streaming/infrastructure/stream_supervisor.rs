use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::CaptureConfig;
use crate::shared::clock::{Clock, SystemClock};
use crate::shared::frame::SharedFrame;
use crate::shared::locator::{Locator, StreamKey};
use crate::streaming::domain::connection::{
    Connection, ConnectionHandle, ConnectionInfo, ConnectionState,
};
use crate::streaming::domain::stream_error::{FrameError, StreamError};
use crate::streaming::infrastructure::capture_worker::CaptureWorker;
use crate::streaming::infrastructure::idle_reaper::IdleReaper;
use crate::video::domain::frame_source::FrameSourceFactory;

/// Owns every open connection and its capture thread.
///
/// Connections are keyed by the normalized locator, so repeated requests
/// for the same camera share one source. Opens of one key are serialized;
/// sources are opened and stopped outside the registry lock, so a slow
/// camera never holds up calls for other keys.
pub struct StreamSupervisor {
    factory: Arc<dyn FrameSourceFactory>,
    config: CaptureConfig,
    clock: Arc<dyn Clock>,
    registry: Mutex<Registry>,
    opened: Condvar,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<StreamKey, Slot>,
    /// Capture threads that missed the close timeout and may still hold
    /// their source. A key is not reopened until its threads are gone.
    draining: HashMap<StreamKey, Vec<CaptureWorker>>,
}

enum Slot {
    /// Some caller is opening this key outside the lock.
    Opening,
    Open(ConnectionEntry),
}

struct ConnectionEntry {
    connection: Arc<Connection>,
    worker: CaptureWorker,
}

impl Registry {
    fn take_open(&mut self, key: &StreamKey) -> Option<ConnectionEntry> {
        if !matches!(self.slots.get(key), Some(Slot::Open(_))) {
            return None;
        }
        match self.slots.remove(key) {
            Some(Slot::Open(entry)) => Some(entry),
            _ => None,
        }
    }

    fn open_entries(&self) -> impl Iterator<Item = (&StreamKey, &ConnectionEntry)> {
        self.slots.iter().filter_map(|(key, slot)| match slot {
            Slot::Open(entry) => Some((key, entry)),
            Slot::Opening => None,
        })
    }

    fn prune_draining(&mut self) {
        self.draining.retain(|_, workers| {
            workers.retain(|worker| !worker.is_finished());
            !workers.is_empty()
        });
    }
}

/// Marks a key as being opened; clears the mark if the open does not
/// complete, including on panic.
struct PendingOpen<'a> {
    supervisor: &'a StreamSupervisor,
    key: StreamKey,
    completed: bool,
}

impl PendingOpen<'_> {
    fn complete(mut self, entry: ConnectionEntry) -> ConnectionHandle {
        let handle = ConnectionHandle::new(Arc::clone(&entry.connection));
        self.supervisor
            .registry()
            .slots
            .insert(self.key.clone(), Slot::Open(entry));
        self.completed = true;
        self.supervisor.opened.notify_all();
        handle
    }
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut registry = self.supervisor.registry();
        if matches!(registry.slots.get(&self.key), Some(Slot::Opening)) {
            registry.slots.remove(&self.key);
        }
        drop(registry);
        self.supervisor.opened.notify_all();
    }
}

impl StreamSupervisor {
    pub fn new(factory: Arc<dyn FrameSourceFactory>, config: CaptureConfig) -> Self {
        Self::with_clock(factory, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        factory: Arc<dyn FrameSourceFactory>,
        config: CaptureConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            factory,
            config,
            clock,
            registry: Mutex::new(Registry::default()),
            opened: Condvar::new(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the live connection for `locator`, opening it if needed.
    ///
    /// A fatal or closed connection under the same key is replaced. Fails
    /// with `OpenFailed` if an earlier capture thread for the key still has
    /// not released its source.
    pub fn open(&self, locator: &Locator) -> Result<ConnectionHandle, StreamError> {
        let key = locator.key();
        let stale = {
            let mut registry = self.registry();
            while matches!(registry.slots.get(&key), Some(Slot::Opening)) {
                registry = self
                    .opened
                    .wait(registry)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if let Some(Slot::Open(entry)) = registry.slots.get(&key) {
                if !entry.connection.state().is_errored() {
                    entry.connection.touch(self.clock.now());
                    return Ok(ConnectionHandle::new(Arc::clone(&entry.connection)));
                }
            }
            match registry.slots.insert(key.clone(), Slot::Opening) {
                Some(Slot::Open(entry)) => Some(entry),
                _ => None,
            }
        };
        let pending = PendingOpen {
            supervisor: self,
            key: key.clone(),
            completed: false,
        };

        if let Some(stale) = stale {
            log::info!("Replacing {} connection {key}", stale.connection.state());
            self.retire(stale);
        }
        self.await_draining(locator)?;
        let entry = self.start(locator)?;
        Ok(pending.complete(entry))
    }

    fn start(&self, locator: &Locator) -> Result<ConnectionEntry, StreamError> {
        let source = self.factory.open(locator).map_err(|e| {
            log::warn!("Failed to open {locator}: {e}");
            StreamError::OpenFailed {
                locator: locator.to_string(),
                reason: e.to_string(),
            }
        })?;
        let metadata = source.metadata();
        log::info!(
            "Opened {locator} ({}x{} @ {:.1} fps)",
            metadata.width,
            metadata.height,
            metadata.fps
        );

        let connection = Arc::new(Connection::new(
            locator.clone(),
            self.config.buffer_capacity,
            metadata,
            self.clock.now(),
        ));
        let worker = CaptureWorker::spawn(
            Arc::clone(&connection),
            source,
            Arc::clone(&self.factory),
            self.config.clone(),
        )
        .map_err(|e| StreamError::Spawn {
            key: locator.key(),
            reason: e.to_string(),
        })?;
        Ok(ConnectionEntry { connection, worker })
    }

    /// Gives detached capture threads of this key one more close timeout to
    /// release their source.
    fn await_draining(&self, locator: &Locator) -> Result<(), StreamError> {
        let key = locator.key();
        let Some(workers) = self.registry().draining.remove(&key) else {
            return Ok(());
        };
        let timeout = self.config.close_timeout();
        let running: Vec<CaptureWorker> = workers
            .into_iter()
            .filter_map(|mut worker| (!worker.stop(timeout)).then_some(worker))
            .collect();
        if running.is_empty() {
            return Ok(());
        }
        log::warn!("{key}: previous capture thread still holds the source");
        self.registry().draining.insert(key, running);
        Err(StreamError::OpenFailed {
            locator: locator.to_string(),
            reason: "previous capture thread has not released the source".into(),
        })
    }

    /// Oldest buffered frame, else the last-known-good frame.
    pub fn get_frame(&self, handle: &ConnectionHandle) -> Result<SharedFrame, FrameError> {
        let connection = handle.connection();
        connection.touch(self.clock.now());
        if connection.state().is_errored() {
            return Err(FrameError::Unavailable);
        }
        connection.buffer().pop().ok_or(FrameError::Empty)
    }

    /// Stops and removes the connection. Returns `false` for unknown keys
    /// and for keys still being opened.
    pub fn close(&self, key: &StreamKey) -> bool {
        let removed = self.registry().take_open(key);
        match removed {
            Some(entry) => {
                self.retire(entry);
                true
            }
            None => false,
        }
    }

    /// Closes connections idle longer than `max_idle` or already errored.
    pub fn reap_idle(&self, max_idle: Duration) -> Vec<StreamKey> {
        let now = self.clock.now();
        let reaped: Vec<ConnectionEntry> = {
            let mut registry = self.registry();
            registry.prune_draining();
            let keys: Vec<StreamKey> = registry
                .open_entries()
                .filter(|(_, entry)| {
                    entry.connection.state().is_errored()
                        || entry.connection.idle_for(now) > max_idle
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| registry.take_open(key)).collect()
        };

        let mut keys = Vec::with_capacity(reaped.len());
        for entry in reaped {
            log::info!(
                "Reaping {} connection {} (idle {:.0?})",
                entry.connection.state(),
                entry.connection.key(),
                entry.connection.idle_for(now)
            );
            keys.push(entry.connection.key().clone());
            self.retire(entry);
        }
        keys.sort();
        keys
    }

    /// Runs `reap_idle(max_idle)` every `interval` on a background thread
    /// until the returned handle is dropped.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> std::io::Result<IdleReaper> {
        IdleReaper::spawn(Arc::downgrade(self), interval, max_idle)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let now = self.clock.now();
        let mut infos: Vec<ConnectionInfo> = self
            .registry()
            .open_entries()
            .map(|(_, entry)| entry.connection.info(now))
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Closes every open connection.
    pub fn shutdown(&self) {
        let drained: Vec<ConnectionEntry> = {
            let mut registry = self.registry();
            let keys: Vec<StreamKey> = registry.open_entries().map(|(k, _)| k.clone()).collect();
            keys.iter().filter_map(|key| registry.take_open(key)).collect()
        };
        if !drained.is_empty() {
            log::info!("Shutting down {} connection(s)", drained.len());
        }
        for entry in drained {
            self.retire(entry);
        }
    }

    fn retire(&self, entry: ConnectionEntry) {
        let ConnectionEntry {
            connection,
            mut worker,
        } = entry;
        let key = connection.key().clone();
        let timeout = self.config.close_timeout();
        let stopped = worker.stop(timeout);
        connection.set_state(ConnectionState::Closed);
        connection.buffer().clear();
        if stopped {
            log::info!("Closed {key}");
        } else {
            log::warn!("{key}: capture thread did not stop within {timeout:?}, detaching");
            self.registry().draining.entry(key).or_default().push(worker);
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
