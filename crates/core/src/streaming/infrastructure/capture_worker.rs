use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::config::CaptureConfig;
use crate::streaming::domain::connection::{Connection, ConnectionState};
use crate::video::domain::frame_source::{FrameSource, FrameSourceFactory};

/// Owner-side handle of a connection's capture thread.
///
/// Dropping the handle signals the thread to stop without waiting for it.
pub struct CaptureWorker {
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Starts capturing from an already opened `source`.
    ///
    /// The source moves into the thread; nothing else touches it afterwards.
    pub fn spawn(
        connection: Arc<Connection>,
        source: Box<dyn FrameSource>,
        factory: Arc<dyn FrameSourceFactory>,
        config: CaptureConfig,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let name = format!("capture {}", connection.key());

        let thread = std::thread::Builder::new().name(name).spawn(move || {
            let mut capture = CaptureLoop {
                connection,
                source: Some(source),
                factory,
                config,
                stop_rx,
                done_tx,
                exit: Exit::Failed,
            };
            capture.run();
        })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            done_rx,
            thread: Some(thread),
        })
    }

    /// Signals stop and waits up to `timeout` for the thread to release its
    /// source. Returns `false` if the thread did not acknowledge in time; the
    /// call may be repeated to keep waiting.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.stop_tx.take();
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    // A panicked capture thread already marked its connection fatal.
                    let _ = thread.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop_tx.take();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exit {
    Stopped,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// State owned by the capture thread.
///
/// Its `Drop` is the single exit path: it releases the source, settles the
/// connection state and acknowledges termination, also when a source panics.
struct CaptureLoop {
    connection: Arc<Connection>,
    source: Option<Box<dyn FrameSource>>,
    factory: Arc<dyn FrameSourceFactory>,
    config: CaptureConfig,
    stop_rx: Receiver<()>,
    done_tx: Sender<()>,
    exit: Exit,
}

impl CaptureLoop {
    fn run(&mut self) {
        log::info!("Capture started for {}", self.connection.locator());
        loop {
            if self.stop_requested() {
                self.exit = Exit::Stopped;
                return;
            }
            if self.step() == Flow::Stop {
                return;
            }
        }
    }

    fn step(&mut self) -> Flow {
        let result = match self.source.as_mut() {
            Some(source) => source.read(),
            None => Err("source not open".into()),
        };

        match result {
            Ok(frame) => {
                log::trace!("{}: frame {}", self.connection.key(), frame.index());
                self.connection.record_frame(frame);
                self.pause(self.config.frame_pause())
            }
            Err(e) => {
                let errors = self.connection.record_read_error();
                log::debug!("{}: read failed ({errors} in a row): {e}", self.connection.key());
                if errors > self.config.max_consecutive_errors {
                    self.reconnect()
                } else {
                    self.pause(self.config.read_retry_delay())
                }
            }
        }
    }

    fn reconnect(&mut self) -> Flow {
        let key = self.connection.key().clone();
        log::warn!("{key}: too many read errors, reconnecting");
        self.connection.set_state(ConnectionState::Reconnecting);
        self.release_source();

        loop {
            if self.pause(self.config.reopen_delay()) == Flow::Stop {
                return Flow::Stop;
            }
            match self.factory.open(self.connection.locator()) {
                Ok(source) => {
                    self.connection.record_reopened(source.metadata());
                    self.source = Some(source);
                    log::info!("{key}: reconnected");
                    return Flow::Continue;
                }
                Err(e) => {
                    let attempts = self.connection.record_reopen_failure();
                    log::warn!(
                        "{key}: reopen attempt {attempts}/{} failed: {e}",
                        self.config.max_reopen_attempts
                    );
                    if attempts >= self.config.max_reopen_attempts {
                        log::error!("{key}: giving up after {attempts} reopen attempts");
                        self.exit = Exit::Failed;
                        return Flow::Stop;
                    }
                }
            }
        }
    }

    /// Waits for `duration` unless stop is signalled first.
    fn pause(&mut self, duration: Duration) -> Flow {
        match self.stop_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Flow::Continue,
            _ => {
                self.exit = Exit::Stopped;
                Flow::Stop
            }
        }
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    fn release_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            if catch_unwind(AssertUnwindSafe(|| source.release())).is_err() {
                log::warn!("{}: source panicked while releasing", self.connection.key());
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.release_source();
        let state = match self.exit {
            Exit::Stopped => ConnectionState::Closed,
            Exit::Failed => ConnectionState::Fatal,
        };
        self.connection.set_state(state);
        if std::thread::panicking() {
            log::error!("{}: capture thread panicked", self.connection.key());
        }
        log::info!("Capture ended for {} ({state})", self.connection.key());
        let _ = self.done_tx.send(());
    }
}
