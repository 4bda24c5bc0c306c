use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::shared::frame::Frame;
use crate::shared::locator::{Locator, StreamKey};
use crate::shared::stream_metadata::StreamMetadata;
use crate::streaming::domain::frame_buffer::FrameBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Live,
    /// Reads kept failing; the capture thread is reopening the source.
    Reconnecting,
    /// Reopen attempts are exhausted or the capture thread died.
    Fatal,
    Closed,
}

impl ConnectionState {
    /// Errored connections never produce frames again and are replaced on
    /// the next open.
    pub fn is_errored(self) -> bool {
        matches!(self, ConnectionState::Fatal | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Live => "live",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Fatal => "fatal",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One open video source: its frame buffer plus health bookkeeping shared
/// between the capture thread and consumers.
pub struct Connection {
    key: StreamKey,
    locator: Locator,
    buffer: FrameBuffer,
    status: Mutex<ConnectionStatus>,
}

#[derive(Clone, Debug)]
struct ConnectionStatus {
    state: ConnectionState,
    last_access: Instant,
    consecutive_errors: u32,
    retry_count: u32,
    metadata: StreamMetadata,
    frames_captured: u64,
}

impl Connection {
    pub fn new(
        locator: Locator,
        buffer_capacity: usize,
        metadata: StreamMetadata,
        now: Instant,
    ) -> Self {
        Self {
            key: locator.key(),
            locator,
            buffer: FrameBuffer::new(buffer_capacity),
            status: Mutex::new(ConnectionStatus {
                state: ConnectionState::Live,
                last_access: now,
                consecutive_errors: 0,
                retry_count: 0,
                metadata,
                frames_captured: 0,
            }),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.status().state = state;
    }

    pub fn touch(&self, now: Instant) {
        self.status().last_access = now;
    }

    /// Time since the last consumer access, zero if `now` is earlier.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.status().last_access)
    }

    /// Records a successful read and buffers the frame.
    pub fn record_frame(&self, frame: Frame) {
        {
            let mut status = self.status();
            status.consecutive_errors = 0;
            status.frames_captured += 1;
            status.metadata.width = frame.width();
            status.metadata.height = frame.height();
        }
        self.buffer.push(Arc::new(frame));
    }

    /// Returns the consecutive error count after this failure.
    pub fn record_read_error(&self) -> u32 {
        let mut status = self.status();
        status.consecutive_errors += 1;
        status.consecutive_errors
    }

    /// Returns the reopen attempt count after this failure.
    pub fn record_reopen_failure(&self) -> u32 {
        let mut status = self.status();
        status.retry_count += 1;
        status.retry_count
    }

    pub fn record_reopened(&self, metadata: StreamMetadata) {
        let mut status = self.status();
        status.consecutive_errors = 0;
        status.retry_count = 0;
        status.metadata = metadata;
        status.state = ConnectionState::Live;
    }

    pub fn info(&self, now: Instant) -> ConnectionInfo {
        let status = self.status().clone();
        ConnectionInfo {
            key: self.key.clone(),
            locator: self.locator.to_string(),
            state: status.state,
            idle: now.saturating_duration_since(status.last_access),
            consecutive_errors: status.consecutive_errors,
            retry_count: status.retry_count,
            width: status.metadata.width,
            height: status.metadata.height,
            fps: status.metadata.fps,
            frames_captured: status.frames_captured,
            buffered: self.buffer.len(),
        }
    }

    fn status(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of a connection for diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionInfo {
    pub key: StreamKey,
    /// Display form of the locator, credentials masked.
    pub locator: String,
    pub state: ConnectionState,
    pub idle: Duration,
    pub consecutive_errors: u32,
    pub retry_count: u32,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames_captured: u64,
    pub buffered: usize,
}

/// Cloneable consumer reference to a supervised connection.
///
/// Holding or dropping a handle never affects the connection's lifetime;
/// only the supervisor closes connections.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<Connection>,
}

impl ConnectionHandle {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn key(&self) -> &StreamKey {
        self.connection.key()
    }

    pub fn locator(&self) -> &Locator {
        self.connection.locator()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Whether both handles point at the same connection instance.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", self.key())
            .field("state", &self.state())
            .finish()
    }
}
