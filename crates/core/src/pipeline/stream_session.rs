use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::annotation::infrastructure::placeholder::{placeholder_frame, RECONNECTING_MESSAGE};
use crate::attendance::domain::presence_event::PresenceEvent;
use crate::pipeline::session_logger::SessionLogger;
use crate::pipeline::stream_service::ServiceContext;
use crate::recognition::domain::match_result::MatchResult;
use crate::shared::constants::{PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH};
use crate::shared::frame::Frame;
use crate::streaming::domain::connection::{ConnectionHandle, ConnectionState};
use crate::streaming::domain::stream_error::{FrameError, StreamError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// An annotated camera frame.
    Live,
    /// A placeholder shown while the camera is being reconnected.
    Reconnecting,
}

/// One element of a session's output sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOutput {
    pub kind: OutputKind,
    pub frame_index: usize,
    pub encoded: Vec<u8>,
    pub content_type: &'static str,
    pub matches: Vec<MatchResult>,
    pub events: Vec<PresenceEvent>,
}

/// A consumer's view of one connection: an endless, paced sequence of
/// encoded outputs.
///
/// The sequence ends after yielding one `StreamError::Unavailable` once the
/// connection is fatal or closed. Dropping the session leaves the
/// connection open for other consumers and the idle reaper.
pub struct StreamSession {
    context: Arc<ServiceContext>,
    handle: ConnectionHandle,
    logger: Box<dyn SessionLogger>,
    misses: u32,
    next_due: Option<Instant>,
    pending_events: Vec<PresenceEvent>,
    emitted: u64,
    finished: bool,
}

impl StreamSession {
    pub(crate) fn new(
        context: Arc<ServiceContext>,
        handle: ConnectionHandle,
        logger: Box<dyn SessionLogger>,
    ) -> Self {
        Self {
            context,
            handle,
            logger,
            misses: 0,
            next_due: None,
            pending_events: Vec::new(),
            emitted: 0,
            finished: false,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn pace(&mut self) {
        if let Some(due) = self.next_due.take() {
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
    }

    fn schedule(&mut self, delay: Duration) {
        self.next_due = Some(Instant::now() + delay);
    }

    fn emit(&mut self, output: StreamOutput) -> Option<Result<StreamOutput, StreamError>> {
        self.emitted += 1;
        self.logger.frame(self.emitted);
        Some(Ok(output))
    }

    fn process(&mut self, frame: &Frame) -> Option<StreamOutput> {
        let gallery = self.context.gallery.snapshot();
        let started = Instant::now();
        let recognition = self.context.engine.process(frame, &gallery);
        self.logger.timing("recognize", elapsed_ms(started));
        self.logger.metric("faces", recognition.matches.len() as f64);

        let now = self.context.supervisor.clock().utc_now();
        for m in &recognition.matches {
            let Some(info) = &m.identity else {
                continue;
            };
            let Some(event_type) = self.context.debouncer.evaluate(&info.key(), now) else {
                continue;
            };
            let event = PresenceEvent::new(info, event_type, m.similarity, now);
            log::info!(
                "{} {} ({:.2}) on {}",
                event.name,
                event.event_type,
                event.confidence,
                self.handle.key()
            );
            if let Err(e) = self.context.attendance_log.append(&event) {
                log::warn!("Failed to record attendance for {}: {e}", event.identity);
            }
            self.pending_events.push(event);
        }

        let started = Instant::now();
        let encoded = self.encode(&recognition.frame)?;
        self.logger.timing("encode", elapsed_ms(started));
        self.logger.metric("events", self.pending_events.len() as f64);

        Some(StreamOutput {
            kind: OutputKind::Live,
            frame_index: frame.index(),
            encoded,
            content_type: self.context.encoder.content_type(),
            matches: recognition.matches,
            events: std::mem::take(&mut self.pending_events),
        })
    }

    fn placeholder(&mut self) -> Option<StreamOutput> {
        let frame = placeholder_frame(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, RECONNECTING_MESSAGE);
        let encoded = self.encode(&frame)?;
        Some(StreamOutput {
            kind: OutputKind::Reconnecting,
            frame_index: frame.index(),
            encoded,
            content_type: self.context.encoder.content_type(),
            matches: Vec::new(),
            events: Vec::new(),
        })
    }

    /// Encode failures drop the frame; pending events ride on the next output.
    fn encode(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        match self.context.encoder.encode(frame) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("{}: failed to encode frame {}: {e}", self.handle.key(), frame.index());
                None
            }
        }
    }
}

impl Iterator for StreamSession {
    type Item = Result<StreamOutput, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let interval = self.context.session.frame_interval();
        let retry = self.context.session.frame_retry_delay();

        loop {
            self.pace();
            let started = Instant::now();
            let fetched = self.context.supervisor.get_frame(&self.handle);
            self.logger.timing("fetch", elapsed_ms(started));
            let reconnecting = self.handle.state() == ConnectionState::Reconnecting;

            match fetched {
                Err(FrameError::Unavailable) => {
                    self.finished = true;
                    log::warn!("{} is unavailable, ending session", self.handle.key());
                    return Some(Err(StreamError::Unavailable {
                        key: self.handle.key().clone(),
                    }));
                }
                Ok(frame) if !reconnecting => {
                    self.misses = 0;
                    self.schedule(interval);
                    if let Some(output) = self.process(&frame) {
                        return self.emit(output);
                    }
                }
                _ => {
                    self.misses += 1;
                    self.schedule(retry);
                    if reconnecting || self.misses > self.context.session.placeholder_after_misses {
                        if let Some(output) = self.placeholder() {
                            return self.emit(output);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.logger.summary();
        log::debug!("Session detached from {}", self.handle.key());
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
