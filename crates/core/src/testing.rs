//! Fakes for the collaborator traits, shared by unit tests across modules.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::annotation::domain::frame_annotator::FrameAnnotator;
use crate::attendance::domain::attendance_debouncer::AttendanceState;
use crate::attendance::domain::attendance_log::AttendanceLog;
use crate::attendance::domain::presence_event::PresenceEvent;
use crate::config::CaptureConfig;
use crate::recognition::domain::face_analyzer::{DetectedFace, FaceAnalyzer};
use crate::recognition::domain::gallery::IdentityKey;
use crate::recognition::domain::match_result::MatchResult;
use crate::shared::frame::Frame;
use crate::shared::locator::Locator;
use crate::shared::stream_metadata::StreamMetadata;
use crate::video::domain::frame_encoder::FrameEncoder;
use crate::video::domain::frame_source::{FrameSource, FrameSourceFactory, SourceError};

/// Capture timings short enough for tests to run through the whole
/// reconnect state machine in milliseconds.
pub fn fast_capture_config() -> CaptureConfig {
    CaptureConfig {
        buffer_capacity: 30,
        max_consecutive_errors: 5,
        max_reopen_attempts: 3,
        reopen_delay_ms: 2,
        read_retry_delay_ms: 1,
        frame_pause_ms: 1,
        close_timeout_ms: 1000,
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// How a scripted source behaves once opened.
#[derive(Clone, Copy, Debug)]
pub enum SourceScript {
    /// Yields frames forever.
    Endless,
    /// Yields this many frames, then fails every read.
    Frames(usize),
    /// Fails every read.
    Failing,
    /// Panics on the first read.
    Panicking,
    /// Blocks this many milliseconds in every read, then yields a frame.
    Stalling(u64),
}

/// Factory whose opens follow a queue of outcomes, then a fallback.
/// `None` means the open fails.
pub struct ScriptedFactory {
    outcomes: Mutex<VecDeque<Option<SourceScript>>>,
    fallback: Option<SourceScript>,
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
    slow_open: Option<(Locator, Duration)>,
}

impl ScriptedFactory {
    pub fn new(fallback: Option<SourceScript>) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback,
            opens: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
            slow_open: None,
        }
    }

    /// Makes every open of `locator` block for `delay` first.
    pub fn slow_open(mut self, locator: Locator, delay: Duration) -> Self {
        self.slow_open = Some((locator, delay));
        self
    }

    pub fn then(self, outcome: Option<SourceScript>) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl FrameSourceFactory for ScriptedFactory {
    fn open(&self, locator: &Locator) -> Result<Box<dyn FrameSource>, SourceError> {
        if let Some((slow, delay)) = &self.slow_open {
            if slow == locator {
                std::thread::sleep(*delay);
            }
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match outcome {
            Some(script) => Ok(Box::new(ScriptedSource {
                script,
                produced: 0,
                releases: Arc::clone(&self.releases),
            })),
            None => Err(format!("{locator}: connection refused").into()),
        }
    }
}

pub struct ScriptedSource {
    script: SourceScript,
    produced: usize,
    releases: Arc<AtomicUsize>,
}

impl FrameSource for ScriptedSource {
    fn metadata(&self) -> StreamMetadata {
        StreamMetadata::new(8, 6, 0.0, "scripted")
    }

    fn read(&mut self) -> Result<Frame, SourceError> {
        let available = match self.script {
            SourceScript::Endless => true,
            SourceScript::Frames(n) => self.produced < n,
            SourceScript::Failing => false,
            SourceScript::Panicking => panic!("scripted source panic"),
            SourceScript::Stalling(ms) => {
                std::thread::sleep(Duration::from_millis(ms));
                true
            }
        };
        if !available {
            return Err("read timed out".into());
        }
        let frame = Frame::blank(8, 6).with_index(self.produced);
        self.produced += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Analyzer returning the same faces for every frame, or always failing.
pub struct FixedAnalyzer {
    faces: Option<Vec<DetectedFace>>,
    calls: AtomicUsize,
}

impl FixedAnalyzer {
    pub fn faces(faces: Vec<DetectedFace>) -> Self {
        Self {
            faces: Some(faces),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            faces: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceAnalyzer for FixedAnalyzer {
    fn analyze(
        &self,
        _frame: &Frame,
    ) -> Result<Vec<DetectedFace>, Box<dyn std::error::Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.faces.clone().ok_or_else(|| "model not loaded".into())
    }
}

/// Records how many faces each `annotate` call received.
#[derive(Default)]
pub struct RecordingAnnotator {
    calls: Mutex<Vec<usize>>,
}

impl RecordingAnnotator {
    pub fn annotated_faces(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

impl FrameAnnotator for RecordingAnnotator {
    fn annotate(&self, _frame: &mut Frame, matches: &[MatchResult]) {
        self.calls.lock().unwrap().push(matches.len());
    }
}

/// In-memory attendance log that can be told to fail every write.
#[derive(Default)]
pub struct MemoryAttendanceLog {
    events: Mutex<Vec<PresenceEvent>>,
    statuses: Mutex<HashMap<IdentityKey, AttendanceState>>,
    failing: AtomicBool,
}

impl MemoryAttendanceLog {
    pub fn events(&self) -> Vec<PresenceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn seed(&self, identity: IdentityKey, state: AttendanceState) {
        self.statuses.lock().unwrap().insert(identity, state);
    }
}

impl AttendanceLog for MemoryAttendanceLog {
    fn append(&self, event: &PresenceEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("disk full".into());
        }
        self.events.lock().unwrap().push(event.clone());
        self.statuses.lock().unwrap().insert(
            event.identity.clone(),
            AttendanceState {
                last_event: event.event_type,
                at: event.timestamp,
            },
        );
        Ok(())
    }

    fn last_status(
        &self,
        identity: &IdentityKey,
    ) -> Result<Option<AttendanceState>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.statuses.lock().unwrap().get(identity).copied())
    }
}

/// Encoder producing the frame dimensions as bytes; the first
/// `failures` calls fail.
#[derive(Default)]
pub struct FakeEncoder {
    failures: AtomicUsize,
}

impl FakeEncoder {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
        }
    }
}

impl FrameEncoder for FakeEncoder {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("encoder busy".into());
        }
        let mut out = frame.width().to_le_bytes().to_vec();
        out.extend_from_slice(&frame.height().to_le_bytes());
        Ok(out)
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}
