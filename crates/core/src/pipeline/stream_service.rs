use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::attendance::domain::attendance_debouncer::AttendanceDebouncer;
use crate::attendance::domain::attendance_log::AttendanceLog;
use crate::config::SessionConfig;
use crate::pipeline::session_logger::{NullSessionLogger, SessionLogger};
use crate::pipeline::stream_session::StreamSession;
use crate::recognition::domain::face_analyzer::FaceAnalyzer;
use crate::recognition::domain::gallery::{GalleryError, IdentityGallery, SharedGallery};
use crate::recognition::domain::identity_store::IdentityStore;
use crate::recognition::domain::recognition_engine::RecognitionEngine;
use crate::recognition::infrastructure::directory_identity_store::{
    DirectoryIdentityStore, RegistrationError,
};
use crate::recognition::infrastructure::gallery_builder::build_gallery;
use crate::shared::locator::{Locator, StreamKey};
use crate::streaming::domain::connection::ConnectionInfo;
use crate::streaming::domain::stream_error::StreamError;
use crate::streaming::infrastructure::idle_reaper::IdleReaper;
use crate::streaming::infrastructure::stream_supervisor::StreamSupervisor;
use crate::video::domain::frame_encoder::FrameEncoder;

/// Everything a session needs, shared between the service and its sessions.
pub(crate) struct ServiceContext {
    pub(crate) supervisor: Arc<StreamSupervisor>,
    pub(crate) engine: RecognitionEngine,
    pub(crate) gallery: SharedGallery,
    pub(crate) debouncer: AttendanceDebouncer,
    pub(crate) attendance_log: Arc<dyn AttendanceLog>,
    pub(crate) encoder: Arc<dyn FrameEncoder>,
    pub(crate) session: SessionConfig,
}

/// Turns requested video sources into continuous streams of annotated,
/// encoded frames and presence events.
pub struct StreamService {
    context: Arc<ServiceContext>,
}

impl StreamService {
    pub fn new(
        supervisor: Arc<StreamSupervisor>,
        engine: RecognitionEngine,
        attendance_log: Arc<dyn AttendanceLog>,
        encoder: Arc<dyn FrameEncoder>,
        session: SessionConfig,
        attendance_interval: Duration,
    ) -> Self {
        Self {
            context: Arc::new(ServiceContext {
                supervisor,
                engine,
                gallery: SharedGallery::default(),
                debouncer: AttendanceDebouncer::new(attendance_interval),
                attendance_log,
                encoder,
                session,
            }),
        }
    }

    /// Attaches to the connection for `locator`, opening it if needed.
    pub fn open_stream(&self, locator: &Locator) -> Result<StreamSession, StreamError> {
        self.open_stream_with_logger(locator, Box::new(NullSessionLogger))
    }

    pub fn open_stream_with_logger(
        &self,
        locator: &Locator,
        logger: Box<dyn SessionLogger>,
    ) -> Result<StreamSession, StreamError> {
        let handle = self.context.supervisor.open(locator)?;
        log::info!("Session attached to {}", handle.key());
        Ok(StreamSession::new(Arc::clone(&self.context), handle, logger))
    }

    pub fn close_stream(&self, locator: &Locator) -> bool {
        self.context.supervisor.close(&locator.key())
    }

    pub fn reap_idle(&self, max_idle: Duration) -> Vec<StreamKey> {
        self.context.supervisor.reap_idle(max_idle)
    }

    pub fn spawn_reaper(&self, interval: Duration, max_idle: Duration) -> std::io::Result<IdleReaper> {
        self.context.supervisor.spawn_reaper(interval, max_idle)
    }

    /// Rebuilds the gallery from `store` and publishes it in one swap, then
    /// resumes each identity's enter/exit alternation from the attendance
    /// log. Returns the number of identities.
    pub fn reload_gallery(
        &self,
        store: &dyn IdentityStore,
        analyzer: &dyn FaceAnalyzer,
    ) -> Result<usize, GalleryError> {
        let gallery = build_gallery(store, analyzer)?;
        Ok(self.publish_gallery(gallery))
    }

    /// Saves new face images for an identity, then rebuilds and publishes
    /// the gallery so open sessions recognize it. Returns the saved paths.
    pub fn register_identity<P: AsRef<Path>>(
        &self,
        store: &DirectoryIdentityStore,
        analyzer: &dyn FaceAnalyzer,
        user_id: &str,
        name: &str,
        images: &[P],
    ) -> Result<Vec<PathBuf>, RegistrationError> {
        let saved = store.register(user_id, name, images)?;
        self.reload_gallery(store, analyzer)?;
        Ok(saved)
    }

    /// Publishes an already built gallery. Returns the number of identities.
    pub fn publish_gallery(&self, gallery: IdentityGallery) -> usize {
        let count = gallery.len();
        for entry in gallery.entries() {
            match self.context.attendance_log.last_status(&entry.key) {
                Ok(Some(state)) => self.context.debouncer.restore(entry.key.clone(), state),
                Ok(None) => {}
                Err(e) => log::warn!("Could not restore attendance state of {}: {e}", entry.key),
            }
        }
        self.context.gallery.publish(gallery);
        log::info!("Published gallery with {count} identities");
        count
    }

    pub fn gallery(&self) -> Arc<IdentityGallery> {
        self.context.gallery.snapshot()
    }

    pub fn debouncer(&self) -> &AttendanceDebouncer {
        &self.context.debouncer
    }

    pub fn supervisor(&self) -> &Arc<StreamSupervisor> {
        &self.context.supervisor
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.context.supervisor.connections()
    }

    pub fn shutdown(&self) {
        self.context.supervisor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::domain::frame_annotator::FrameAnnotator;
    use crate::attendance::domain::attendance_debouncer::AttendanceState;
    use crate::attendance::domain::presence_event::EventType;
    use crate::config::CaptureConfig;
    use crate::pipeline::stream_session::{OutputKind, StreamOutput};
    use crate::recognition::domain::face_analyzer::DetectedFace;
    use crate::recognition::domain::gallery::{IdentityInfo, IdentityKey};
    use crate::recognition::infrastructure::directory_identity_store::DirectoryIdentityStore;
    use crate::shared::bounding_box::BoundingBox;
    use crate::shared::clock::{Clock, ManualClock};
    use crate::streaming::domain::connection::ConnectionState;
    use crate::testing::{
        fast_capture_config, wait_until, FakeEncoder, FixedAnalyzer, MemoryAttendanceLog,
        RecordingAnnotator, ScriptedFactory, SourceScript,
    };
    use crate::video::domain::frame_source::FrameSourceFactory;
    use tempfile::TempDir;

    const INTERVAL: Duration = Duration::from_secs(300);

    struct Harness {
        service: StreamService,
        clock: Arc<ManualClock>,
        log: Arc<MemoryAttendanceLog>,
        annotator: Arc<RecordingAnnotator>,
    }

    fn fast_session() -> SessionConfig {
        SessionConfig {
            frame_interval_ms: 1,
            frame_retry_delay_ms: 1,
            placeholder_after_misses: 5,
        }
    }

    fn face(embedding: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox::new(1, 1, 4, 4),
            embedding,
        }
    }

    fn harness(
        factory: ScriptedFactory,
        capture: CaptureConfig,
        faces: Vec<DetectedFace>,
        encoder: FakeEncoder,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let supervisor = Arc::new(StreamSupervisor::with_clock(
            Arc::new(factory) as Arc<dyn FrameSourceFactory>,
            capture,
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let annotator = Arc::new(RecordingAnnotator::default());
        let engine = RecognitionEngine::new(
            Arc::new(FixedAnalyzer::faces(faces)),
            Arc::clone(&annotator) as Arc<dyn FrameAnnotator>,
            0.5,
        );
        let log = Arc::new(MemoryAttendanceLog::default());
        let service = StreamService::new(
            supervisor,
            engine,
            Arc::clone(&log) as Arc<dyn AttendanceLog>,
            Arc::new(encoder),
            fast_session(),
            INTERVAL,
        );
        Harness {
            service,
            clock,
            log,
            annotator,
        }
    }

    fn live_harness(faces: Vec<DetectedFace>, encoder: FakeEncoder) -> Harness {
        let h = harness(
            ScriptedFactory::new(Some(SourceScript::Endless)),
            fast_capture_config(),
            faces,
            encoder,
        );
        h.service.publish_gallery(alice_gallery());
        h
    }

    fn alice() -> IdentityInfo {
        IdentityInfo::new("1", "alice")
    }

    fn alice_gallery() -> IdentityGallery {
        IdentityGallery::from_samples(vec![(alice(), vec![1.0, 0.0])]).unwrap()
    }

    /// Opens the connection and waits for its first frame, so the session
    /// starts on a live frame.
    fn warm(service: &StreamService, locator: &Locator) {
        service.supervisor().open(locator).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            service
                .connections()
                .iter()
                .any(|c| c.frames_captured > 0)
        }));
    }

    fn next_live(session: &mut StreamSession) -> StreamOutput {
        session
            .by_ref()
            .take(10_000)
            .map(|item| item.unwrap())
            .find(|output| output.kind == OutputKind::Live)
            .expect("no live output")
    }

    fn next_of_kind(session: &mut StreamSession, kind: OutputKind) -> StreamOutput {
        session
            .by_ref()
            .take(10_000)
            .map(|item| item.unwrap())
            .find(|output| output.kind == kind)
            .expect("no output of the requested kind")
    }

    #[test]
    fn test_known_face_enters_once_then_exits_after_interval() {
        let h = live_harness(vec![face(vec![1.0, 0.0])], FakeEncoder::default());
        let locator = Locator::Device(0);
        warm(&h.service, &locator);
        let mut session = h.service.open_stream(&locator).unwrap();

        let first = next_live(&mut session);
        assert_eq!(first.matches.len(), 1);
        assert_eq!(first.matches[0].identity, Some(alice()));
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].event_type, EventType::Enter);
        assert_eq!(first.events[0].timestamp, h.clock.utc_now());
        assert_eq!(first.content_type, "application/octet-stream");

        let second = next_live(&mut session);
        assert_eq!(second.matches.len(), 1);
        assert!(second.events.is_empty());

        h.clock.advance(Duration::from_secs(6 * 60));
        let third = next_live(&mut session);
        assert_eq!(third.events.len(), 1);
        assert_eq!(third.events[0].event_type, EventType::Exit);

        let logged: Vec<EventType> = h.log.events().iter().map(|e| e.event_type).collect();
        assert_eq!(logged, vec![EventType::Enter, EventType::Exit]);
        h.service.shutdown();
    }

    #[test]
    fn test_unknown_face_is_annotated_without_events() {
        let h = live_harness(vec![face(vec![0.0, 1.0])], FakeEncoder::default());
        let locator = Locator::Device(0);
        warm(&h.service, &locator);
        let mut session = h.service.open_stream(&locator).unwrap();

        let output = next_live(&mut session);
        assert_eq!(output.matches.len(), 1);
        assert!(output.matches[0].identity.is_none());
        assert!(output.events.is_empty());
        assert!(h.log.events().is_empty());
        assert!(h.annotator.annotated_faces().contains(&1));
        h.service.shutdown();
    }

    #[test]
    fn test_failed_log_write_still_reports_event() {
        let h = live_harness(vec![face(vec![1.0, 0.0])], FakeEncoder::default());
        h.log.set_failing(true);
        let locator = Locator::Device(0);
        warm(&h.service, &locator);
        let mut session = h.service.open_stream(&locator).unwrap();

        let output = next_live(&mut session);
        assert_eq!(output.events.len(), 1);
        assert!(h.log.events().is_empty());
        h.service.shutdown();
    }

    #[test]
    fn test_encode_failure_carries_events_to_next_output() {
        let h = live_harness(vec![face(vec![1.0, 0.0])], FakeEncoder::failing_first(1));
        let locator = Locator::Device(0);
        warm(&h.service, &locator);
        let mut session = h.service.open_stream(&locator).unwrap();

        let output = next_live(&mut session);
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.events[0].event_type, EventType::Enter);
        assert_eq!(session.emitted(), 1);

        let next = next_live(&mut session);
        assert!(next.events.is_empty());
        assert_eq!(h.log.events().len(), 1);
        h.service.shutdown();
    }

    #[test]
    fn test_reconnecting_shows_placeholder_until_closed() {
        let capture = CaptureConfig {
            reopen_delay_ms: 60_000,
            ..fast_capture_config()
        };
        let h = harness(
            ScriptedFactory::new(None).then(Some(SourceScript::Frames(1))),
            capture,
            Vec::new(),
            FakeEncoder::default(),
        );
        let locator = Locator::Device(0);
        h.service.supervisor().open(&locator).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            h.service.connections()[0].state == ConnectionState::Reconnecting
        }));
        let mut session = h.service.open_stream(&locator).unwrap();

        let placeholder = next_of_kind(&mut session, OutputKind::Reconnecting);
        assert_eq!(session.handle().state(), ConnectionState::Reconnecting);
        assert!(placeholder.matches.is_empty());
        assert_eq!(&placeholder.encoded[..4], &640u32.to_le_bytes());

        assert!(h.service.close_stream(&locator));
        assert_eq!(
            session.next(),
            Some(Err(StreamError::Unavailable { key: locator.key() }))
        );
        assert!(session.next().is_none());
    }

    #[test]
    fn test_fatal_connection_ends_session_with_one_error() {
        let h = harness(
            ScriptedFactory::new(None).then(Some(SourceScript::Frames(1))),
            fast_capture_config(),
            Vec::new(),
            FakeEncoder::default(),
        );
        let mut session = h.service.open_stream(&Locator::Device(0)).unwrap();

        let items: Vec<_> = session.by_ref().take(100_000).collect();
        let (last, rest) = items.split_last().unwrap();
        assert!(matches!(last, Err(StreamError::Unavailable { .. })));
        assert!(rest.iter().all(|item| item.is_ok()));
        assert!(session.next().is_none());
        assert_eq!(session.handle().state(), ConnectionState::Fatal);
    }

    #[test]
    fn test_dropping_session_keeps_connection_open() {
        let h = live_harness(Vec::new(), FakeEncoder::default());
        let locator = Locator::Device(0);
        let mut session = h.service.open_stream(&locator).unwrap();
        next_live(&mut session);
        drop(session);

        let connections = h.service.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].state, ConnectionState::Live);

        let mut again = h.service.open_stream(&locator).unwrap();
        next_live(&mut again);
        h.service.shutdown();
    }

    #[test]
    fn test_reload_gallery_resumes_alternation_from_log() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("1_alice");
        std::fs::create_dir_all(&dir).unwrap();
        image::RgbImage::new(16, 16).save(dir.join("a.png")).unwrap();

        let h = harness(
            ScriptedFactory::new(Some(SourceScript::Endless)),
            fast_capture_config(),
            vec![face(vec![1.0, 0.0])],
            FakeEncoder::default(),
        );
        let key = IdentityKey::new("1", "alice");
        let seeded = AttendanceState {
            last_event: EventType::Enter,
            at: h.clock.utc_now(),
        };
        h.log.seed(key.clone(), seeded);

        let analyzer = FixedAnalyzer::faces(vec![face(vec![1.0, 0.0])]);
        let count = h
            .service
            .reload_gallery(&DirectoryIdentityStore::new(tmp.path()), &analyzer)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(h.service.debouncer().state(&key), Some(seeded));
        assert!(h.service.gallery().get(&key).is_some());

        let locator = Locator::Device(0);
        warm(&h.service, &locator);
        let mut session = h.service.open_stream(&locator).unwrap();
        assert!(next_live(&mut session).events.is_empty());

        h.clock.advance(INTERVAL);
        let output = next_live(&mut session);
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.events[0].event_type, EventType::Exit);
        h.service.shutdown();
    }

    #[test]
    fn test_registered_identity_is_recognized_without_restart() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("capture.png");
        image::RgbImage::new(16, 16).save(&input).unwrap();
        let store = DirectoryIdentityStore::new(tmp.path().join("dataset"));

        let h = harness(
            ScriptedFactory::new(Some(SourceScript::Endless)),
            fast_capture_config(),
            vec![face(vec![0.0, 1.0])],
            FakeEncoder::default(),
        );
        let analyzer = FixedAnalyzer::faces(vec![face(vec![0.0, 1.0])]);
        assert_eq!(h.service.reload_gallery(&store, &analyzer).unwrap(), 0);

        let locator = Locator::Device(0);
        warm(&h.service, &locator);
        let mut session = h.service.open_stream(&locator).unwrap();
        assert!(next_live(&mut session).events.is_empty());

        let saved = h
            .service
            .register_identity(&store, &analyzer, "5", "erin", &[&input])
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert!(h.service.gallery().get(&IdentityKey::new("5", "erin")).is_some());

        let output = next_live(&mut session);
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.events[0].name, "erin");
        assert_eq!(output.events[0].event_type, EventType::Enter);
        h.service.shutdown();
    }

    #[test]
    fn test_open_failure_is_reported() {
        let h = harness(
            ScriptedFactory::new(None),
            fast_capture_config(),
            Vec::new(),
            FakeEncoder::default(),
        );
        let result = h.service.open_stream(&Locator::Device(3));
        assert!(matches!(result, Err(StreamError::OpenFailed { .. })));
        assert!(h.service.connections().is_empty());
    }
}
