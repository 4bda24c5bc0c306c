use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};

use facegate_core::annotation::infrastructure::box_annotator::BoxAnnotator;
use facegate_core::annotation::infrastructure::placeholder::{
    placeholder_frame, UNAVAILABLE_MESSAGE,
};
use facegate_core::attendance::infrastructure::jsonl_attendance_log::JsonlAttendanceLog;
use facegate_core::config::ServiceConfig;
use facegate_core::pipeline::session_logger::LogSessionLogger;
use facegate_core::pipeline::stream_service::StreamService;
use facegate_core::recognition::domain::face_analyzer::FaceAnalyzer;
use facegate_core::recognition::domain::gallery::IdentityKey;
use facegate_core::recognition::domain::recognition_engine::RecognitionEngine;
use facegate_core::recognition::infrastructure::directory_identity_store::DirectoryIdentityStore;
use facegate_core::recognition::infrastructure::gallery_builder::build_gallery;
use facegate_core::recognition::infrastructure::onnx_face_analyzer::OnnxFaceAnalyzer;
use facegate_core::shared::constants::{PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH};
use facegate_core::shared::locator::Locator;
use facegate_core::shared::model_resolver::{self, ModelSpec, DETECTION_MODEL, EMBEDDING_MODEL};
use facegate_core::streaming::infrastructure::stream_supervisor::StreamSupervisor;
use facegate_core::video::domain::frame_encoder::FrameEncoder;
use facegate_core::video::infrastructure::ffmpeg_source::FfmpegSourceFactory;
use facegate_core::video::infrastructure::jpeg_encoder::JpegFrameEncoder;

/// Live face recognition and attendance tracking for camera streams.
#[derive(Parser)]
#[command(name = "facegate")]
struct Cli {
    /// JSON config file (default: platform config dir, if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory of registered faces, one `<user_id>_<name>` folder each.
    #[arg(long, global = true)]
    gallery_dir: Option<PathBuf>,

    /// Directory for attendance logs.
    #[arg(long, global = true)]
    attendance_dir: Option<PathBuf>,

    /// Directory searched for model files before the download cache.
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Cosine similarity a face must exceed to match (-1.0 to 1.0).
    #[arg(long, global = true)]
    threshold: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recognize faces on a camera, stream URL or video file until Ctrl-C.
    Watch {
        /// Device index (e.g. 0), stream URL or video file path.
        locator: String,

        /// Stop after this many output frames.
        #[arg(long)]
        max_frames: Option<u64>,

        /// Save annotated JPEG snapshots to this directory.
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Save every Nth output frame when --snapshot-dir is set.
        #[arg(long, default_value = "30")]
        snapshot_every: u64,
    },
    /// Register face images for a person and rebuild the gallery.
    Register {
        /// Identifier of the person; must not contain '_'.
        #[arg(long)]
        user_id: String,

        /// Display name of the person.
        #[arg(long)]
        name: String,

        /// Face images to register.
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List registered people and their image counts.
    Users {
        /// Also list the image files of this user id.
        #[arg(long)]
        images_of: Option<String>,
    },
    /// Build the identity gallery and list registered identities.
    Gallery,
    /// Print attendance records for one day.
    Records {
        /// Day to print, YYYY-MM-DD (default: today).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Watch {
            locator,
            max_frames,
            snapshot_dir,
            snapshot_every,
        } => run_watch(
            &config,
            &locator,
            max_frames,
            snapshot_dir.as_deref(),
            snapshot_every,
        ),
        Command::Register {
            user_id,
            name,
            images,
        } => run_register(&config, &user_id, &name, &images),
        Command::Users { images_of } => run_users(&config, images_of.as_deref()),
        Command::Gallery => run_gallery(&config),
        Command::Records { date } => run_records(&config, date),
    }
}

fn load_config(cli: &Cli) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    let mut config = ServiceConfig::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = &cli.gallery_dir {
        config.gallery_dir = dir.clone();
    }
    if let Some(dir) = &cli.attendance_dir {
        config.attendance_dir = dir.clone();
    }
    if let Some(dir) = &cli.models_dir {
        config.models_dir = Some(dir.clone());
    }
    if let Some(threshold) = cli.threshold {
        config.recognition.match_threshold = threshold;
    }
    config.validate()?;
    Ok(config)
}

fn run_watch(
    config: &ServiceConfig,
    locator: &str,
    max_frames: Option<u64>,
    snapshot_dir: Option<&Path>,
    snapshot_every: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    if snapshot_every == 0 {
        return Err("Snapshot interval must be at least 1".into());
    }
    let locator = Locator::parse(locator)?;
    if let Some(dir) = snapshot_dir {
        fs::create_dir_all(dir)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || stop_flag.store(true, Ordering::SeqCst))?;

    let analyzer = Arc::new(build_analyzer(config)?);
    let encoder = Arc::new(JpegFrameEncoder::default());
    let service = build_service(config, &analyzer, &encoder);

    let store = DirectoryIdentityStore::new(&config.gallery_dir);
    let identities = service.reload_gallery(&store, analyzer.as_ref())?;
    if identities == 0 {
        log::warn!(
            "No identities registered in {}; every face will be unknown",
            config.gallery_dir.display()
        );
    }
    let _reaper = service.spawn_reaper(config.reaper.interval(), config.reaper.max_idle())?;

    let session =
        service.open_stream_with_logger(&locator, Box::new(LogSessionLogger::default()))?;
    log::info!("Watching {locator} (Ctrl-C to stop)");

    let mut frames: u64 = 0;
    let mut result = Ok(());
    for item in session {
        match item {
            Ok(output) => {
                frames += 1;
                for event in &output.events {
                    println!(
                        "{} {} {} ({:.2})",
                        event.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                        event.event_type,
                        event.name,
                        event.confidence
                    );
                }
                if let Some(dir) = snapshot_dir {
                    if frames % snapshot_every == 0 {
                        fs::write(dir.join(format!("frame_{frames:06}.jpg")), &output.encoded)?;
                    }
                }
            }
            Err(e) => {
                if let Some(dir) = snapshot_dir {
                    let frame =
                        placeholder_frame(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, UNAVAILABLE_MESSAGE);
                    let encoded = encoder.encode(&frame).map_err(|e| e.to_string())?;
                    fs::write(dir.join("unavailable.jpg"), encoded)?;
                }
                result = Err(e.into());
            }
        }
        if stop.load(Ordering::SeqCst) || max_frames.is_some_and(|max| frames >= max) {
            break;
        }
    }

    log::info!("Stopping after {frames} frames");
    service.shutdown();
    result
}

fn run_register(
    config: &ServiceConfig,
    user_id: &str,
    name: &str,
    images: &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let analyzer = Arc::new(build_analyzer(config)?);
    let encoder = Arc::new(JpegFrameEncoder::default());
    let service = build_service(config, &analyzer, &encoder);
    let store = DirectoryIdentityStore::new(&config.gallery_dir);

    let saved = service.register_identity(&store, analyzer.as_ref(), user_id, name, images)?;
    for path in &saved {
        println!("{}", path.display());
    }
    if service.gallery().get(&IdentityKey::new(user_id, name)).is_none() {
        log::warn!(
            "No face detected in the images of {user_id} ({name}); they will not be recognized"
        );
    }
    log::info!(
        "Registered {} of {} images for {user_id} ({name})",
        saved.len(),
        images.len()
    );
    Ok(())
}

fn run_users(
    config: &ServiceConfig,
    images_of: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = DirectoryIdentityStore::new(&config.gallery_dir);
    match images_of {
        Some(user_id) => {
            for path in store.user_images(user_id)? {
                println!("{}", path.display());
            }
        }
        None => {
            let users = store.list_users()?;
            for user in &users {
                println!("{}\t{}\t{}", user.user_id, user.name, user.image_count);
            }
            log::info!("{} users in {}", users.len(), config.gallery_dir.display());
        }
    }
    Ok(())
}

fn run_gallery(config: &ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let analyzer = build_analyzer(config)?;
    let store = DirectoryIdentityStore::new(&config.gallery_dir);
    let gallery = build_gallery(&store, &analyzer)?;

    for entry in gallery.entries() {
        println!("{}\t{}", entry.info.user_id, entry.info.name);
    }
    log::info!(
        "{} identities in {}",
        gallery.len(),
        config.gallery_dir.display()
    );
    Ok(())
}

fn run_records(
    config: &ServiceConfig,
    date: Option<NaiveDate>,
) -> Result<(), Box<dyn std::error::Error>> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let log = JsonlAttendanceLog::new(&config.attendance_dir);

    for record in log.records_for(date)? {
        println!(
            "{}\t{}\t{}\t{}\t{:.2}",
            record.timestamp.with_timezone(&Local).format("%H:%M:%S"),
            record.event_type,
            record.user_id,
            record.name,
            record.confidence
        );
    }
    let (enters, exits) = log.summary_for(date)?;
    log::info!("{date}: {enters} enter, {exits} exit");
    Ok(())
}

fn build_service(
    config: &ServiceConfig,
    analyzer: &Arc<OnnxFaceAnalyzer>,
    encoder: &Arc<JpegFrameEncoder>,
) -> StreamService {
    let supervisor = Arc::new(StreamSupervisor::new(
        Arc::new(FfmpegSourceFactory::default()),
        config.capture.clone(),
    ));
    let engine = RecognitionEngine::new(
        Arc::clone(analyzer) as Arc<dyn FaceAnalyzer>,
        Arc::new(BoxAnnotator::default()),
        config.recognition.match_threshold,
    );
    StreamService::new(
        supervisor,
        engine,
        Arc::new(JsonlAttendanceLog::new(&config.attendance_dir)),
        Arc::clone(encoder) as Arc<dyn FrameEncoder>,
        config.session.clone(),
        config.attendance.interval(),
    )
}

fn build_analyzer(config: &ServiceConfig) -> Result<OnnxFaceAnalyzer, Box<dyn std::error::Error>> {
    let detection = resolve_model(&DETECTION_MODEL, config)?;
    let embedding = resolve_model(&EMBEDDING_MODEL, config)?;
    let analyzer = OnnxFaceAnalyzer::new(
        &detection,
        &embedding,
        &config.backends,
        config.recognition.detection_confidence,
    )?;
    log::info!("Face models loaded on {}", analyzer.backend());
    Ok(analyzer)
}

fn resolve_model(
    spec: &ModelSpec,
    config: &ServiceConfig,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    log::info!("Resolving model: {}", spec.name);
    let name = spec.name;
    let path = model_resolver::resolve(
        spec,
        config.models_dir.as_deref(),
        Some(Box::new(move |downloaded, total| {
            download_progress(name, downloaded, total)
        })),
    )?;
    Ok(path)
}

fn download_progress(name: &str, downloaded: u64, total: u64) {
    if total > 0 {
        let pct = (downloaded as f64 / total as f64 * 100.0) as u32;
        eprint!("\rDownloading {name}... {pct}%");
    } else {
        eprint!("\rDownloading {name}... {downloaded} bytes");
    }
    if total > 0 && downloaded >= total {
        eprintln!();
    }
}
