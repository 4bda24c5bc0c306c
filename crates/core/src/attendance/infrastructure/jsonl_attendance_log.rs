use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDate;
use thiserror::Error;

use crate::attendance::domain::attendance_debouncer::AttendanceState;
use crate::attendance::domain::attendance_log::AttendanceLog;
use crate::attendance::domain::presence_event::{EventType, PresenceEvent};
use crate::recognition::domain::gallery::IdentityKey;

const STATUS_FILE: &str = "attendance_status.json";
const CORRUPT_SUFFIX: &str = "json.corrupt";

#[derive(Error, Debug)]
pub enum AttendanceLogError {
    #[error("attendance file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("attendance file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize attendance record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Attendance kept as one JSON-lines file per UTC day
/// (`attendance_YYYY-MM-DD.jsonl`) plus `attendance_status.json` holding
/// each identity's latest event.
pub struct JsonlAttendanceLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAttendanceLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("attendance_{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn status_file(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn record(&self, event: &PresenceEvent) -> Result<(), AttendanceLogError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        fs::create_dir_all(&self.dir).map_err(|source| AttendanceLogError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.day_file(event.timestamp.date_naive());
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AttendanceLogError::Io {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| AttendanceLogError::Io { path, source })?;

        let mut statuses = match self.read_statuses() {
            Ok(statuses) => statuses,
            Err(AttendanceLogError::Corrupt { path, source }) => {
                log::warn!(
                    "{} is corrupt ({source}); rebuilding from day files",
                    path.display()
                );
                let aside = path.with_extension(CORRUPT_SUFFIX);
                fs::rename(&path, &aside).map_err(|source| AttendanceLogError::Io {
                    path: path.clone(),
                    source,
                })?;
                self.rebuild_statuses()?
            }
            Err(e) => return Err(e),
        };
        let newer = statuses
            .get(&event.identity)
            .map_or(true, |s| s.at <= event.timestamp);
        if newer {
            statuses.insert(
                event.identity.clone(),
                AttendanceState {
                    last_event: event.event_type,
                    at: event.timestamp,
                },
            );
            self.write_statuses(&statuses)?;
        }
        log::debug!(
            "Recorded {} for {} at {}",
            event.event_type,
            event.identity,
            event.timestamp
        );
        Ok(())
    }

    pub fn status(&self, identity: &IdentityKey) -> Result<Option<AttendanceState>, AttendanceLogError> {
        Ok(self.read_statuses()?.remove(identity))
    }

    /// Every event recorded for `date`, in file order. Unparseable lines
    /// are skipped with a warning.
    pub fn records_for(&self, date: NaiveDate) -> Result<Vec<PresenceEvent>, AttendanceLogError> {
        read_events(&self.day_file(date))
    }

    /// Latest event per identity, recomputed from every day file.
    fn rebuild_statuses(&self) -> Result<BTreeMap<IdentityKey, AttendanceState>, AttendanceLogError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| AttendanceLogError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut day_files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("attendance_") && n.ends_with(".jsonl"))
            })
            .collect();
        day_files.sort();

        let mut statuses: BTreeMap<IdentityKey, AttendanceState> = BTreeMap::new();
        for path in day_files {
            for event in read_events(&path)? {
                let newer = statuses
                    .get(&event.identity)
                    .map_or(true, |s| s.at <= event.timestamp);
                if newer {
                    statuses.insert(
                        event.identity.clone(),
                        AttendanceState {
                            last_event: event.event_type,
                            at: event.timestamp,
                        },
                    );
                }
            }
        }
        Ok(statuses)
    }

    /// Counts of enter and exit events for `date`.
    pub fn summary_for(&self, date: NaiveDate) -> Result<(usize, usize), AttendanceLogError> {
        let records = self.records_for(date)?;
        let enters = records
            .iter()
            .filter(|r| r.event_type == EventType::Enter)
            .count();
        Ok((enters, records.len() - enters))
    }

    fn read_statuses(&self) -> Result<BTreeMap<IdentityKey, AttendanceState>, AttendanceLogError> {
        let path = self.status_file();
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => return Err(AttendanceLogError::Io { path, source }),
        };
        serde_json::from_str(&json).map_err(|source| AttendanceLogError::Corrupt { path, source })
    }

    fn write_statuses(
        &self,
        statuses: &BTreeMap<IdentityKey, AttendanceState>,
    ) -> Result<(), AttendanceLogError> {
        let path = self.status_file();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(statuses)?;
        fs::write(&tmp, json).map_err(|source| AttendanceLogError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| AttendanceLogError::Io { path, source })
    }
}

/// Parses one day file. Unparseable lines are skipped with a warning.
fn read_events(path: &Path) -> Result<Vec<PresenceEvent>, AttendanceLogError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(AttendanceLogError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut events = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| AttendanceLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PresenceEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => log::warn!("{}:{}: skipping record: {e}", path.display(), n + 1),
        }
    }
    Ok(events)
}

impl AttendanceLog for JsonlAttendanceLog {
    fn append(&self, event: &PresenceEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.record(event)?)
    }

    fn last_status(
        &self,
        identity: &IdentityKey,
    ) -> Result<Option<AttendanceState>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.status(identity)?)
    }
}
