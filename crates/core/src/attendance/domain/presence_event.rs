use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recognition::domain::gallery::{IdentityInfo, IdentityKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Enter,
    Exit,
}

impl EventType {
    pub fn flipped(self) -> Self {
        match self {
            EventType::Enter => EventType::Exit,
            EventType::Exit => EventType::Enter,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Enter => "enter",
            EventType::Exit => "exit",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A debounced entry or exit of a recognized person.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub identity: IdentityKey,
    pub user_id: String,
    pub name: String,
    pub event_type: EventType,
    /// Similarity of the match that triggered the event.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl PresenceEvent {
    pub fn new(
        info: &IdentityInfo,
        event_type: EventType,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            identity: info.key(),
            user_id: info.user_id.clone(),
            name: info.name.clone(),
            event_type,
            confidence,
            timestamp,
        }
    }
}
