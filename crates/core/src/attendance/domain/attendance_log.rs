use crate::attendance::domain::attendance_debouncer::AttendanceState;
use crate::attendance::domain::presence_event::PresenceEvent;
use crate::recognition::domain::gallery::IdentityKey;

/// Durable record of presence events.
pub trait AttendanceLog: Send + Sync {
    fn append(&self, event: &PresenceEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Most recent recorded event of `identity`, used to resume alternation
    /// after a restart.
    fn last_status(
        &self,
        identity: &IdentityKey,
    ) -> Result<Option<AttendanceState>, Box<dyn std::error::Error + Send + Sync>>;
}
