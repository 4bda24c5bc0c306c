pub mod attendance_debouncer;
pub mod attendance_log;
pub mod presence_event;
