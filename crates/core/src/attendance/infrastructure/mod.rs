pub mod jsonl_attendance_log;
