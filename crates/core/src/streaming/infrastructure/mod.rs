pub mod capture_worker;
pub mod idle_reaper;
pub mod stream_supervisor;
