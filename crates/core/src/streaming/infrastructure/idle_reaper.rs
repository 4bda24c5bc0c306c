use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::streaming::infrastructure::stream_supervisor::StreamSupervisor;

/// Background idle-connection reaper. Stops when dropped, or once the
/// supervisor it watches is gone.
pub struct IdleReaper {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IdleReaper {
    pub(crate) fn spawn(
        supervisor: Weak<StreamSupervisor>,
        interval: Duration,
        max_idle: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("idle reaper".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                let reaped = supervisor.reap_idle(max_idle);
                if !reaped.is_empty() {
                    log::info!("Reaped {} idle connection(s)", reaped.len());
                }
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
