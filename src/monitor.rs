use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, select, tick};
use log::{error, info};

use crate::lifecycle::LifecycleController;

/// Drives `poll_status` from a ticker the caller owns.
pub struct StatusMonitor {
    controller: Arc<LifecycleController>,
    polls: u64,
}

impl StatusMonitor {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self {
            controller,
            polls: 0,
        }
    }

    /// Polls performed so far.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    fn on_tick(&mut self) {
        self.polls += 1;
        self.controller.poll_status();
        self.controller.auto_start();
    }

    /// Poll once per tick until `shutdown` fires or either channel closes.
    pub fn run(&mut self, ticks: Receiver<Instant>, shutdown: Receiver<()>) {
        info!(
            "monitoring {} ({})",
            self.controller.descriptor().name(),
            self.controller.descriptor().signature()
        );
        self.on_tick();
        loop {
            select! {
                recv(ticks) -> t => match t {
                    Ok(_) => self.on_tick(),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        info!("monitor stopped after {} polls", self.polls);
    }

    /// Poll every `interval` until SIGINT / SIGTERM.
    pub fn run_until_signal(&mut self, interval: Duration) -> Result<()> {
        install_signal_handlers()?;
        let ticks = tick(interval);
        let sig_tick = tick(Duration::from_millis(200));

        self.on_tick();
        loop {
            select! {
                recv(ticks) -> _ => self.on_tick(),
                recv(sig_tick) -> _ => {
                    if let Some(sig) = check_signals() { // coarse polling ≈200 ms
                        info!("signal {sig:?} – stopping monitor");
                        break;
                    }
                }
            }
        }
        info!("monitor stopped after {} polls", self.polls);
        Ok(())
    }
}

// Cheap, polling‑based Unix signal handling (lock‑free).
static RECEIVED_SIGNAL: AtomicUsize = AtomicUsize::new(0);

pub fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{self, Signal};
    extern "C" fn handler(sig: i32) {
        RECEIVED_SIGNAL.store(sig as usize, Ordering::SeqCst);
    }
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(handler),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores into an atomic
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| anyhow::anyhow!("Failed to register {sig} handler: {e}"))?;
    }
    Ok(())
}

/// Non‑blocking check – returns Some(signal) once.
fn check_signals() -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    let val = RECEIVED_SIGNAL.swap(0, Ordering::AcqRel);
    if val == 0 {
        return None;
    }
    match Signal::try_from(val as i32) {
        Ok(sig) => Some(sig),
        Err(e) => {
            error!("invalid signal number {val} from signal handler: {e}");
            None
        }
    }
}
