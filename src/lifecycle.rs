//! Lifecycle controller: the single owner of the daemon's recorded state.
//!
//! Every mutating request is authorized through the [`AuthorizationGate`],
//! issued to the [`ServiceAdapter`] on a worker thread (bounded by the
//! command timeout and cancellable), then settled by polling the
//! [`ProcessInspector`]. Only one start/stop transition may be in flight;
//! overlapping requests get [`ControlError::Busy`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};
use log::{error, info, warn};

use crate::auth::{AuthorizationGate, MutatingAction};
use crate::clock::{Clock, SystemClock};
use crate::control::{AutoStartFlag, ServiceAdapter};
use crate::descriptor::ServiceDescriptor;
use crate::error::{ControlError, ServiceError};
use crate::inspector::{ProcessInspector, PsInspector};
use crate::observer::StatusObserver;
use crate::state_machine::{Event, ServiceState, step};

/// How often a waiting request checks its cancel token.
const CANCEL_SLICE: Duration = Duration::from_millis(50);

/// Bounds applied to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Upper bound on one adapter call.
    pub command_timeout: Duration,
    /// How long Starting/Stopping stay sticky before an unconfirmed
    /// transition becomes an error.
    pub settle_timeout: Duration,
    /// Probe interval while settling.
    pub settle_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(20),
            settle_timeout: Duration::from_secs(15),
            settle_poll: Duration::from_millis(500),
        }
    }
}

/// Cooperative cancellation for a pending request. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Start,
    Stop,
}

impl Directive {
    fn target(self) -> ServiceState {
        match self {
            Directive::Start => ServiceState::Running,
            Directive::Stop => ServiceState::Stopped,
        }
    }

    fn action(self) -> MutatingAction {
        match self {
            Directive::Start => MutatingAction::Start,
            Directive::Stop => MutatingAction::Stop,
        }
    }

    fn issued(self) -> Event {
        match self {
            Directive::Start => Event::StartIssued,
            Directive::Stop => Event::StopIssued,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Directive::Start => "start",
            Directive::Stop => "stop",
        })
    }
}

/// Outcome of an adapter call made on a worker thread.
enum Issued {
    Done(Result<(), ServiceError>),
    Cancelled,
    /// An earlier call is still running on its worker.
    Busy,
}

/// Held by an adapter worker; clears the busy flag when the call returns,
/// including by panic or when the worker never starts.
struct AdapterRelease(Arc<AtomicBool>);

impl Drop for AdapterRelease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Inner {
    state: ServiceState,
    /// An adapter start/stop call is outstanding.
    in_flight: bool,
    /// When the current Starting/Stopping stops being sticky.
    settle_deadline: Option<Instant>,
    /// Last auto-start value read or written.
    auto_start: Option<bool>,
    /// Bumped each time a request claims the controller. A poll whose probe
    /// straddles a claim is discarded.
    claims: u64,
}

pub struct LifecycleController {
    descriptor: ServiceDescriptor,
    adapter: Arc<dyn ServiceAdapter>,
    inspector: Arc<dyn ProcessInspector>,
    gate: AuthorizationGate,
    clock: Arc<dyn Clock>,
    timing: Timing,
    inner: Mutex<Inner>,
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
    auto_start_writer: Mutex<()>,
    /// Set while a worker thread is inside the adapter, which can outlive
    /// the request that spawned it after a timeout or cancel.
    adapter_busy: Arc<AtomicBool>,
}

impl LifecycleController {
    /// Controller in the `Unknown` state, probing with `ps` on the wall
    /// clock. Swap either with [`inspector`](Self::inspector) /
    /// [`clock`](Self::clock).
    pub fn new(
        descriptor: ServiceDescriptor,
        adapter: Arc<dyn ServiceAdapter>,
        gate: AuthorizationGate,
    ) -> Self {
        Self {
            descriptor,
            adapter,
            inspector: Arc::new(PsInspector),
            gate,
            clock: Arc::new(SystemClock),
            timing: Timing::default(),
            inner: Mutex::new(Inner {
                state: ServiceState::Unknown,
                in_flight: false,
                settle_deadline: None,
                auto_start: None,
                claims: 0,
            }),
            observers: RwLock::new(Vec::new()),
            auto_start_writer: Mutex::new(()),
            adapter_busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn inspector(mut self, inspector: Arc<dyn ProcessInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Snapshot of the recorded state.
    pub fn state(&self) -> ServiceState {
        self.lock().state.clone()
    }

    /// A transition is in flight or an adapter call has not returned yet.
    pub fn is_busy(&self) -> bool {
        self.lock().in_flight || self.adapter_busy.load(Ordering::SeqCst)
    }

    /// Forget the cached authorization session.
    pub fn revoke_authorization(&self) {
        self.gate.revoke();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed `event` through the state machine; notify on change.
    fn apply(&self, inner: &mut Inner, event: Event) -> bool {
        let Some(next) = step(&inner.state, event) else {
            return false;
        };
        if !next.is_transitional() {
            inner.settle_deadline = None;
        }
        let old = std::mem::replace(&mut inner.state, next);
        info!("{}: {old} → {}", self.descriptor.name(), inner.state);

        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer.on_state_changed(&old, &inner.state);
        }
        true
    }

    /// Scan the process table. Never called with the state lock held.
    fn probe(&self) -> Option<bool> {
        match self.inspector.probe(&self.descriptor) {
            Ok(running) => Some(running),
            Err(e) => {
                warn!("{}: process table unreadable: {e}", self.descriptor.name());
                None
            }
        }
    }

    fn commit_probe(&self, inner: &mut Inner, running: Option<bool>) {
        let settle_expired = inner
            .settle_deadline
            .is_some_and(|deadline| self.clock.now() >= deadline);
        self.apply(
            inner,
            Event::Observed {
                running,
                settle_expired,
            },
        );
    }

    /// Probe the process table and reconcile the recorded state with it.
    /// Left alone while a request is in flight. Returns the state after
    /// reconciliation.
    pub fn poll_status(&self) -> ServiceState {
        let claims = {
            let inner = self.lock();
            if inner.in_flight {
                return inner.state.clone();
            }
            inner.claims
        };
        let running = self.probe();

        let mut inner = self.lock();
        if !inner.in_flight && inner.claims == claims {
            self.commit_probe(&mut inner, running);
        }
        inner.state.clone()
    }

    pub fn request_start(&self) -> Result<(), ControlError> {
        self.request_start_with(&CancelToken::new())
    }

    pub fn request_start_with(&self, cancel: &CancelToken) -> Result<(), ControlError> {
        self.request(Directive::Start, cancel)
    }

    pub fn request_stop(&self) -> Result<(), ControlError> {
        self.request_stop_with(&CancelToken::new())
    }

    pub fn request_stop_with(&self, cancel: &CancelToken) -> Result<(), ControlError> {
        self.request(Directive::Stop, cancel)
    }

    /// Stop (unless already stopped), then start.
    pub fn request_restart(&self) -> Result<(), ControlError> {
        self.request_restart_with(&CancelToken::new())
    }

    pub fn request_restart_with(&self, cancel: &CancelToken) -> Result<(), ControlError> {
        self.request(Directive::Stop, cancel)?;
        self.request(Directive::Start, cancel)
    }

    fn request(&self, directive: Directive, cancel: &CancelToken) -> Result<(), ControlError> {
        let current = {
            let mut inner = self.lock();
            if inner.in_flight
                || inner.state.is_transitional()
                || self.adapter_busy.load(Ordering::SeqCst)
            {
                return Err(ControlError::Busy);
            }
            inner.in_flight = true;
            inner.claims += 1;
            inner.state.clone()
        };

        // Unknown is resolved by a probe that is only recorded once the
        // request turns out to be a no-op or is authorized.
        let pending = (current == ServiceState::Unknown).then(|| self.probe());
        let effective = match pending {
            Some(running) => {
                let observed = Event::Observed {
                    running,
                    settle_expired: false,
                };
                step(&current, observed).unwrap_or(current)
            }
            None => current,
        };

        if effective == directive.target() {
            let mut inner = self.lock();
            if let Some(running) = pending {
                self.commit_probe(&mut inner, running);
            }
            inner.in_flight = false;
            info!(
                "{}: already {effective}, nothing to {directive}",
                self.descriptor.name()
            );
            return Ok(());
        }

        if let Err(e) = self.gate.authorize(directive.action()) {
            self.lock().in_flight = false;
            return Err(e.into());
        }
        if let Some(running) = pending {
            let mut inner = self.lock();
            self.commit_probe(&mut inner, running);
        }

        let descriptor = self.descriptor.clone();
        let outcome = self.issue(&directive.to_string(), cancel, move |adapter| match directive {
            Directive::Start => adapter.start(&descriptor),
            Directive::Stop => adapter.stop(&descriptor),
        });

        {
            let mut inner = self.lock();
            inner.in_flight = false;
            match outcome {
                Issued::Done(Ok(())) => {
                    inner.settle_deadline = Some(self.clock.now() + self.timing.settle_timeout);
                    self.apply(&mut inner, directive.issued());
                }
                Issued::Done(Err(e)) => {
                    error!("{}: {directive} failed: {e}", self.descriptor.name());
                    self.apply(&mut inner, Event::Failed(e.to_string()));
                    return Err(e.into());
                }
                Issued::Cancelled => {
                    self.apply(&mut inner, Event::Cancelled);
                    return Err(ControlError::Cancelled);
                }
                Issued::Busy => return Err(ControlError::Busy),
            }
        }

        self.settle(directive, cancel)
    }

    /// Run one adapter call on a worker thread, waiting at most the command
    /// timeout. A cancelled or timed-out worker is left to finish on its own
    /// and keeps every other adapter call out until it does.
    fn issue<F>(&self, what: &str, cancel: &CancelToken, call: F) -> Issued
    where
        F: FnOnce(&dyn ServiceAdapter) -> Result<(), ServiceError> + Send + 'static,
    {
        if self.adapter_busy.swap(true, Ordering::SeqCst) {
            warn!(
                "{}: {what} refused, an earlier adapter call is still running",
                self.descriptor.name()
            );
            return Issued::Busy;
        }
        let release = AdapterRelease(Arc::clone(&self.adapter_busy));

        let (tx, rx) = bounded(1);
        let adapter = Arc::clone(&self.adapter);
        let spawned = thread::Builder::new()
            .name(format!("daemonctl-{what}"))
            .spawn(move || {
                let result = call(adapter.as_ref());
                // released before the result is seen, so a follow-up call is not refused
                drop(release);
                tx.send(result).ok();
            });
        if let Err(e) = spawned {
            return Issued::Done(Err(ServiceError::ManagerUnavailable(format!(
                "failed to spawn adapter worker: {e}"
            ))));
        }

        let timeout = self.timing.command_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                warn!(
                    "{}: {what} cancelled, adapter call left to finish in the background",
                    self.descriptor.name()
                );
                return Issued::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return Issued::Done(Err(ServiceError::timed_out(what, timeout)));
            }
            match rx.recv_timeout(CANCEL_SLICE.min(deadline - now)) {
                Ok(result) => return Issued::Done(result),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Issued::Done(Err(ServiceError::ManagerUnavailable(format!(
                        "adapter worker for {what} exited without a result"
                    ))));
                }
            }
        }
    }

    /// Poll until the directive's target state is confirmed, the settle
    /// period runs out, or the caller cancels.
    fn settle(&self, directive: Directive, cancel: &CancelToken) -> Result<(), ControlError> {
        let target = directive.target();
        loop {
            if cancel.is_cancelled() {
                let mut inner = self.lock();
                if inner.state.is_transitional() {
                    self.apply(&mut inner, Event::Cancelled);
                }
                return Err(ControlError::Cancelled);
            }

            match self.poll_status() {
                state if state == target => return Ok(()),
                ServiceState::Error(reason) => {
                    return Err(ServiceError::Timeout(reason).into());
                }
                state if state.is_transitional() => self.clock.sleep(self.timing.settle_poll),
                other => {
                    return Err(ServiceError::ManagerUnavailable(format!(
                        "{} settled as {other} after {directive}",
                        self.descriptor.name()
                    ))
                    .into());
                }
            }
        }
    }

    /// Write the boot registration. Never touches the recorded state.
    pub fn set_auto_start(&self, enabled: bool) -> Result<(), ControlError> {
        self.set_auto_start_with(enabled, &CancelToken::new())
    }

    pub fn set_auto_start_with(
        &self,
        enabled: bool,
        cancel: &CancelToken,
    ) -> Result<(), ControlError> {
        let _writer = self
            .auto_start_writer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.gate.authorize(MutatingAction::SetAutoStart)?;

        let descriptor = self.descriptor.clone();
        let outcome = self.issue("set-auto-start", cancel, move |adapter| {
            adapter.set_auto_start(&descriptor, enabled)
        });
        match outcome {
            Issued::Done(Ok(())) => {
                self.record_auto_start(enabled);
                Ok(())
            }
            Issued::Done(Err(e)) => {
                error!(
                    "{}: failed to set auto-start={enabled}: {e}",
                    self.descriptor.name()
                );
                Err(e.into())
            }
            Issued::Cancelled => Err(ControlError::Cancelled),
            Issued::Busy => Err(ControlError::Busy),
        }
    }

    /// Read the boot registration; observers hear about a changed value.
    pub fn auto_start(&self) -> AutoStartFlag {
        let flag = self.adapter.auto_start(&self.descriptor);
        if flag.is_known() {
            self.record_auto_start(flag.enabled());
        }
        flag
    }

    fn record_auto_start(&self, enabled: bool) {
        let mut inner = self.lock();
        if inner.auto_start == Some(enabled) {
            return;
        }
        inner.auto_start = Some(enabled);
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer.on_auto_start_changed(enabled);
        }
    }
}
