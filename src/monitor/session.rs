//! Stall and timeout monitoring for one fetch session.
//!
//! A [`ProgressMonitor`] watches progress reports from a running session and
//! applies three guards taken from the session's [`SourceProfile`]:
//!
//! - **Initial timeout**: no progress yet; emits a notice, never aborts.
//! - **Stall check**: every check interval, a session that has not reported
//!   progress for more than twice the interval is marked stuck. The flag
//!   clears on the next forward progress.
//! - **Maximum timeout**: hard ceiling; cancels the session's token.
//!
//! Observers subscribe to a broadcast stream of [`MonitorEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::profile::SourceProfile;

const EVENT_CAPACITY: usize = 64;

/// Snapshot of a session's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub current: u64,
    pub total: u64,
    pub last_update: Instant,
    pub is_stuck: bool,
    pub status: String,
}

/// Notifications emitted by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    InitialTimeout(ProgressState),
    Stuck(ProgressState),
    Resumed(ProgressState),
    Progress(ProgressState),
    Timeout(ProgressState),
    Completed(ProgressState),
}

impl MonitorEvent {
    pub fn state(&self) -> &ProgressState {
        match self {
            MonitorEvent::InitialTimeout(s)
            | MonitorEvent::Stuck(s)
            | MonitorEvent::Resumed(s)
            | MonitorEvent::Progress(s)
            | MonitorEvent::Timeout(s)
            | MonitorEvent::Completed(s) => s,
        }
    }
}

struct Inner {
    operation: String,
    profile: SourceProfile,
    state: Mutex<ProgressState>,
    started: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    done: CancellationToken,
    running: AtomicBool,
    timed_out: AtomicBool,
    events: broadcast::Sender<MonitorEvent>,
}

/// Watches one fetch session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProgressMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMonitor")
            .field("operation", &self.inner.operation)
            .field("profile", &self.inner.profile.key)
            .field("running", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl ProgressMonitor {
    pub fn new(operation: impl Into<String>, profile: SourceProfile) -> Self {
        Self::with_token(operation.into(), profile, CancellationToken::new())
    }

    /// Monitor whose cancellation token is a child of `parent`, so aborting
    /// the parent also cancels this session.
    pub fn with_parent(
        operation: impl Into<String>,
        profile: SourceProfile,
        parent: &CancellationToken,
    ) -> Self {
        Self::with_token(operation.into(), profile, parent.child_token())
    }

    fn with_token(operation: String, profile: SourceProfile, cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let status = format!("{} starting...", operation);
        Self {
            inner: Arc::new(Inner {
                operation,
                profile,
                state: Mutex::new(ProgressState {
                    current: 0,
                    total: 0,
                    last_update: Instant::now(),
                    is_stuck: false,
                    status,
                }),
                started: Mutex::new(None),
                cancel,
                done: CancellationToken::new(),
                running: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn profile(&self) -> &SourceProfile {
        &self.inner.profile
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Start the guards and return the session's cancellation token.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while
    /// running returns the same token without restarting the guards.
    pub fn start(&self) -> CancellationToken {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!(operation = %self.inner.operation, "Monitor already running");
            return self.inner.cancel.clone();
        }

        let now = Instant::now();
        *self.inner.started.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.inner.lock_state().last_update = now;

        info!(
            operation = %self.inner.operation,
            profile = %self.inner.profile.key,
            initial_timeout_s = self.inner.profile.initial_timeout.as_secs(),
            max_timeout_s = self.inner.profile.max_timeout.as_secs(),
            "Monitoring started"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.watch(now).await });

        self.inner.cancel.clone()
    }

    /// Report progress. `total` is raised but never lowered.
    pub fn update(&self, current: u64, total: Option<u64>, message: Option<&str>) {
        if !self.is_active() {
            return;
        }

        let (snapshot, resumed) = {
            let mut state = self.inner.lock_state();
            let previous = state.current;
            let was_stuck = state.is_stuck;

            state.current = current;
            if let Some(total) = total {
                state.total = state.total.max(total);
            }
            state.last_update = Instant::now();

            let resumed = was_stuck && current > previous;
            if resumed {
                state.is_stuck = false;
                state.status = message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{} resumed...", self.inner.operation));
            } else if !was_stuck {
                state.status = message
                    .map(str::to_string)
                    .unwrap_or_else(|| progress_message(&self.inner.operation, &state));
            }
            (state.clone(), resumed)
        };

        if resumed {
            info!(
                operation = %self.inner.operation,
                current = snapshot.current,
                total = snapshot.total,
                "Progress resumed"
            );
            self.inner.emit(MonitorEvent::Resumed(snapshot.clone()));
        }
        self.inner.emit(MonitorEvent::Progress(snapshot));
    }

    /// Mark the session finished and stop the guards.
    pub fn complete(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.done.cancel();

        let snapshot = {
            let mut state = self.inner.lock_state();
            state.current = state.total.max(state.current);
            state.status = format!("{} completed successfully", self.inner.operation);
            state.clone()
        };
        info!(
            operation = %self.inner.operation,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "Operation completed"
        );
        self.inner.emit(MonitorEvent::Completed(snapshot));
    }

    /// Stop the guards and cancel the session.
    pub fn abort(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.done.cancel();
        self.inner.cancel.cancel();
        self.inner.lock_state().status = format!("{} aborted", self.inner.operation);
        info!(
            operation = %self.inner.operation,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "Operation aborted"
        );
    }

    pub fn state(&self) -> ProgressState {
        self.inner.lock_state().clone()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// True once the maximum timeout has fired.
    pub fn timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::SeqCst)
    }

    /// Time since [`start`](Self::start); zero if never started.
    pub fn elapsed(&self) -> Duration {
        self.inner
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MonitorEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn watch(self: Arc<Self>, started: Instant) {
        let interval = self.profile.check_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(started + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let initial = sleep(self.profile.initial_timeout);
        let hard = sleep(self.profile.max_timeout);
        tokio::pin!(initial, hard);
        let mut initial_fired = false;

        loop {
            tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                _ = &mut hard => {
                    self.on_max_timeout();
                    break;
                }
                _ = &mut initial, if !initial_fired => {
                    initial_fired = true;
                    self.on_initial_timeout(started);
                }
                _ = ticker.tick() => self.check(started, interval),
            }
        }
    }

    fn on_initial_timeout(&self, started: Instant) {
        let snapshot = {
            let mut state = self.lock_state();
            state.status = if state.current > 0 {
                format!(
                    "{} is taking longer than expected but is progressing...",
                    self.operation
                )
            } else {
                format!(
                    "{} is taking longer than expected. Please wait...",
                    self.operation
                )
            };
            state.clone()
        };
        info!(
            operation = %self.operation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            current = snapshot.current,
            total = snapshot.total,
            "Initial timeout reached, still waiting"
        );
        self.emit(MonitorEvent::InitialTimeout(snapshot));
    }

    fn check(&self, started: Instant, interval: Duration) {
        let stuck = {
            let mut state = self.lock_state();
            let since_last = state.last_update.elapsed();
            if since_last > interval * 2 && !state.is_stuck {
                state.is_stuck = true;
                state.status = format!(
                    "{} appears to be stuck. Monitoring for recovery...",
                    self.operation
                );
                Some((state.clone(), since_last))
            } else {
                if !state.is_stuck {
                    let minutes = started.elapsed().as_secs() / 60;
                    if minutes > 0 {
                        state.status =
                            format!("{} in progress ({}m elapsed)...", self.operation, minutes);
                    }
                }
                None
            }
        };

        if let Some((snapshot, since_last)) = stuck {
            warn!(
                operation = %self.operation,
                idle_ms = since_last.as_millis() as u64,
                current = snapshot.current,
                total = snapshot.total,
                "No progress, session appears stuck"
            );
            self.emit(MonitorEvent::Stuck(snapshot));
        }
    }

    fn on_max_timeout(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.timed_out.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let snapshot = {
            let mut state = self.lock_state();
            state.status = format!(
                "{} timed out after {} minutes",
                self.operation,
                self.profile.max_timeout.as_secs() / 60
            );
            state.clone()
        };
        warn!(
            operation = %self.operation,
            max_timeout_s = self.profile.max_timeout.as_secs(),
            current = snapshot.current,
            total = snapshot.total,
            "Maximum timeout reached, cancelling session"
        );
        self.emit(MonitorEvent::Timeout(snapshot));
    }
}

fn progress_message(operation: &str, state: &ProgressState) -> String {
    let percent = if state.total > 0 {
        (state.current as f64 / state.total as f64 * 100.0).round() as u64
    } else {
        0
    };
    format!("{}: {}/{} ({}%)", operation, state.current, state.total, percent)
}
