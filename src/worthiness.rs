use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::audit::{self, AuditChannel, AuditError};

const RECEIVE_POLL: Duration = Duration::from_millis(250);
const STOP_POLL: Duration = Duration::from_millis(250);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Whether the packet-filter table changed recently enough to be re-read.
///
/// Starts out set, so the first sample fills the packet-filter cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorthinessState {
    flag: bool,
    last_true_at: Instant,
}

impl WorthinessState {
    pub fn new(now: Instant) -> Self {
        Self {
            flag: true,
            last_true_at: now,
        }
    }

    pub fn is_worth_checking(&self) -> bool {
        self.flag
    }

    pub fn last_true_at(&self) -> Instant {
        self.last_true_at
    }

    pub fn mark_changed(&mut self, now: Instant) {
        self.flag = true;
        self.last_true_at = now;
    }

    /// Clears the flag once `idle` has passed since it was last set. Returns
    /// true when this call cleared it.
    pub fn expire(&mut self, now: Instant, idle: Duration) -> bool {
        if self.flag && now.saturating_duration_since(self.last_true_at) >= idle {
            self.flag = false;
            return true;
        }
        false
    }
}

/// Shared handle to the worthiness state. Writers are the tracker's two
/// loops; the sampler only reads.
#[derive(Debug, Clone)]
pub struct Worthiness {
    state: Arc<RwLock<WorthinessState>>,
}

impl Default for Worthiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Worthiness {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(WorthinessState::new(Instant::now()))),
        }
    }

    /// Handle whose flag stays at `flag` until something changes it.
    pub fn fixed(flag: bool) -> Self {
        let worthiness = Self::new();
        if !flag {
            worthiness.expire(Instant::now(), Duration::ZERO);
        }
        worthiness
    }

    pub fn is_worth_checking(&self) -> bool {
        match self.state.read() {
            Ok(state) => state.is_worth_checking(),
            Err(poisoned) => poisoned.into_inner().is_worth_checking(),
        }
    }

    pub fn mark_changed(&self, now: Instant) {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.mark_changed(now);
        tracing::debug!("packet filter changed; worth checking");
    }

    pub fn expire(&self, now: Instant, idle: Duration) -> bool {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let cleared = state.expire(now, idle);
        if cleared {
            tracing::debug!(idle_ms = idle.as_millis() as u64, "packet filter idle; not worth checking");
        }
        cleared
    }
}

/// Keeps a [`Worthiness`] flag current from audit notifications.
///
/// Runs two threads for as long as it lives: one receiving audit records and
/// one clearing the flag after `idle` without a packet-filter change.
pub struct WorthinessTracker {
    worthiness: Worthiness,
    stop: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorthinessTracker {
    pub fn start<C: AuditChannel>(mut channel: C, idle: Duration) -> Result<Self, AuditError> {
        audit::ensure_enabled(&mut channel)?;

        let worthiness = Worthiness::new();
        let stop = Arc::new(AtomicBool::new(false));

        let receive = {
            let worthiness = worthiness.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("worthiness-receive".to_string())
                .spawn(move || receive_loop(channel, worthiness, stop))?
        };
        let idle_thread = {
            let worthiness = worthiness.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("worthiness-idle".to_string())
                .spawn(move || idle_loop(worthiness, idle, stop))?
        };
        tracing::info!(idle_ms = idle.as_millis() as u64, "worthiness tracker started");

        Ok(Self {
            worthiness,
            stop,
            threads: vec![receive, idle_thread],
        })
    }

    pub fn worthiness(&self) -> Worthiness {
        self.worthiness.clone()
    }

    /// Stops both loops and waits for them.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorthinessTracker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn receive_loop<C: AuditChannel>(mut channel: C, worthiness: Worthiness, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match channel.receive(RECEIVE_POLL) {
            Ok(Some(message)) => {
                if message.is_netfilter_change() {
                    worthiness.mark_changed(Instant::now());
                }
            }
            Ok(None) => {}
            Err(AuditError::Closed) => {
                tracing::error!("audit channel closed; packet filter changes no longer tracked");
                break;
            }
            Err(AuditError::Malformed(reason)) => {
                tracing::warn!(reason = %reason, "skipping malformed audit message");
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to receive audit message");
                thread::sleep(RECEIVE_ERROR_BACKOFF);
            }
        }
    }
}

fn idle_loop(worthiness: Worthiness, idle: Duration, stop: Arc<AtomicBool>) {
    let mut next_check = Instant::now() + idle;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_check {
            worthiness.expire(now, idle);
            next_check += idle;
            continue;
        }
        thread::sleep((next_check - now).min(STOP_POLL));
    }
}
