use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    audit::{AuditChannel, AuditError},
    event::{ChangeEvent, Info, StateSnapshot},
    iptables::PacketFilter,
    procnet::ProcNet,
    sampler::{SampleError, StateSampler},
    worthiness::WorthinessTracker,
};

const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to subscribe to audit notifications: {0}")]
    Subscription(#[source] AuditError),
}

/// Cooperative cancellation shared between an event stream and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Source of sampling ticks. The stream ends when the sending side goes away.
pub struct Ticker {
    rx: mpsc::Receiver<Instant>,
}

impl Ticker {
    pub fn from_receiver(rx: mpsc::Receiver<Instant>) -> Self {
        Self { rx }
    }

    /// Ticks every `period`. A tick that the consumer has not picked up yet
    /// absorbs later ones instead of queueing them.
    pub fn interval(period: Duration) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::spawn(move || {
            loop {
                thread::sleep(period);
                match tx.try_send(Instant::now()) {
                    Ok(()) | Err(mpsc::TrySendError::Full(_)) => {}
                    Err(mpsc::TrySendError::Disconnected(_)) => break,
                }
            }
        });
        Self { rx }
    }

    /// Blocks until the next tick. Returns false on cancellation or when the
    /// ticker is exhausted.
    fn wait(&self, cancel: &CancelToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.rx.recv_timeout(CANCEL_POLL) {
                Ok(_) => {
                    tracing::trace!("tick");
                    return true;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return false,
            }
        }
    }
}

pub trait TickerFactory {
    fn new_ticker(&self) -> Ticker;
}

impl<F> TickerFactory for F
where
    F: Fn() -> Ticker,
{
    fn new_ticker(&self) -> Ticker {
        self()
    }
}

/// Factory for [`Ticker::interval`] tickers.
#[derive(Debug, Clone, Copy)]
pub struct IntervalTicker(pub Duration);

impl TickerFactory for IntervalTicker {
    fn new_ticker(&self) -> Ticker {
        Ticker::interval(self.0)
    }
}

/// In-guest monitor producing add/remove events for listening ports and
/// local sockets.
pub struct GuestAgent {
    sampler: StateSampler,
    _tracker: Option<WorthinessTracker>,
}

impl GuestAgent {
    /// Starts the worthiness tracker on `channel` and builds an agent whose
    /// sampler consults it. Fails when the audit subscription cannot be set up.
    pub fn new<C: AuditChannel>(
        channel: C,
        proc_net: ProcNet,
        packet_filter: impl PacketFilter + 'static,
        iptables_idle: Duration,
    ) -> Result<Self, AgentError> {
        let tracker =
            WorthinessTracker::start(channel, iptables_idle).map_err(AgentError::Subscription)?;
        let sampler = StateSampler::new(proc_net, packet_filter, tracker.worthiness());
        Ok(Self {
            sampler,
            _tracker: Some(tracker),
        })
    }

    /// Agent over a sampler whose worthiness is managed elsewhere.
    pub fn with_sampler(sampler: StateSampler) -> Self {
        Self {
            sampler,
            _tracker: None,
        }
    }

    pub fn info(&self) -> Result<Info, SampleError> {
        Ok(self.sampler.sample()?.info())
    }

    /// Lazy, non-restartable sequence of change events. The first cycle runs
    /// on the first call to `next`; later cycles wait for a tick. Ends on
    /// cancellation or when the ticker is exhausted.
    pub fn events(self: &Arc<Self>, cancel: CancelToken, tickers: &dyn TickerFactory) -> EventStream {
        EventStream {
            agent: Arc::clone(self),
            ticker: tickers.new_ticker(),
            cancel,
            previous: StateSnapshot::default(),
            started: false,
            done: false,
        }
    }

    fn collect(&self, previous: &mut StateSnapshot) -> ChangeEvent {
        let ports = match self.sampler.local_ports() {
            Ok(ports) => ports,
            Err(err) => return ChangeEvent::failed(OffsetDateTime::now_utc(), err.to_string()),
        };
        let sockets = match self.sampler.local_sockets() {
            Ok(sockets) => sockets,
            Err(err) => return ChangeEvent::failed(OffsetDateTime::now_utc(), err.to_string()),
        };
        let current = StateSnapshot { ports, sockets };
        let event = ChangeEvent::between(previous, &current, OffsetDateTime::now_utc());
        *previous = current;
        event
    }
}

pub struct EventStream {
    agent: Arc<GuestAgent>,
    ticker: Ticker,
    cancel: CancelToken,
    previous: StateSnapshot,
    started: bool,
    done: bool,
}

impl Iterator for EventStream {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            if self.done {
                return None;
            }
            if self.started && !self.ticker.wait(&self.cancel) {
                self.done = true;
                return None;
            }
            self.started = true;
            if self.cancel.is_cancelled() {
                self.done = true;
                return None;
            }

            let event = self.agent.collect(&mut self.previous);
            if !event.is_empty() {
                if !event.errors.is_empty() {
                    tracing::warn!(errors = ?event.errors, "sampling failed");
                }
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::{AUDIT_NETFILTER_CFG, AuditMessage},
        event::Endpoint,
        sampler::{
            ByteOrder,
            tests::{FakeFilter, TCP, UNIX, write_tables},
        },
        worthiness::Worthiness,
    };
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    const TCP_WITH_HTTPS: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12346 1 0000000000000000 100 0 0 10 0
   2: 00000000:01BB 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12347 1 0000000000000000 100 0 0 10 0";

    fn agent(dir: &TempDir) -> Arc<GuestAgent> {
        let sampler = StateSampler::new(
            ProcNet::new(dir.path()),
            FakeFilter::default(),
            Worthiness::fixed(false),
        );
        Arc::new(GuestAgent::with_sampler(sampler))
    }

    fn manual_ticker() -> (mpsc::Sender<Instant>, impl Fn() -> Ticker) {
        let (tx, rx) = mpsc::channel();
        let rx = std::sync::Mutex::new(Some(rx));
        let factory = move || Ticker::from_receiver(rx.lock().unwrap().take().expect("one ticker"));
        (tx, factory)
    }

    fn any(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    #[test]
    fn first_cycle_reports_everything_as_added() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);
        let (_tx, factory) = manual_ticker();

        let mut events = agent(&temp).events(CancelToken::new(), &factory);
        let event = events.next().unwrap();

        assert_eq!(event.local_ports_added.len(), 2);
        assert!(event.local_ports_added.contains(&any(8080)));
        assert_eq!(event.local_sockets_added, vec!["/run/app.sock".to_string()]);
        assert!(event.local_ports_removed.is_empty());
    }

    #[test]
    fn unchanged_cycles_are_suppressed() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);
        let (tx, factory) = manual_ticker();
        let mut events = agent(&temp).events(CancelToken::new(), &factory);
        events.next().unwrap();

        tx.send(Instant::now()).unwrap();
        tx.send(Instant::now()).unwrap();
        drop(tx);

        assert!(events.next().is_none());
    }

    #[test]
    fn diff_follows_table_changes() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);
        let (tx, factory) = manual_ticker();
        let mut events = agent(&temp).events(CancelToken::new(), &factory);
        events.next().unwrap();

        write_tables(temp.path(), TCP_WITH_HTTPS, "Num RefCount Protocol Flags Type St Inode Path\n");
        tx.send(Instant::now()).unwrap();
        let event = events.next().unwrap();

        assert_eq!(event.local_ports_added, vec![any(443)]);
        assert!(event.local_ports_removed.is_empty());
        assert_eq!(event.local_sockets_removed, vec!["/run/app.sock".to_string()]);
    }

    #[test]
    fn failed_sample_keeps_previous_snapshot() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);
        let (tx, factory) = manual_ticker();
        let mut events = agent(&temp).events(CancelToken::new(), &factory);
        events.next().unwrap();

        std::fs::remove_file(temp.path().join("unix")).unwrap();
        tx.send(Instant::now()).unwrap();
        let failed = events.next().unwrap();
        assert_eq!(failed.errors.len(), 1);
        assert!(failed.local_ports_added.is_empty());
        assert!(failed.local_sockets_removed.is_empty());

        write_tables(temp.path(), TCP_WITH_HTTPS, UNIX);
        tx.send(Instant::now()).unwrap();
        let recovered = events.next().unwrap();
        assert_eq!(recovered.local_ports_added, vec![any(443)]);
        assert!(recovered.local_sockets_added.is_empty());
        assert!(recovered.errors.is_empty());
    }

    #[test]
    fn big_endian_host_yields_error_events() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);
        let sampler = StateSampler::new(
            ProcNet::new(temp.path()),
            FakeFilter::default(),
            Worthiness::fixed(false),
        )
        .with_byte_order(ByteOrder::Big);
        let agent = Arc::new(GuestAgent::with_sampler(sampler));
        let (_tx, factory) = manual_ticker();

        let event = agent.events(CancelToken::new(), &factory).next().unwrap();

        assert!(event.errors[0].contains("big-endian"));
        assert!(event.local_ports_added.is_empty());
        assert!(agent.info().is_err());
    }

    #[test]
    fn cancellation_ends_the_stream() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);
        let (_tx, factory) = manual_ticker();
        let cancel = CancelToken::new();
        let mut events = agent(&temp).events(cancel.clone(), &factory);
        events.next().unwrap();

        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };
        let start = Instant::now();
        assert!(events.next().is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(events.next().is_none());
        canceller.join().unwrap();
    }

    #[test]
    fn interval_ticker_ticks() {
        let ticker = Ticker::interval(Duration::from_millis(10));
        assert!(ticker.wait(&CancelToken::new()));
    }

    #[test]
    fn info_reports_current_state() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);

        let info = agent(&temp).info().unwrap();

        assert_eq!(info.local_ports.len(), 2);
        assert_eq!(info.local_sockets, vec!["/run/app.sock".to_string()]);
    }

    struct UnreachableAudit;

    impl AuditChannel for UnreachableAudit {
        fn is_enabled(&mut self) -> Result<bool, AuditError> {
            Err(AuditError::Closed)
        }

        fn enable(&mut self) -> Result<(), AuditError> {
            Err(AuditError::Closed)
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<AuditMessage>, AuditError> {
            Err(AuditError::Closed)
        }
    }

    struct QueuedAudit {
        rx: mpsc::Receiver<AuditMessage>,
    }

    impl AuditChannel for QueuedAudit {
        fn is_enabled(&mut self) -> Result<bool, AuditError> {
            Ok(true)
        }

        fn enable(&mut self) -> Result<(), AuditError> {
            Ok(())
        }

        fn receive(&mut self, timeout: Duration) -> Result<Option<AuditMessage>, AuditError> {
            match self.rx.recv_timeout(timeout) {
                Ok(message) => Ok(Some(message)),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(AuditError::Closed),
            }
        }
    }

    #[test]
    fn new_fails_when_audit_is_unreachable() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);

        let result = GuestAgent::new(
            UnreachableAudit,
            ProcNet::new(temp.path()),
            FakeFilter::default(),
            Duration::from_millis(100),
        );

        assert!(matches!(
            result,
            Err(AgentError::Subscription(AuditError::Closed))
        ));
    }

    #[test]
    fn netfilter_change_triggers_packet_filter_requery() {
        let temp = TempDir::new().unwrap();
        write_tables(temp.path(), TCP, UNIX);
        let filter = FakeFilter::default();
        *filter.ports.lock().unwrap() = vec![any(9000)];
        let (tx, rx) = mpsc::channel();
        let agent = GuestAgent::new(
            QueuedAudit { rx },
            ProcNet::new(temp.path()),
            filter.clone(),
            Duration::from_millis(100),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(400));
        let before = filter.calls.load(Ordering::SeqCst);
        agent.info().unwrap();
        agent.info().unwrap();
        assert_eq!(filter.calls.load(Ordering::SeqCst), before);

        *filter.ports.lock().unwrap() = vec![any(9100)];
        tx.send(AuditMessage::new(AUDIT_NETFILTER_CFG, Vec::new()))
            .unwrap();
        let start = Instant::now();
        let mut info = agent.info().unwrap();
        while filter.calls.load(Ordering::SeqCst) == before
            && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(10));
            info = agent.info().unwrap();
        }

        assert!(filter.calls.load(Ordering::SeqCst) > before);
        assert!(info.local_ports.contains(&any(9100)));
    }
}
