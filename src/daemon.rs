//! Thread-safe front of one [`Cache`] with deferred result delivery.
//!
//! Lookups never call back inline: a hit is copied into an active query and
//! a wake-up is sent to the delivery thread, which drains at most the number
//! of queries postponed before it woke. The daemon lock is released while
//! user callbacks run, so callbacks may look up, insert or cancel freely.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io;
use std::iter;
use std::mem;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, CacheSession};
use crate::clock::CacheClock;
use crate::codec::{self, RecordView};
use crate::config::CacheParams;
use crate::dump;
use crate::error::{CacheError, CacheResult};
use crate::hosts::LocalHosts;
use crate::record::{CachedType, DnsData};

/// Suffixes beyond this are ignored.
pub const MAX_DOMAIN_SUFFIXES: usize = 31;
pub const MAX_NAME_LEN: usize = 255;
/// Bookkeeping bytes charged per query on top of the record copy.
pub const QUERY_OVERHEAD: usize = 32;

/// Receives `(qid, record)` once per delivered record. Returning
/// [`CacheError::Destructed`] stops delivery of the remaining records.
pub type RecordCallback = Box<dyn FnMut(u32, &DnsData) -> Result<(), CacheError> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindRequest {
    pub qtype: CachedType,
    pub name: String,
    pub domain_suffixes: Vec<String>,
    /// Space the caller grants the query; see [`FindOutcome::InsufficientBuffer`].
    pub buffer_capacity: usize,
}

impl FindRequest {
    pub fn new(qtype: CachedType, name: impl Into<String>) -> Self {
        Self {
            qtype,
            name: name.into(),
            domain_suffixes: Vec::new(),
            buffer_capacity: usize::MAX,
        }
    }

    pub fn with_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain_suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOutcome {
    /// Positive records will be delivered to the callback under `qid`.
    Hit { qid: u32 },
    /// A single status record will be delivered under `qid`.
    NegativeHit { qid: u32 },
    /// The query needs `required` bytes, more than the request granted.
    InsufficientBuffer { required: usize },
    /// Bit `i` is set when candidate `i` (0 = bare name) has no cache entry at all.
    Miss { missing_suffixes: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    pub sent_results: u64,
    pub accepted_results: u64,
    pub postponed: usize,
    pub max_postponed: usize,
    pub active_queries: usize,
    pub clients: usize,
}

struct ActiveQuery {
    qid: u32,
    qtype: CachedType,
    callback: RecordCallback,
    record: Bytes,
}

#[derive(Debug, Clone)]
struct Client {
    id: u64,
    label: Arc<str>,
}

struct State {
    cache: Cache,
    queries: VecDeque<ActiveQuery>,
    next_qid: u32,
    postponed: usize,
    max_postponed: usize,
    need_raise_event: bool,
    in_callback_qid: Option<u32>,
    in_callback_thread: Option<ThreadId>,
    clients: Vec<Client>,
    log_source: Arc<str>,
    sent_results: u64,
    accepted_results: u64,
}

struct Shared {
    state: Mutex<State>,
    in_callback: Condvar,
    clock: Arc<dyn CacheClock>,
    hosts: Option<Arc<dyn LocalHosts>>,
}

enum Wake {
    Deliver,
    Shutdown,
}

pub struct Daemon {
    shared: Arc<Shared>,
    wake: Sender<Wake>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.in_callback
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn run_delivery(self: Arc<Self>, wake: Receiver<Wake>) {
        while let Ok(Wake::Deliver) = wake.recv() {
            self.on_timer();
        }
        debug!("delivery thread stopped");
    }

    fn on_timer(&self) {
        let mut state = self.lock();
        state.need_raise_event = true;
        // queries postponed from now on wait for the next wake-up
        let budget = mem::take(&mut state.postponed);

        for _ in 0..budget {
            let Some(query) = state.queries.pop_front() else {
                break;
            };
            debug!(source = %state.log_source, qid = query.qid, "serving query from cache");
            state = self.deliver(state, query);
            state.accepted_results += 1;
        }
    }

    fn deliver<'a>(&'a self, mut state: MutexGuard<'a, State>, query: ActiveQuery) -> MutexGuard<'a, State> {
        while state.in_callback_thread.is_some() {
            state = self.wait(state);
        }
        let ActiveQuery {
            qid,
            qtype,
            mut callback,
            record,
        } = query;
        state.in_callback_qid = Some(qid);
        state.in_callback_thread = Some(thread::current().id());
        let source = state.log_source.clone();
        drop(state);

        match RecordView::new(&record).and_then(|view| view.decode()) {
            Ok(set) => {
                if let Some(status) = set.status_record(qtype) {
                    if let Err(err) = callback(qid, &status) {
                        debug!(source = %source, qid, error = %err, "status callback failed");
                    }
                } else {
                    let mut complete = true;
                    for data in &set.records {
                        match callback(qid, data) {
                            Ok(()) => {}
                            Err(CacheError::Destructed) => {
                                debug!(source = %source, qid, "receiver destructed, delivery stopped");
                                complete = false;
                                break;
                            }
                            Err(err) => {
                                debug!(source = %source, qid, error = %err, "record callback failed");
                            }
                        }
                    }
                    if complete {
                        match callback(qid, &DnsData::end_of_list(&set.owner, qtype)) {
                            Ok(()) | Err(CacheError::Destructed) => {}
                            Err(err) => {
                                debug!(source = %source, qid, error = %err, "end of list callback failed");
                            }
                        }
                    }
                }
                debug!(source = %source, qid, "query served from cache");
            }
            Err(err) => {
                error!(source = %source, qid, error = %err, "undecodable record in active query");
            }
        }
        // the callback may own handles to this daemon; drop it before relocking
        drop(callback);

        let mut state = self.lock();
        state.in_callback_qid = None;
        state.in_callback_thread = None;
        self.in_callback.notify_all();
        state
    }
}

impl Daemon {
    /// Builds the daemon and its delivery thread. `first_client` becomes
    /// the owner of the log source.
    pub fn new(
        params: &CacheParams,
        clock: Arc<dyn CacheClock>,
        hosts: Option<Arc<dyn LocalHosts>>,
        first_client: (u64, &str),
    ) -> CacheResult<Self> {
        let resolved = params.resolve()?;
        let (client_id, label) = first_client;
        let label: Arc<str> = Arc::from(label);

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                cache: Cache::new(resolved),
                queries: VecDeque::new(),
                next_qid: 1,
                postponed: 0,
                max_postponed: 0,
                need_raise_event: true,
                in_callback_qid: None,
                in_callback_thread: None,
                clients: vec![Client {
                    id: client_id,
                    label: label.clone(),
                }],
                log_source: label.clone(),
                sent_results: 0,
                accepted_results: 0,
            }),
            in_callback: Condvar::new(),
            clock,
            hosts,
        });

        let (wake, rx) = mpsc::channel();
        let worker = shared.clone();
        let delivery = thread::Builder::new()
            .name("rrcache-delivery".into())
            .spawn(move || worker.run_delivery(rx))
            .map_err(|err| {
                error!(source = %label, error = %err, "failed to start delivery thread");
                CacheError::OutOfResources
            })?;

        info!(
            source = %label,
            page_size = resolved.page_size,
            max_pages = resolved.max_pages,
            hash_size = resolved.hash_size,
            "cache daemon constructed"
        );
        Ok(Self {
            shared,
            wake,
            delivery: Mutex::new(Some(delivery)),
        })
    }

    fn now(&self) -> u32 {
        self.shared.clock.now()
    }

    pub fn log_source(&self) -> Arc<str> {
        self.shared.lock().log_source.clone()
    }

    pub(crate) fn add_client(&self, id: u64, label: &str) {
        let mut state = self.shared.lock();
        state.clients.push(Client {
            id,
            label: Arc::from(label),
        });
        debug!(source = %state.log_source, client = label, "client attached");
    }

    /// Returns the number of clients left.
    pub(crate) fn remove_client(&self, id: u64) -> usize {
        let mut state = self.shared.lock();
        let Some(pos) = state.clients.iter().position(|c| c.id == id) else {
            return state.clients.len();
        };
        let removed = state.clients.remove(pos);
        if let Some(next) = state.clients.first() {
            if Arc::ptr_eq(&removed.label, &state.log_source) {
                let label = next.label.clone();
                debug!(from = %removed.label, to = %label, "log source handed over");
                state.log_source = label;
            }
        }
        state.clients.len()
    }

    pub fn start_caching(&self) -> CacheSession {
        self.shared.lock().cache.start_caching()
    }

    pub fn record(&self, session: &mut CacheSession, data: &DnsData) -> CacheResult<()> {
        let now = self.now();
        let mut state = self.shared.lock();
        state.cache.record(now, session, data).inspect_err(|err| {
            error!(
                source = %state.log_source,
                owner = %data.owner,
                qtype = ?data.data_type(),
                error = %err,
                "failed to cache record"
            );
        })
    }

    pub fn finish_caching(&self, session: &CacheSession) -> CacheResult<()> {
        let now = self.now();
        let mut state = self.shared.lock();
        match state.cache.finish_caching(now, session) {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(source = %state.log_source, error = %err, "record set not cached");
                Err(err)
            }
        }
    }

    /// Caches one answer list as a single session.
    pub fn cache_answers(&self, answers: &[DnsData]) -> CacheResult<()> {
        let mut session = self.start_caching();
        for data in answers {
            self.record(&mut session, data)?;
        }
        self.finish_caching(&session)
    }

    /// Looks the name up in local hosts and then in the cache, trying each
    /// domain suffix in turn. Results are always delivered later, from the
    /// delivery thread.
    pub fn find(&self, request: &FindRequest, callback: RecordCallback) -> CacheResult<FindOutcome> {
        let name = request.name.as_str();
        if name.is_empty() {
            return Err(CacheError::BadParam("empty query name".into()));
        }
        let now = self.now();
        let mut state = self.shared.lock();
        let source = state.log_source.clone();
        debug!(source = %source, qtype = %request.qtype, name, "find");

        let mut suffixes = request.domain_suffixes.as_slice();
        if suffixes.len() > MAX_DOMAIN_SUFFIXES {
            error!(source = %source, n = suffixes.len(), "too many domain suffixes, extra ones ignored");
            suffixes = &suffixes[..MAX_DOMAIN_SUFFIXES];
        }
        // fully qualified, no search
        if name.ends_with('.') {
            suffixes = &[];
        }

        let mut positive: Option<Bytes> = None;
        let mut negative: Option<Bytes> = None;
        let mut missing = 0u32;

        let candidates = iter::once("").chain(suffixes.iter().map(String::as_str));
        for (i, suffix) in candidates.enumerate() {
            let candidate: Cow<'_, str> = if suffix.is_empty() {
                Cow::Borrowed(name)
            } else {
                let full = format!("{name}.{suffix}");
                if full.len() > MAX_NAME_LEN {
                    continue;
                }
                Cow::Owned(full)
            };

            if let Some(answers) = self
                .shared
                .hosts
                .as_ref()
                .and_then(|hosts| hosts.lookup(request.qtype, &candidate))
            {
                match codec::encode_set(&answers, state.cache.params().page_size, 0) {
                    Ok(blob) => {
                        debug!(source = %source, name = %candidate, "found in local hosts");
                        positive = Some(Bytes::from(blob));
                        break;
                    }
                    Err(err) => {
                        warn!(source = %source, name = %candidate, error = %err, "local hosts answer not usable");
                    }
                }
            }

            match state.cache.find(now, request.qtype, &candidate)? {
                Some(at) => {
                    let view = state.cache.view(at)?;
                    let bytes = Bytes::copy_from_slice(view.as_bytes());
                    if view.is_negative_answer() {
                        debug!(source = %source, qtype = %request.qtype, name = %candidate, "found in negative cache");
                        negative = Some(bytes);
                        continue;
                    }
                    positive = Some(bytes);
                    break;
                }
                None => {
                    missing |= 1 << i;
                    debug!(source = %source, qtype = %request.qtype, name = %candidate, "not found");
                }
            }
        }

        let (record, is_negative) = match (positive, negative) {
            (Some(record), _) => (record, false),
            (None, Some(record)) if missing == 0 => (record, true),
            (None, _) => {
                return Ok(FindOutcome::Miss {
                    missing_suffixes: missing,
                });
            }
        };

        let required = QUERY_OVERHEAD + record.len();
        if required > request.buffer_capacity {
            return Ok(FindOutcome::InsufficientBuffer { required });
        }

        let qid = state.next_qid;
        // cached query ids are always odd
        state.next_qid = state.next_qid.wrapping_add(2);
        state.queries.push_back(ActiveQuery {
            qid,
            qtype: request.qtype,
            callback,
            record,
        });
        state.postponed += 1;
        state.max_postponed = state.max_postponed.max(state.postponed);
        state.sent_results += 1;

        if state.need_raise_event {
            match self.wake.send(Wake::Deliver) {
                Ok(()) => {
                    state.need_raise_event = false;
                    debug!(source = %source, qid, "postponed delivery triggered");
                }
                Err(_) => {
                    error!(source = %source, qid, "delivery thread is gone, query stays queued");
                }
            }
        } else {
            debug!(
                source = %source,
                postponed = state.postponed,
                max_postponed = state.max_postponed,
                "delivery already scheduled"
            );
        }

        Ok(if is_negative {
            FindOutcome::NegativeHit { qid }
        } else {
            FindOutcome::Hit { qid }
        })
    }

    /// Withdraws a query. A query being delivered right now can be cancelled
    /// from its own callback; other threads get `InCallback` or, with
    /// `wait_for_callbacks`, block until its delivery finishes.
    pub fn cancel(&self, qid: u32, wait_for_callbacks: bool) -> CacheResult<()> {
        let mut state = self.shared.lock();
        if state.in_callback_qid == Some(qid) {
            if state.in_callback_thread == Some(thread::current().id()) {
                debug!(source = %state.log_source, qid, "cancelling in-callback query from its callback");
                return Ok(());
            }
            if !wait_for_callbacks {
                return Err(CacheError::InCallback { qid });
            }
            while state.in_callback_qid == Some(qid) {
                state = self.shared.wait(state);
            }
            return Ok(());
        }

        match state.queries.iter().position(|q| q.qid == qid) {
            Some(pos) => {
                let cancelled = state.queries.remove(pos);
                state.postponed = state.postponed.saturating_sub(1);
                debug!(source = %state.log_source, qid, "query cancelled");
                // the callback may hold the last handle to this daemon
                drop(state);
                drop(cancelled);
                Ok(())
            }
            None => Err(CacheError::NotFound { qid }),
        }
    }

    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.cache.clear();
        info!(source = %state.log_source, "cache cleared");
    }

    pub fn stats(&self) -> DaemonStats {
        let state = self.shared.lock();
        DaemonStats {
            sent_results: state.sent_results,
            accepted_results: state.accepted_results,
            postponed: state.postponed,
            max_postponed: state.max_postponed,
            active_queries: state.queries.len(),
            clients: state.clients.len(),
        }
    }

    /// Text rendering of the hash index, cells and expired pages.
    pub fn dump(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let now = self.now();
        let state = self.shared.lock();
        dump::write_dump(&state.cache, now, out)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.wake.send(Wake::Shutdown);
        let handle = self
            .delivery
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // dropped from inside a callback: the thread exits on its own
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        info!(source = %self.shared.lock().log_source, "cache daemon destructed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hosts::HostsTable;
    use crate::record::{DnsPayload, DnsStatus};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn daemon_with(hosts: Option<Arc<dyn LocalHosts>>) -> (Arc<Daemon>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(100));
        let daemon = Daemon::new(&CacheParams::default(), clock.clone(), hosts, (1, "test"))
            .expect("daemon");
        (Arc::new(daemon), clock)
    }

    fn daemon() -> Arc<Daemon> {
        daemon_with(None).0
    }

    /// Callback that forwards every delivered record to a channel.
    fn forward() -> (RecordCallback, Receiver<(u32, DnsData)>) {
        let (tx, rx) = mpsc::channel();
        let cb: RecordCallback = Box::new(move |qid, data| {
            let _ = tx.send((qid, data.clone()));
            Ok(())
        });
        (cb, rx)
    }

    fn a(owner: &str, last: u8) -> DnsData {
        DnsData::a(owner, 60, Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn hit_is_delivered_record_by_record_then_end_of_list() {
        let daemon = daemon();
        daemon
            .cache_answers(&[a("sip.example", 1), a("sip.example", 2)])
            .unwrap();

        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        let cb: RecordCallback = Box::new(move |qid, data| {
            let _ = tx.send((qid, data.clone(), thread::current().id()));
            Ok(())
        });
        let outcome = daemon
            .find(&FindRequest::new(CachedType::A, "SIP.example"), cb)
            .unwrap();
        let FindOutcome::Hit { qid } = outcome else {
            panic!("expected hit, got {outcome:?}");
        };
        assert_eq!(qid % 2, 1);

        let delivered: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        for (got_qid, _, tid) in &delivered {
            assert_eq!(*got_qid, qid);
            assert_ne!(*tid, caller);
        }
        assert_eq!(delivered[0].1.record_number, 1);
        assert_eq!(delivered[1].1.record_number, 2);
        assert_eq!(delivered[2].1.payload, DnsPayload::EndOfList);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let stats = daemon.stats();
        assert_eq!(stats.sent_results, 1);
        assert_eq!(stats.accepted_results, 1);
        assert_eq!(stats.max_postponed, 1);
    }

    #[test]
    fn query_ids_are_odd_and_increasing() {
        let daemon = daemon();
        daemon.cache_answers(&[a("q.example", 1)]).unwrap();
        let mut qids = Vec::new();
        for _ in 0..3 {
            let (cb, _rx) = forward();
            match daemon.find(&FindRequest::new(CachedType::A, "q.example"), cb).unwrap() {
                FindOutcome::Hit { qid } => qids.push(qid),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(qids, vec![1, 3, 5]);
    }

    #[test]
    fn negative_hit_delivers_a_single_status_record() {
        let daemon = daemon();
        daemon
            .cache_answers(&[DnsData::status("gone.example", CachedType::A, DnsStatus::NotFound, 60)])
            .unwrap();

        let (cb, rx) = forward();
        let outcome = daemon
            .find(&FindRequest::new(CachedType::Srv, "gone.example"), cb)
            .unwrap();
        assert!(matches!(outcome, FindOutcome::NegativeHit { .. }));

        let (_, status) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(
            status,
            DnsData::status("gone.example", CachedType::Srv, DnsStatus::NotFound, 0)
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn suffix_search_reports_missing_candidates() {
        let daemon = daemon();
        daemon
            .cache_answers(&[DnsData::status("pbx.b.example", CachedType::A, DnsStatus::NotFound, 60)])
            .unwrap();
        let request = FindRequest::new(CachedType::A, "pbx").with_suffixes(["a.example", "b.example"]);

        let (cb, _rx) = forward();
        assert_eq!(
            daemon.find(&request, cb).unwrap(),
            FindOutcome::Miss {
                missing_suffixes: 0b011
            }
        );

        daemon.cache_answers(&[a("pbx.a.example", 4)]).unwrap();
        let (cb, rx) = forward();
        assert!(matches!(daemon.find(&request, cb).unwrap(), FindOutcome::Hit { .. }));
        let (_, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(data.owner, "pbx.a.example");

        // fully qualified names are not searched
        let (cb, _rx) = forward();
        let fq = FindRequest::new(CachedType::A, "pbx.").with_suffixes(["a.example"]);
        assert_eq!(
            daemon.find(&fq, cb).unwrap(),
            FindOutcome::Miss {
                missing_suffixes: 0b1
            }
        );
    }

    #[test]
    fn negative_everywhere_is_a_negative_hit() {
        let daemon = daemon();
        for owner in ["x", "x.corp.example"] {
            daemon
                .cache_answers(&[DnsData::status(owner, CachedType::A, DnsStatus::NotFound, 60)])
                .unwrap();
        }
        let (cb, rx) = forward();
        let request = FindRequest::new(CachedType::A, "x").with_suffixes(["corp.example"]);
        assert!(matches!(
            daemon.find(&request, cb).unwrap(),
            FindOutcome::NegativeHit { .. }
        ));
        let (_, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(data.owner, "x.corp.example");
    }

    #[test]
    fn small_buffer_reports_required_size() {
        let daemon = daemon();
        daemon.cache_answers(&[a("buf.example", 1)]).unwrap();
        let (cb, _rx) = forward();
        let request = FindRequest::new(CachedType::A, "buf.example").with_buffer_capacity(16);
        match daemon.find(&request, cb).unwrap() {
            FindOutcome::InsufficientBuffer { required } => assert!(required > 16),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(daemon.stats().sent_results, 0);
    }

    #[test]
    fn local_hosts_win_over_cache() {
        let hosts: Arc<dyn LocalHosts> = Arc::new(HostsTable::parse("10.1.1.1 pbx.example\n"));
        let (daemon, _clock) = daemon_with(Some(hosts));
        daemon.cache_answers(&[a("pbx.example", 9)]).unwrap();

        let (cb, rx) = forward();
        daemon
            .find(&FindRequest::new(CachedType::A, "pbx.example"), cb)
            .unwrap();
        let (_, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(
            data.payload,
            DnsPayload::A {
                address: Ipv4Addr::new(10, 1, 1, 1)
            }
        );
    }

    #[test]
    fn expired_records_are_misses() {
        let (daemon, clock) = daemon_with(None);
        daemon.cache_answers(&[a("ttl.example", 1)]).unwrap();
        clock.advance(60);
        let (cb, _rx) = forward();
        assert_eq!(
            daemon
                .find(&FindRequest::new(CachedType::A, "ttl.example"), cb)
                .unwrap(),
            FindOutcome::Miss {
                missing_suffixes: 1
            }
        );
    }

    #[test]
    fn destructed_receiver_stops_delivery() {
        let daemon = daemon();
        daemon
            .cache_answers(&[a("stop.example", 1), a("stop.example", 2)])
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let cb: RecordCallback = Box::new(move |_, data| {
            let _ = tx.send(data.clone());
            Err(CacheError::Destructed)
        });
        daemon
            .find(&FindRequest::new(CachedType::A, "stop.example"), cb)
            .unwrap();

        // deliveries are sequential, the second query finishing means the first is done
        let (cb, done) = forward();
        daemon
            .find(&FindRequest::new(CachedType::A, "stop.example"), cb)
            .unwrap();
        for _ in 0..3 {
            done.recv_timeout(WAIT).unwrap();
        }
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn failed_end_of_list_does_not_stall_delivery() {
        let daemon = daemon();
        daemon.cache_answers(&[a("eol.example", 1)]).unwrap();

        let (tx, rx) = mpsc::channel();
        let cb: RecordCallback = Box::new(move |_, data| {
            let _ = tx.send(data.payload.clone());
            if data.payload == DnsPayload::EndOfList {
                Err(CacheError::BadParam("receiver full".into()))
            } else {
                Ok(())
            }
        });
        let request = FindRequest::new(CachedType::A, "eol.example");
        daemon.find(&request, cb).unwrap();

        let (cb, next) = forward();
        daemon.find(&request, cb).unwrap();
        assert_eq!(next.recv_timeout(WAIT).unwrap().1.record_number, 1);
        assert_eq!(next.recv_timeout(WAIT).unwrap().1.payload, DnsPayload::EndOfList);

        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(daemon.stats().active_queries, 0);
    }

    #[test]
    fn cancellation_while_in_callback() {
        let daemon = daemon();
        daemon.cache_answers(&[a("slow.example", 1)]).unwrap();

        let (entered_tx, entered) = mpsc::channel();
        let (release_tx, release) = mpsc::channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let cb: RecordCallback = Box::new(move |_, data| {
            if data.payload == DnsPayload::EndOfList {
                flag.store(true, Ordering::SeqCst);
            } else {
                let _ = entered_tx.send(());
                let _ = release.recv_timeout(WAIT);
            }
            Ok(())
        });
        let request = FindRequest::new(CachedType::A, "slow.example");
        let FindOutcome::Hit { qid: first } = daemon.find(&request, cb).unwrap() else {
            panic!("expected hit");
        };
        entered.recv_timeout(WAIT).unwrap();

        // queued behind the blocked delivery
        let (cb, second_rx) = forward();
        let FindOutcome::Hit { qid: second } = daemon.find(&request, cb).unwrap() else {
            panic!("expected hit");
        };
        assert_eq!(daemon.stats().postponed, 1);
        assert_eq!(daemon.cancel(second, false), Ok(()));
        assert_eq!(daemon.stats().postponed, 0);
        assert_eq!(daemon.cancel(second, false), Err(CacheError::NotFound { qid: second }));

        assert_eq!(
            daemon.cancel(first, false),
            Err(CacheError::InCallback { qid: first })
        );

        let waiter = {
            let daemon = daemon.clone();
            thread::spawn(move || daemon.cancel(first, true))
        };
        thread::sleep(Duration::from_millis(200));
        release_tx.send(()).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert!(finished.load(Ordering::SeqCst));

        assert!(second_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn callback_can_cancel_itself_and_query_again() {
        let daemon = daemon();
        daemon.cache_answers(&[a("self.example", 1)]).unwrap();

        let (tx, rx) = mpsc::channel();
        let inner = daemon.clone();
        let cb: RecordCallback = Box::new(move |qid, data| {
            if data.payload != DnsPayload::EndOfList {
                let cancelled = inner.cancel(qid, true);
                let (nested_cb, _nested_rx) = forward();
                let nested = inner.find(&FindRequest::new(CachedType::A, "self.example"), nested_cb);
                let _ = tx.send((cancelled, nested));
            }
            Ok(())
        });
        daemon
            .find(&FindRequest::new(CachedType::A, "self.example"), cb)
            .unwrap();

        let (cancelled, nested) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(cancelled, Ok(()));
        assert!(matches!(nested, Ok(FindOutcome::Hit { .. })));
    }

    #[test]
    fn clear_empties_the_cache() {
        let daemon = daemon();
        daemon.cache_answers(&[a("c.example", 1)]).unwrap();
        daemon.clear();
        let (cb, _rx) = forward();
        assert!(matches!(
            daemon
                .find(&FindRequest::new(CachedType::A, "c.example"), cb)
                .unwrap(),
            FindOutcome::Miss { .. }
        ));
    }

    #[test]
    fn dump_lists_cached_records() {
        let daemon = daemon();
        daemon.cache_answers(&[a("dump.example", 1)]).unwrap();
        let mut out = Vec::new();
        daemon.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("dump.example"));
    }
}
