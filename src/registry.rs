use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxBuildHasher;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::cache::CacheSession;
use crate::clock::{CacheClock, SystemClock};
use crate::config::CacheParams;
use crate::daemon::{Daemon, DaemonStats, FindOutcome, FindRequest, RecordCallback};
use crate::error::{CacheError, CacheResult};
use crate::hosts::{LocalHosts, WatchedHosts};
use crate::record::{DnsData, DnsPayload};

/// Virtual device selector, one daemon per device.
pub type DeviceId = u16;

/// Per-device daemon singletons. The first attach constructs the daemon,
/// the last detach tears it down.
pub struct Registry {
    daemons: DashMap<DeviceId, Arc<Daemon>, FxBuildHasher>,
    next_client: AtomicU64,
    clock: Arc<dyn CacheClock>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn CacheClock>) -> Arc<Self> {
        Arc::new(Self {
            daemons: DashMap::with_hasher(FxBuildHasher::default()),
            next_client: AtomicU64::new(1),
            clock,
        })
    }

    /// `params` only matter for the attach that constructs the daemon.
    pub fn attach(
        self: &Arc<Self>,
        device: DeviceId,
        label: &str,
        params: &CacheParams,
    ) -> CacheResult<ClientHandle> {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let daemon = match self.daemons.entry(device) {
            Entry::Occupied(entry) => {
                let daemon = entry.get().clone();
                daemon.add_client(id, label);
                daemon
            }
            Entry::Vacant(entry) => {
                let hosts = match &params.hosts_file {
                    Some(path) => {
                        let hosts = WatchedHosts::open(path)
                            .map_err(|err| CacheError::BadParam(format!("{err:#}")))?;
                        Some(Arc::new(hosts) as Arc<dyn LocalHosts>)
                    }
                    None => None,
                };
                let daemon = Arc::new(Daemon::new(params, self.clock.clone(), hosts, (id, label))?);
                info!(device, client = label, "cache daemon created for device");
                entry.insert(daemon.clone());
                daemon
            }
        };
        Ok(ClientHandle {
            registry: self.clone(),
            device,
            id,
            daemon,
            attached: true,
        })
    }

    pub fn daemon(&self, device: DeviceId) -> Option<Arc<Daemon>> {
        self.daemons.get(&device).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.daemons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daemons.is_empty()
    }

    fn detach(&self, device: DeviceId, id: u64, daemon: &Arc<Daemon>) {
        if let Entry::Occupied(entry) = self.daemons.entry(device) {
            if !Arc::ptr_eq(entry.get(), daemon) {
                return;
            }
            if daemon.remove_client(id) == 0 {
                entry.remove();
                info!(device, "last client detached, cache daemon released");
            }
        }
    }
}

/// Result of [`ClientHandle::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Records(Vec<DnsData>),
    Negative(DnsData),
    InsufficientBuffer { required: usize },
    Miss { missing_suffixes: u32 },
}

/// Cancels a pending query when the lookup future is dropped early.
struct CancelGuard {
    daemon: Arc<Daemon>,
    qid: u32,
    active: bool,
}

impl CancelGuard {
    fn defuse(&mut self) {
        self.active = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = self.daemon.cancel(self.qid, false);
        }
    }
}

/// One attached client. Dropping the handle detaches it.
pub struct ClientHandle {
    registry: Arc<Registry>,
    device: DeviceId,
    id: u64,
    daemon: Arc<Daemon>,
    attached: bool,
}

impl ClientHandle {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    pub fn start_caching(&self) -> CacheSession {
        self.daemon.start_caching()
    }

    pub fn record(&self, session: &mut CacheSession, data: &DnsData) -> CacheResult<()> {
        self.daemon.record(session, data)
    }

    pub fn finish_caching(&self, session: &CacheSession) -> CacheResult<()> {
        self.daemon.finish_caching(session)
    }

    pub fn cache_answers(&self, answers: &[DnsData]) -> CacheResult<()> {
        self.daemon.cache_answers(answers)
    }

    pub fn find(&self, request: &FindRequest, callback: RecordCallback) -> CacheResult<FindOutcome> {
        self.daemon.find(request, callback)
    }

    pub fn cancel(&self, qid: u32, wait_for_callbacks: bool) -> CacheResult<()> {
        self.daemon.cancel(qid, wait_for_callbacks)
    }

    pub fn stats(&self) -> DaemonStats {
        self.daemon.stats()
    }

    pub fn clear(&self) {
        self.daemon.clear()
    }

    /// Runs [`find`](Self::find) and waits for the delivered records.
    pub async fn lookup(&self, request: &FindRequest) -> CacheResult<LookupResult> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let mut records = Vec::new();
        let callback: RecordCallback = Box::new(move |_qid, data| {
            if tx.as_ref().is_none_or(|tx| tx.is_closed()) {
                return Err(CacheError::Destructed);
            }
            let done = match &data.payload {
                DnsPayload::EndOfList => LookupResult::Records(std::mem::take(&mut records)),
                DnsPayload::Status { .. } => LookupResult::Negative(data.clone()),
                _ => {
                    records.push(data.clone());
                    return Ok(());
                }
            };
            if let Some(tx) = tx.take() {
                let _ = tx.send(done);
            }
            Ok(())
        });

        let qid = match self.daemon.find(request, callback)? {
            FindOutcome::Hit { qid } | FindOutcome::NegativeHit { qid } => qid,
            FindOutcome::InsufficientBuffer { required } => {
                return Ok(LookupResult::InsufficientBuffer { required });
            }
            FindOutcome::Miss { missing_suffixes } => {
                return Ok(LookupResult::Miss { missing_suffixes });
            }
        };

        let mut guard = CancelGuard {
            daemon: self.daemon.clone(),
            qid,
            active: true,
        };
        // sender dropped without a result: daemon went away
        let result = rx.await.map_err(|_| CacheError::Destructed);
        guard.defuse();
        debug!(device = self.device, qid, "lookup completed");
        result
    }

    /// Detaches explicitly; dropping the handle does the same.
    pub fn detach(mut self) {
        self.detach_inner();
    }

    fn detach_inner(&mut self) {
        if std::mem::take(&mut self.attached) {
            self.registry.detach(self.device, self.id, &self.daemon);
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.detach_inner();
    }
}
