use std::collections::{HashMap, VecDeque};

use tracing::{debug, error, warn};

use crate::arena::{PageArena, PageId, RecordRef};
use crate::cells::ExpirationIndex;
use crate::codec::{RecordSetWriter, RecordView};
use crate::config::ResolvedParams;
use crate::error::{CacheError, CacheResult};
use crate::hash::HashIndex;
use crate::record::{CachedType, DnsData};

/// Longest CNAME chain followed by [`Cache::find`].
pub const MAX_CNAME_CHAIN: usize = 16;

/// Insertion context for one `(owner, type)` record set.
#[derive(Debug, Default)]
pub struct CacheSession {
    writer: Option<RecordSetWriter>,
    failed: Option<CacheError>,
}

impl CacheSession {
    pub fn is_empty(&self) -> bool {
        self.writer.is_none()
    }
}

/// Page arena, expiration cells and hash index glued together. Not thread safe.
#[derive(Debug)]
pub struct Cache {
    params: ResolvedParams,
    arena: PageArena,
    cells: ExpirationIndex,
    hash: HashIndex,
    expired: VecDeque<PageId>,
}

impl Cache {
    pub fn new(params: ResolvedParams) -> Self {
        debug!(
            min_pages = params.min_pages,
            max_pages = params.max_pages,
            delta_pages = params.delta_pages,
            page_size = params.page_size,
            hash_size = params.hash_size,
            "constructing cache"
        );
        Self {
            arena: PageArena::new(
                params.page_size,
                params.min_pages,
                params.max_pages,
                params.delta_pages,
            ),
            cells: ExpirationIndex::new(params.cells_num, params.min_ttl),
            hash: HashIndex::new(params.hash_size),
            expired: VecDeque::new(),
            params,
        }
    }

    pub fn params(&self) -> &ResolvedParams {
        &self.params
    }

    pub fn arena(&self) -> &PageArena {
        &self.arena
    }

    pub fn cells(&self) -> &ExpirationIndex {
        &self.cells
    }

    pub fn hash(&self) -> &HashIndex {
        &self.hash
    }

    pub fn expired_pages(&self) -> &VecDeque<PageId> {
        &self.expired
    }

    pub fn view(&self, at: RecordRef) -> CacheResult<RecordView<'_>> {
        self.arena.record(at)
    }

    pub fn start_caching(&self) -> CacheSession {
        CacheSession::default()
    }

    /// Feeds one answer into `session`. A CNAME answer is cached right away
    /// as its own record set and leaves `session` untouched.
    pub fn record(
        &mut self,
        now: u32,
        session: &mut CacheSession,
        data: &DnsData,
    ) -> CacheResult<()> {
        if data.data_type() == Some(CachedType::Cname) {
            let mut cname = CacheSession::default();
            self.intern(&mut cname, data)?;
            self.finish_caching(now, &cname)?;
            return Ok(());
        }
        self.intern(session, data)
    }

    fn intern(&self, session: &mut CacheSession, data: &DnsData) -> CacheResult<()> {
        if let Some(err) = &session.failed {
            return Err(err.clone());
        }
        let result = match session.writer.as_mut() {
            Some(writer) => writer.push(data),
            None => RecordSetWriter::begin(data, self.params.page_size).and_then(|mut writer| {
                writer.push(data)?;
                session.writer = Some(writer);
                Ok(())
            }),
        };
        if let Err(err) = &result {
            debug!(owner = %data.owner, error = %err, "record rejected, session discarded");
            session.failed = Some(err.clone());
        }
        result
    }

    /// Stores the session's record set, replacing any previous one for the
    /// same owner and type. An empty session is a no-op.
    pub fn finish_caching(
        &mut self,
        now: u32,
        session: &CacheSession,
    ) -> CacheResult<Option<RecordRef>> {
        if let Some(err) = &session.failed {
            return Err(err.clone());
        }
        let Some(writer) = session.writer.as_ref() else {
            return Ok(None);
        };

        self.bookkeeping(now);

        let owner = writer.owner().to_vec();
        let code = writer.rtype().code();
        let ttl = writer.min_ttl();
        debug!(
            owner = %String::from_utf8_lossy(&owner),
            qtype = %writer.rtype(),
            negative = writer.negative(),
            ttl,
            "caching record set"
        );

        if let Some(old) = self.find_with_nxdomain(now, code, &owner)? {
            debug!("found old record set, removing");
            self.hash.remove(&self.arena, old)?;
        }

        let Some(cell) = self.cells.find_or_create_cell(now, ttl) else {
            debug!(ttl, min_ttl = self.cells.min_ttl(), "ttl too low, not cached");
            return Err(CacheError::TtlTooLow {
                ttl,
                min: self.cells.min_ttl(),
            });
        };
        let expiration = now.saturating_add(ttl.min(self.cells.max_ttl()));
        let blob = writer.seal(expiration);

        let page = match self.cells.cell(cell).tail() {
            Some(page) => page,
            None => {
                let page = self.alloc_page(now)?;
                self.cells.push_page(cell, page);
                page
            }
        };

        let at = match self.arena.append(page, &blob, expiration) {
            Some(at) => at,
            None => {
                let page = self.alloc_page(now)?;
                match self.arena.append(page, &blob, expiration) {
                    Some(at) => {
                        self.cells.push_page(cell, page);
                        at
                    }
                    None => {
                        self.arena.release(page);
                        error!(size = blob.len(), "record set is too big, unable to cache");
                        return Err(CacheError::RecordTooLarge { size: blob.len() });
                    }
                }
            }
        };

        let point = self.hash.insertion_point(&owner, code);
        self.hash.add(point, at);
        Ok(Some(at))
    }

    /// Moves pages of expired cells to the expired queue.
    fn bookkeeping(&mut self, now: u32) {
        while let Some(pages) = self.cells.remove_expired(now) {
            self.expired.extend(pages);
        }
    }

    fn alloc_page(&mut self, now: u32) -> CacheResult<PageId> {
        let arena = &self.arena;
        if let Some(pos) = self
            .expired
            .iter()
            .position(|&p| arena.max_expiration(p) <= now)
        {
            if let Some(page) = self.expired.remove(pos) {
                debug!(page = page.index(), "fully expired page allocated");
                self.recycle(page)?;
                return Ok(page);
            }
        }

        if let Some(page) = self.arena.allocate() {
            debug!(page = page.index(), "fresh page allocated");
            return Ok(page);
        }

        let page = match self.expired.pop_front() {
            Some(page) => {
                debug!(
                    page = page.index(),
                    max_expiration = self.arena.max_expiration(page),
                    "partially expired page allocated"
                );
                page
            }
            None => match self.cells.find_victim() {
                Some(page) => {
                    debug!(page = page.index(), "live page evicted");
                    page
                }
                None => {
                    warn!("no free pages was found, out of resources");
                    return Err(CacheError::OutOfResources);
                }
            },
        };
        self.recycle(page)?;
        Ok(page)
    }

    fn recycle(&mut self, page: PageId) -> CacheResult<()> {
        self.hash.remove_page(&self.arena, page)?;
        self.arena.reset(page);
        Ok(())
    }

    fn find_with_nxdomain(
        &mut self,
        now: u32,
        code: u16,
        name: &[u8],
    ) -> CacheResult<Option<RecordRef>> {
        if let Some(at) = self.hash.find(&self.arena, now, code, name)? {
            return Ok(Some(at));
        }
        self.hash
            .find(&self.arena, now, CachedType::NXDOMAIN_CODE, name)
    }

    /// Looks up `(name, qtype)`, falling back to NXDOMAIN and then to the
    /// CNAME chain starting at `name`. The result may be a negative record.
    pub fn find(
        &mut self,
        now: u32,
        qtype: CachedType,
        name: &str,
    ) -> CacheResult<Option<RecordRef>> {
        let code = qtype.code();
        let mut current = normalize(name.as_bytes());

        let found = self.find_with_nxdomain(now, code, &current)?;
        if found.is_some() || qtype == CachedType::Cname {
            return Ok(found);
        }

        for _ in 0..MAX_CNAME_CHAIN {
            let Some(cname) = self
                .hash
                .find(&self.arena, now, CachedType::Cname.code(), &current)?
            else {
                debug!(name, qtype = %qtype, "not cached");
                return Ok(None);
            };
            let view = self.arena.record(cname)?;
            if view.negative() {
                return Ok(Some(cname));
            }
            current = normalize(view.cname_target()?);
            if let Some(found) = self.find_with_nxdomain(now, code, &current)? {
                return Ok(Some(found));
            }
        }

        warn!(name, limit = MAX_CNAME_CHAIN, "cname chain too long");
        Err(CacheError::CnameChainTooLong {
            name: name.to_string(),
            limit: MAX_CNAME_CHAIN,
        })
    }

    pub fn clear(&mut self) {
        self.hash.clear();
        self.cells.clear();
        self.expired.clear();
        self.arena.reset_all();
    }

    /// Cross-checks page ownership and hash reachability.
    pub fn audit(&self) -> CacheResult<AuditReport> {
        let mut report = AuditReport {
            cells: self.cells.len(),
            ..AuditReport::default()
        };

        if report.cells > self.cells.capacity() {
            report.problems.push(format!(
                "{} cells exceed capacity {}",
                report.cells,
                self.cells.capacity()
            ));
        }
        for pair in self.cells.cells().windows(2) {
            if pair[0].expiration >= pair[1].expiration {
                report.problems.push(format!(
                    "cells out of order: {} before {}",
                    pair[0].expiration, pair[1].expiration
                ));
            }
        }

        let mut owners: HashMap<PageId, usize> = HashMap::new();
        for cell in self.cells.cells() {
            for &page in &cell.pages {
                *owners.entry(page).or_default() += 1;
                report.pages_in_cells += 1;
            }
        }
        for &page in &self.expired {
            *owners.entry(page).or_default() += 1;
            report.pages_expired += 1;
        }
        for (page, count) in &owners {
            if *count > 1 {
                report
                    .problems
                    .push(format!("page {} owned {count} times", page.index()));
            }
            if self.arena.is_free(*page) {
                report
                    .problems
                    .push(format!("page {} is owned but free", page.index()));
            }
        }

        for (bucket, chain) in self.hash.buckets().iter().enumerate() {
            for &at in chain {
                report.records_indexed += 1;
                if !owners.contains_key(&at.page) {
                    report.problems.push(format!(
                        "record at page {} offset {} is not on an owned page",
                        at.page.index(),
                        at.offset
                    ));
                    continue;
                }
                let view = self.arena.record(at)?;
                let expected = self.hash.insertion_point(view.name_bytes(), view.type_code());
                if expected != bucket {
                    report.problems.push(format!(
                        "{} type {} in bucket {bucket}, expected {expected}",
                        view.name(),
                        view.type_code()
                    ));
                }
            }
        }

        Ok(report)
    }
}

/// Lowercased name without one trailing dot.
fn normalize(name: &[u8]) -> Vec<u8> {
    let name = name.strip_suffix(b".").unwrap_or(name);
    name.to_ascii_lowercase()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub cells: usize,
    pub pages_in_cells: usize,
    pub pages_expired: usize,
    pub records_indexed: usize,
    pub problems: Vec<String>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }
}
