use crate::codec::{self, RECORD_ALIGN, RecordView, align_up};
use crate::error::CacheResult;

/// Handle of a page inside [`PageArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u32);

impl PageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Location of an encoded record set: page plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub page: PageId,
    pub offset: u32,
}

#[derive(Debug)]
struct Page {
    /// Empty while the page is salvaged (released without backing memory).
    buf: Vec<u8>,
    used: usize,
    /// Newest record on the page.
    first_record: Option<u32>,
    max_expiration: u32,
    free: bool,
}

impl Page {
    fn unbacked() -> Self {
        Self {
            buf: Vec::new(),
            used: 0,
            first_record: None,
            max_expiration: 0,
            free: true,
        }
    }

    fn reset(&mut self) {
        self.used = 0;
        self.first_record = None;
        self.max_expiration = 0;
    }
}

/// Counters exposed for dumps and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub total: usize,
    pub free: usize,
    pub backed: usize,
}

/// Pool of fixed-size pages, index based.
///
/// `min_pages` exist from the start, the pool then grows by `delta_pages`
/// up to `max_pages`. Released pages past the minimum give their memory back
/// when more than half of the pool sits idle.
#[derive(Debug)]
pub struct PageArena {
    page_size: usize,
    min_pages: usize,
    max_pages: usize,
    delta_pages: usize,
    pages: Vec<Page>,
    free: Vec<PageId>,
}

impl PageArena {
    pub fn new(page_size: usize, min_pages: usize, max_pages: usize, delta_pages: usize) -> Self {
        let mut arena = Self {
            page_size,
            min_pages,
            max_pages: max_pages.max(min_pages),
            delta_pages: delta_pages.max(1),
            pages: Vec::with_capacity(min_pages),
            free: Vec::new(),
        };
        arena.grow(min_pages);
        arena
    }

    fn grow(&mut self, n: usize) {
        let start = self.pages.len();
        for _ in 0..n {
            let mut page = Page::unbacked();
            page.buf = vec![0; self.page_size];
            self.pages.push(page);
        }
        // popped from the back, keep low ids first
        self.free
            .extend((start..self.pages.len()).rev().map(|i| PageId(i as u32)));
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hands out a free page, growing the pool if allowed. `None` on exhaustion.
    pub fn allocate(&mut self) -> Option<PageId> {
        if self.free.is_empty() {
            let room = self.max_pages.saturating_sub(self.pages.len());
            if room == 0 {
                return None;
            }
            self.grow(self.delta_pages.min(room));
        }
        let id = self.free.pop()?;
        let page_size = self.page_size;
        let page = &mut self.pages[id.index()];
        if page.buf.is_empty() {
            page.buf = vec![0; page_size];
        }
        page.reset();
        page.free = false;
        Some(id)
    }

    pub fn release(&mut self, id: PageId) {
        let page = &mut self.pages[id.index()];
        if page.free {
            return;
        }
        page.reset();
        page.free = true;
        self.free.push(id);
        self.salvage();
    }

    fn salvage(&mut self) {
        let stats = self.stats();
        if stats.backed <= self.min_pages || stats.free * 2 <= stats.total {
            return;
        }
        let mut excess = stats.backed - self.min_pages;
        // oldest released pages sit at the bottom of the free stack
        for id in self.free.iter() {
            if excess == 0 {
                break;
            }
            let page = &mut self.pages[id.index()];
            if !page.buf.is_empty() {
                page.buf = Vec::new();
                excess -= 1;
            }
        }
    }

    pub fn reset(&mut self, id: PageId) {
        self.pages[id.index()].reset();
    }

    /// Returns every page to the free list.
    pub fn reset_all(&mut self) {
        for page in &mut self.pages {
            page.reset();
            page.free = true;
        }
        self.free = (0..self.pages.len()).rev().map(|i| PageId(i as u32)).collect();
        self.salvage();
    }

    pub fn is_free(&self, id: PageId) -> bool {
        self.pages[id.index()].free
    }

    pub fn max_expiration(&self, id: PageId) -> u32 {
        self.pages[id.index()].max_expiration
    }

    pub fn used(&self, id: PageId) -> usize {
        self.pages[id.index()].used
    }

    /// Copies a sealed record set onto the page, newest first.
    /// `None` when it does not fit in the remaining space.
    pub fn append(&mut self, id: PageId, blob: &[u8], expiration: u32) -> Option<RecordRef> {
        let page_size = self.page_size;
        let page = &mut self.pages[id.index()];
        let offset = align_up(page.used, RECORD_ALIGN);
        let end = offset + blob.len();
        if end > page_size || page.buf.len() < page_size {
            return None;
        }

        let dst = &mut page.buf[offset..end];
        dst.copy_from_slice(blob);
        codec::set_next_on_page(dst, page.first_record);
        page.first_record = Some(offset as u32);
        page.used = end;
        page.max_expiration = page.max_expiration.max(expiration);

        Some(RecordRef {
            page: id,
            offset: offset as u32,
        })
    }

    pub fn record(&self, at: RecordRef) -> CacheResult<RecordView<'_>> {
        let page = &self.pages[at.page.index()];
        let start = at.offset as usize;
        if start >= page.used {
            return Err(crate::error::CacheError::Corrupted("record offset past page end"));
        }
        RecordView::new(&page.buf[start..page.used])
    }

    /// Records on the page, newest first.
    pub fn records(&self, id: PageId) -> CacheResult<Vec<RecordRef>> {
        let mut out = Vec::new();
        let mut next = self.pages[id.index()].first_record;
        while let Some(offset) = next {
            let at = RecordRef { page: id, offset };
            next = self.record(at)?.next_on_page();
            out.push(at);
        }
        Ok(out)
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            total: self.pages.len(),
            free: self.free.len(),
            backed: self.pages.iter().filter(|p| !p.buf.is_empty()).count(),
        }
    }
}
