use std::collections::VecDeque;

use crate::arena::PageId;

/// Pages whose records all expire at `expiration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub expiration: u32,
    /// Front is the head (oldest page), back is the tail being filled.
    pub pages: VecDeque<PageId>,
}

impl Cell {
    fn new(expiration: u32) -> Self {
        Self {
            expiration,
            pages: VecDeque::new(),
        }
    }

    pub fn tail(&self) -> Option<PageId> {
        self.pages.back().copied()
    }
}

/// Ascending array of expiration cells with TTL quantization.
///
/// A requested TTL is snapped to a neighbouring cell or to a new bucket that
/// keeps adjacent TTLs at least a factor of two apart, which bounds the
/// number of cells by `cells_num + 2`.
#[derive(Debug)]
pub struct ExpirationIndex {
    cells: Vec<Cell>,
    capacity: usize,
    min_ttl: u32,
    max_ttl: u32,
}

impl ExpirationIndex {
    pub fn new(cells_num: usize, min_ttl: u32) -> Self {
        let cells_num = cells_num.clamp(1, MAX_CELLS);
        let shift = (cells_num - 1).min(31) as u32;
        let max_ttl = ((min_ttl.max(1) as u64) << shift).min(MAX_TTL_CAP as u64) as u32;
        Self {
            cells: Vec::with_capacity(cells_num + 2),
            capacity: cells_num + 2,
            min_ttl: min_ttl.max(1),
            max_ttl,
        }
    }

    pub fn min_ttl(&self) -> u32 {
        self.min_ttl
    }

    pub fn max_ttl(&self) -> u32 {
        self.max_ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn cell(&self, idx: usize) -> &Cell {
        &self.cells[idx]
    }

    pub fn push_page(&mut self, idx: usize, page: PageId) {
        self.cells[idx].pages.push_back(page);
    }

    /// Cell index for a record set cached at `now` with `ttl`, or `None`
    /// when the TTL is below the cacheable minimum. Cells expiring at or
    /// before `now` must have been removed already.
    pub fn find_or_create_cell(&mut self, now: u32, ttl: u32) -> Option<usize> {
        if ttl < self.min_ttl {
            return None;
        }
        let ttl = ttl.min(self.max_ttl);
        let expiration = now.saturating_add(ttl);

        if self.cells.is_empty() {
            self.cells.push(Cell::new(expiration));
            return Some(0);
        }

        let pos = match self
            .cells
            .binary_search_by_key(&expiration, |cell| cell.expiration)
        {
            Ok(idx) => return Some(idx),
            Err(pos) => pos,
        };

        let len = self.cells.len();
        let lidx = pos.saturating_sub(1);
        let ridx = pos.min(len - 1);
        let lttl = self.cells[lidx].expiration.saturating_sub(now).max(1);
        let rttl = self.cells[ridx].expiration.saturating_sub(now).max(1);

        let new_ttl = find_median(lttl, rttl, ttl);
        if new_ttl == lttl {
            return Some(lidx);
        }
        if new_ttl == rttl {
            return Some(ridx);
        }

        assert!(
            self.cells.len() < self.capacity,
            "expiration index overflow: {} cells, capacity {}",
            self.cells.len(),
            self.capacity
        );

        let idx = if new_ttl < lttl {
            0
        } else if new_ttl < rttl {
            ridx
        } else {
            len
        };
        self.cells
            .insert(idx, Cell::new(now.saturating_add(new_ttl)));
        Some(idx)
    }

    /// Pops the earliest cell once it has expired, yielding its pages.
    /// `None` when no cell expired; an expired cell may come with no pages.
    pub fn remove_expired(&mut self, now: u32) -> Option<VecDeque<PageId>> {
        match self.cells.first() {
            Some(cell) if cell.expiration <= now => Some(self.cells.remove(0).pages),
            _ => None,
        }
    }

    /// Takes the head page of the earliest cell that has one.
    pub fn find_victim(&mut self) -> Option<PageId> {
        self.cells
            .iter_mut()
            .find(|cell| !cell.pages.is_empty())
            .and_then(|cell| cell.pages.pop_front())
    }
}

const MAX_TTL_CAP: u32 = 1 << 30;

/// Upper bound for `cells_num`; the max TTL shift runs out well before it.
pub const MAX_CELLS: usize = 32;

/// Picks the TTL for a new record between neighbours `lttl` and `rttl`.
///
/// A TTL already two-fold away from its neighbours is kept. Otherwise the
/// candidates are the neighbours themselves and the powers-of-two steps from
/// each neighbour toward `ttl` that stay within `[2 * lttl, rttl / 2]`; the
/// closest wins, earlier candidates on ties.
pub fn find_median(lttl: u32, rttl: u32, ttl: u32) -> u32 {
    let (mut lttl, mut rttl, ttl) = (lttl.max(1) as u64, rttl.max(1) as u64, ttl as u64);

    if lttl > ttl {
        if ttl <= lttl >> 1 {
            return ttl as u32;
        }
        rttl = lttl;
        lttl = 1;
    } else if rttl < ttl {
        if ttl >= rttl << 1 {
            return ttl as u32;
        }
        lttl = rttl;
        while rttl < ttl {
            rttl <<= 1;
        }
    } else if ttl >= lttl << 1 && ttl <= rttl >> 1 {
        return ttl as u32;
    }

    let in_range = |t: u64| t <= rttl >> 1 && t >= lttl << 1;
    let mut candidates = vec![lttl, rttl];

    let mut up = lttl;
    while ttl > up {
        up <<= 1;
    }
    if in_range(up) {
        candidates.push(up);
    }
    if in_range(up >> 1) {
        candidates.push(up >> 1);
    }

    let mut down = rttl;
    while ttl < down {
        down >>= 1;
    }
    if in_range(down) {
        candidates.push(down);
    }
    if in_range(down << 1) {
        candidates.push(down << 1);
    }

    let mut best = candidates[0];
    for &t in &candidates[1..] {
        if t.abs_diff(ttl) < best.abs_diff(ttl) {
            best = t;
        }
    }
    best as u32
}
