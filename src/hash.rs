use crate::arena::{PageArena, PageId, RecordRef};
use crate::error::CacheResult;

/// djb2 over the lowercased name read back to front, then the low byte of the type.
pub fn hash_key(name: &[u8], rtype: u16) -> u32 {
    let mut h: u32 = 5381;
    for &b in name.iter().rev() {
        h = h.wrapping_mul(33).wrapping_add(b.to_ascii_lowercase() as u32);
    }
    h = h.wrapping_mul(33).wrapping_add((rtype & 0xff) as u32);
    h % 0x7fff_ffff
}

/// Smallest prime `>= n` (at least 2).
pub fn next_prime(n: usize) -> usize {
    let mut candidate = n.max(2);
    loop {
        if is_prime(candidate) {
            return candidate;
        }
        candidate += 1;
    }
}

fn is_prime(n: usize) -> bool {
    if n < 4 {
        return n >= 2;
    }
    if n % 2 == 0 {
        return false;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Chained index from `(name, type)` to the newest record set with that key.
///
/// Buckets hold [`RecordRef`]s only; the bytes stay on arena pages.
#[derive(Debug)]
pub struct HashIndex {
    buckets: Vec<Vec<RecordRef>>,
}

impl HashIndex {
    pub fn new(size: usize) -> Self {
        Self {
            buckets: vec![Vec::new(); size.max(1)],
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[Vec<RecordRef>] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Bucket a key falls into.
    pub fn insertion_point(&self, name: &[u8], rtype: u16) -> usize {
        hash_key(name, rtype) as usize % self.buckets.len()
    }

    fn lookup(
        &self,
        arena: &PageArena,
        rtype: u16,
        name: &[u8],
    ) -> CacheResult<Option<(usize, usize, RecordRef)>> {
        let bucket = self.insertion_point(name, rtype);
        for (pos, &at) in self.buckets[bucket].iter().enumerate() {
            let view = arena.record(at)?;
            if view.type_code() == rtype && view.name_bytes().eq_ignore_ascii_case(name) {
                return Ok(Some((bucket, pos, at)));
            }
        }
        Ok(None)
    }

    /// Live record set for the key. An expired one is unlinked and reported absent.
    pub fn find(
        &mut self,
        arena: &PageArena,
        now: u32,
        rtype: u16,
        name: &[u8],
    ) -> CacheResult<Option<RecordRef>> {
        let Some((bucket, pos, at)) = self.lookup(arena, rtype, name)? else {
            return Ok(None);
        };
        if arena.record(at)?.expiration() <= now {
            self.buckets[bucket].remove(pos);
            return Ok(None);
        }
        Ok(Some(at))
    }

    pub fn add(&mut self, insertion_point: usize, at: RecordRef) {
        self.buckets[insertion_point].insert(0, at);
    }

    /// Unlinks the record set if it is indexed.
    pub fn remove(&mut self, arena: &PageArena, at: RecordRef) -> CacheResult<bool> {
        let view = arena.record(at)?;
        let bucket = self.insertion_point(view.name_bytes(), view.type_code());
        let chain = &mut self.buckets[bucket];
        match chain.iter().position(|&r| r == at) {
            Some(pos) => {
                chain.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unlinks every record set stored on `page`.
    pub fn remove_page(&mut self, arena: &PageArena, page: PageId) -> CacheResult<usize> {
        let mut removed = 0;
        for at in arena.records(page)? {
            if self.remove(arena, at)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn contains(&self, arena: &PageArena, at: RecordRef) -> CacheResult<bool> {
        let view = arena.record(at)?;
        let bucket = self.insertion_point(view.name_bytes(), view.type_code());
        Ok(self.buckets[bucket].contains(&at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_set;
    use crate::record::{CachedType, DnsData};
    use std::net::Ipv4Addr;

    fn store(arena: &mut PageArena, page: PageId, owner: &str, expiration: u32) -> RecordRef {
        let blob = encode_set(&[DnsData::a(owner, 60, Ipv4Addr::LOCALHOST)], 4096, expiration).unwrap();
        arena.append(page, &blob, expiration).unwrap()
    }

    #[test]
    fn primes() {
        assert_eq!(next_prime(0), 2);
        assert_eq!(next_prime(2048), 2053);
        assert_eq!(next_prime(13), 13);
        assert_eq!(next_prime(24), 29);
    }

    #[test]
    fn hash_ignores_case() {
        assert_eq!(hash_key(b"Sip.Example.COM", 1), hash_key(b"sip.example.com", 1));
        assert_ne!(hash_key(b"sip.example.com", 1), hash_key(b"sip.example.com", 28));
    }

    #[test]
    fn find_is_case_insensitive_and_length_exact() {
        let mut arena = PageArena::new(1024, 1, 1, 1);
        let page = arena.allocate().unwrap();
        let mut index = HashIndex::new(next_prime(7));
        let at = store(&mut arena, page, "Host.Example", 100);
        let point = index.insertion_point(b"host.example", CachedType::A.code());
        index.add(point, at);

        let a = CachedType::A.code();
        assert_eq!(index.find(&arena, 0, a, b"host.example").unwrap(), Some(at));
        assert_eq!(index.find(&arena, 0, a, b"HOST.EXAMPLE").unwrap(), Some(at));
        assert_eq!(index.find(&arena, 0, a, b"host.exampl").unwrap(), None);
        assert_eq!(index.find(&arena, 0, CachedType::Aaaa.code(), b"host.example").unwrap(), None);
    }

    #[test]
    fn expired_record_is_unlinked_on_find() {
        let mut arena = PageArena::new(1024, 1, 1, 1);
        let page = arena.allocate().unwrap();
        let mut index = HashIndex::new(3);
        let at = store(&mut arena, page, "old.example", 50);
        index.add(index.insertion_point(b"old.example", 1), at);

        assert!(index.find(&arena, 49, 1, b"old.example").unwrap().is_some());
        assert!(index.find(&arena, 50, 1, b"old.example").unwrap().is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn remove_page_unlinks_only_indexed_records() {
        let mut arena = PageArena::new(1024, 1, 1, 1);
        let page = arena.allocate().unwrap();
        let mut index = HashIndex::new(5);
        let one = store(&mut arena, page, "one.example", 100);
        let two = store(&mut arena, page, "two.example", 100);
        index.add(index.insertion_point(b"one.example", 1), one);
        index.add(index.insertion_point(b"two.example", 1), two);
        assert!(index.remove(&arena, one).unwrap());

        assert_eq!(index.remove_page(&arena, page).unwrap(), 1);
        assert!(index.is_empty());
    }
}
