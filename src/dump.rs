//! Diagnostic text dump of a cache. Not a stable format.

use std::collections::HashSet;
use std::io::{self, Write};

use crate::arena::{PageId, RecordRef};
use crate::cache::Cache;
use crate::record::CachedType;

pub fn write_dump(cache: &Cache, now: u32, out: &mut dyn Write) -> io::Result<()> {
    let indexed: HashSet<RecordRef> = cache
        .hash()
        .buckets()
        .iter()
        .flat_map(|chain| chain.iter().copied())
        .collect();

    write_hash(cache, out)?;
    write_cells(cache, now, &indexed, out)?;

    writeln!(out, "expired pages: {}", cache.expired_pages().len())?;
    for &page in cache.expired_pages() {
        write_page(cache, page, &indexed, out)?;
    }

    let stats = cache.arena().stats();
    writeln!(
        out,
        "arena: {} pages, {} free, {} backed, page size {}",
        stats.total,
        stats.free,
        stats.backed,
        cache.arena().page_size()
    )
}

fn write_hash(cache: &Cache, out: &mut dyn Write) -> io::Result<()> {
    let hash = cache.hash();
    let used = hash.buckets().iter().filter(|c| !c.is_empty()).count();
    let longest = hash.buckets().iter().map(Vec::len).max().unwrap_or(0);
    writeln!(
        out,
        "hash: size {}, {} records in {} buckets, longest chain {}",
        hash.size(),
        hash.len(),
        used,
        longest
    )?;
    for (bucket, chain) in hash.buckets().iter().enumerate() {
        if chain.is_empty() {
            continue;
        }
        write!(out, "  [{bucket}]")?;
        for &at in chain {
            match cache.view(at) {
                Ok(view) => write!(out, " {}/{}", view.name(), type_label(view.type_code()))?,
                Err(err) => write!(out, " <{err}>")?,
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_cells(
    cache: &Cache,
    now: u32,
    indexed: &HashSet<RecordRef>,
    out: &mut dyn Write,
) -> io::Result<()> {
    let cells = cache.cells();
    writeln!(
        out,
        "cells: {}/{} (ttl {}..{})",
        cells.len(),
        cells.capacity(),
        cells.min_ttl(),
        cells.max_ttl()
    )?;

    let mut prev_ttl: Option<u32> = None;
    for (idx, cell) in cells.cells().iter().enumerate() {
        let ttl = cell.expiration.saturating_sub(now);
        write!(
            out,
            "  cell {idx}: expires {} (in {ttl}s), {} pages",
            cell.expiration,
            cell.pages.len()
        )?;
        // neighbours closer than a factor of two mean quantization went wrong
        if let Some(prev) = prev_ttl {
            if prev > 0 && ttl < prev.saturating_mul(2) && ttl > cells.min_ttl() {
                write!(out, " (close to previous cell)")?;
            }
        }
        writeln!(out)?;
        prev_ttl = Some(ttl);

        for &page in &cell.pages {
            write_page(cache, page, indexed, out)?;
        }
    }
    Ok(())
}

fn write_page(
    cache: &Cache,
    page: PageId,
    indexed: &HashSet<RecordRef>,
    out: &mut dyn Write,
) -> io::Result<()> {
    let arena = cache.arena();
    writeln!(
        out,
        "    page {}: {}/{} bytes, max expiration {}",
        page.index(),
        arena.used(page),
        arena.page_size(),
        arena.max_expiration(page)
    )?;
    let records = match arena.records(page) {
        Ok(records) => records,
        Err(err) => return writeln!(out, "      <{err}>"),
    };
    for at in records {
        let view = match arena.record(at) {
            Ok(view) => view,
            Err(err) => {
                writeln!(out, "      @{}: <{err}>", at.offset)?;
                continue;
            }
        };
        writeln!(
            out,
            "      @{}: {} {} x{} expires {}{}{}",
            at.offset,
            view.name(),
            type_label(view.type_code()),
            view.count(),
            view.expiration(),
            if view.negative() { " nodata" } else { "" },
            if indexed.contains(&at) { "" } else { " (unlinked)" }
        )?;
    }
    Ok(())
}

fn type_label(code: u16) -> String {
    match CachedType::from_code(code) {
        Some(t) => t.as_str().to_string(),
        None => format!("TYPE{code}"),
    }
}
