//! Introspection: the one-line-per-allocation summary, the full
//! structured dump with payload hexdumps, and the terminal heap
//! drawing.  Everything renders through `fmt::Write` so the public
//! entries can stream to a file descriptor and tests can render into
//! a `String`.
use std::fmt;
use std::fmt::Write;

use crate::chunk::ChunkHeader;
use crate::chunk::HEADER_SIZE;
use crate::diag::FdWriter;
use crate::diag::STDERR_FD;
use crate::heap::Heap;
use crate::pool::Pool;

const COLOR_RED: &str = "\x1b[0;31m";
const COLOR_GREEN: &str = "\x1b[0;32m";
const COLOR_YELLOW: &str = "\x1b[0;33m";
const COLOR_RESET: &str = "\x1b[0m";

const DUMP_BYTES_PER_LINE: usize = 16;

fn indent(w: &mut dyn Write, depth: usize) -> fmt::Result {
    write!(w, "{:depth$}", "", depth = depth)
}

fn percent(part: usize, whole: usize) -> usize {
    if whole == 0 {
        0
    } else {
        part * 100 / whole
    }
}

fn hexdump_line(w: &mut dyn Write, base: *const u8, len: usize) -> fmt::Result {
    write!(w, "{:#018x}  ", base as usize)?;

    for i in 0..DUMP_BYTES_PER_LINE {
        if i == DUMP_BYTES_PER_LINE / 2 {
            w.write_char(' ')?;
        }
        if i < len {
            write!(w, "{:02x} ", unsafe { *base.add(i) })?;
        } else {
            w.write_str("   ")?;
        }
    }

    w.write_str(" |")?;
    for i in 0..len {
        let byte = unsafe { *base.add(i) };
        let glyph = if byte.is_ascii_graphic() || byte == b' ' {
            byte as char
        } else {
            '.'
        };
        w.write_char(glyph)?;
    }
    for _ in len..DUMP_BYTES_PER_LINE {
        w.write_char(' ')?;
    }
    w.write_str("|\n")
}

fn hexdump(w: &mut dyn Write, base: *const u8, size: usize) -> fmt::Result {
    if base.is_null() || size == 0 {
        return Ok(());
    }

    let mut offset = 0;
    while offset + DUMP_BYTES_PER_LINE <= size {
        hexdump_line(w, unsafe { base.add(offset) }, DUMP_BYTES_PER_LINE)?;
        offset += DUMP_BYTES_PER_LINE;
    }
    if offset < size {
        hexdump_line(w, unsafe { base.add(offset) }, size - offset)?;
    }
    Ok(())
}

fn write_chunk(
    w: &mut dyn Write,
    chunk: *mut ChunkHeader,
    depth: usize,
    dump: bool,
) -> fmt::Result {
    if chunk.is_null() {
        return Ok(());
    }

    let header = unsafe { &*chunk };
    indent(w, depth)?;
    writeln!(w, "- chunk {:p}:", chunk)?;
    indent(w, depth)?;
    writeln!(w, "  - header_size: {} bytes", HEADER_SIZE)?;
    indent(w, depth)?;
    writeln!(w, "  - data_size: {} bytes", header.size)?;
    indent(w, depth)?;
    writeln!(w, "  - total_size: {} bytes", header.total_size())?;
    indent(w, depth)?;
    writeln!(w, "  - used: {}", header.used)?;
    indent(w, depth)?;
    writeln!(w, "  - next: {:p}", header.next)?;
    indent(w, depth)?;
    writeln!(w, "  - prev: {:p}", header.prev)?;

    if dump && header.used {
        hexdump(w, header.payload(), header.size)?;
    }
    Ok(())
}

fn write_pool(w: &mut dyn Write, pool: &Pool, depth: usize, dump: bool) -> fmt::Result {
    indent(w, depth)?;
    writeln!(w, "Pool {}[{:p}]:", pool.slug, pool.data)?;
    indent(w, depth)?;
    writeln!(w, "- size: {} bytes", pool.size)?;
    indent(w, depth)?;
    writeln!(w, "- max_chunk_size: {} bytes", pool.max_chunk_size)?;
    indent(w, depth)?;
    writeln!(w, "- min_chunk_size: {} bytes", pool.min_chunk_size)?;

    indent(w, depth)?;
    writeln!(w, "- free_chunks: {:p}", pool.free_chunks)?;
    write_chunk(w, pool.free_chunks, depth + 2, dump)?;
    indent(w, depth)?;
    writeln!(w, "- chunks: {:p}", pool.chunks)?;
    write_chunk(w, pool.chunks, depth + 2, dump)?;
    indent(w, depth)?;
    writeln!(w, "- last_chunk: {:p}", pool.last_chunk)?;
    write_chunk(w, pool.last_chunk, depth + 2, dump)
}

/// The `show_alloc_mem` surface: one line per live chunk, pool bases,
/// and the grand total of live bytes.
pub(crate) fn render_summary(heap: &Heap, w: &mut dyn Write) -> fmt::Result {
    let mut total = 0usize;

    for pool in heap.pools.iter() {
        writeln!(w, "{} pool : {:p}", pool.slug, pool.data)?;
        for chunk in pool.iter() {
            let header = unsafe { &*chunk };
            if header.used {
                let start = header.payload();
                writeln!(
                    w,
                    "{:p} - {:p} : {} bytes",
                    start,
                    start.wrapping_add(header.size),
                    header.size
                )?;
                total += header.size;
            }
        }
    }

    let large = &heap.large;
    writeln!(w, "{} pool : {:p}", large.slug, large.chunks)?;
    for chunk in large.iter() {
        let header = unsafe { &*chunk };
        if header.used {
            let start = header.payload();
            writeln!(
                w,
                "{:p} - {:p} : {} bytes",
                start,
                start.wrapping_add(header.size),
                header.size
            )?;
            total += header.size;
        }
    }

    writeln!(w, "Total : {} bytes", total)
}

/// The `show_alloc_mem_ex` surface: the full walk, with per-pool
/// parameters, every chunk header, hexdumps of used payloads, and
/// utilisation percentages.
pub(crate) fn render_extended(heap: &Heap, w: &mut dyn Write) -> fmt::Result {
    let mut total_allocated = 0usize;
    let mut total_used = 0usize;
    let mut total_freed = 0usize;

    writeln!(w, "Heap:")?;
    writeln!(w, "- page_size: {} bytes", heap.page_size)?;
    writeln!(w, "- limits:")?;
    writeln!(w, "  - soft: {} bytes", heap.limit_soft)?;
    writeln!(w, "  - hard: {} bytes", heap.limit_hard)?;

    for pool in heap.pools.iter() {
        write_pool(w, pool, 0, true)?;

        writeln!(w, "- data:")?;
        let mut pool_total = 0usize;
        let mut pool_used = 0usize;
        let mut pool_freed = 0usize;
        for chunk in pool.iter() {
            write_chunk(w, chunk, 2, true)?;
            let header = unsafe { &*chunk };
            pool_total += header.size;
            if header.used {
                pool_used += header.size;
            } else {
                pool_freed += header.size;
            }
        }

        writeln!(
            w,
            "- total: {}[{}%] bytes",
            pool_total,
            percent(pool_total, pool.size)
        )?;
        writeln!(
            w,
            "- used: {}[{}%] bytes",
            pool_used,
            percent(pool_used, pool.size)
        )?;
        writeln!(
            w,
            "- freed: {}[{}%] bytes",
            pool_freed,
            percent(pool_freed, pool.size)
        )?;
        let unmapped = pool.frontier_room();
        writeln!(
            w,
            "- unmapped: {}[{}%] bytes",
            unmapped,
            percent(unmapped, pool.size)
        )?;

        total_allocated += pool_total;
        total_used += pool_used;
        total_freed += pool_freed;
    }

    writeln!(w, "Large pool:")?;
    writeln!(w, "- data:")?;
    let mut large_total = 0usize;
    for chunk in heap.large.iter() {
        write_chunk(w, chunk, 2, true)?;
        let header = unsafe { &*chunk };
        if header.used {
            large_total += header.size;
        }
    }
    writeln!(w, "- total: {} bytes", large_total)?;
    total_allocated += large_total;

    writeln!(w, "Total: {} bytes", total_allocated)?;
    writeln!(w, "Used: {} bytes", total_used)?;
    writeln!(w, "Freed: {} bytes", total_freed)
}

fn draw_pool(w: &mut dyn Write, pool: &Pool, term_width: usize) -> fmt::Result {
    let tiled: usize = pool
        .iter()
        .map(|chunk| unsafe { (*chunk).total_size() })
        .sum();

    writeln!(w, "Pool {}[{:p}]:", pool.slug, pool.data)?;
    writeln!(w, "Size: {} bytes", pool.size)?;
    writeln!(w, "In Use: {} bytes", tiled)?;

    for _ in 0..term_width {
        w.write_char('-')?;
    }
    w.write_char('\n')?;

    w.write_char('|')?;
    let inner = term_width.saturating_sub(2);
    let mut written = 0usize;
    if tiled > 0 {
        for chunk in pool.iter() {
            let header = unsafe { &*chunk };
            let mut cells = header.total_size() * inner / tiled;
            if cells == 0 {
                cells = 1;
            }
            written += cells;

            let color = if header.used { COLOR_GREEN } else { COLOR_RED };
            for _ in 0..cells {
                write!(w, "{}|{}", color, COLOR_RESET)?;
            }
        }
    }
    for _ in written..inner {
        write!(w, "{}.{}", COLOR_YELLOW, COLOR_RESET)?;
    }
    w.write_str("|\n")?;

    for _ in 0..term_width {
        w.write_char('-')?;
    }
    w.write_str("\n\n")
}

/// The `draw_heap` surface: one width-scaled bar per pool, used
/// chunks green, free chunks red, untouched reservation as filler.
pub(crate) fn render_bars(heap: &Heap, term_width: usize, w: &mut dyn Write) -> fmt::Result {
    for pool in heap.pools.iter() {
        draw_pool(w, pool, term_width)?;
    }
    draw_pool(w, &heap.large, term_width)
}

/// Emits one chunk description on the diagnostic stream; used by the
/// `FT_MALLOC_LOG_CHUNK_ALLOC` toggle after successful allocations.
pub(crate) fn log_chunk(chunk: *mut ChunkHeader) {
    let mut writer = FdWriter::new(STDERR_FD);

    let _ = write_chunk(&mut writer, chunk, 0, false);
}
