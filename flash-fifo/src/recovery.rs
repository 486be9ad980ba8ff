//! Open-time recovery scan (`spec.md` §4.2).
//!
//! Three phases, run once per `open`: repair at most one corrupted page,
//! locate the tail (write cursor), then locate the head (read/destructive
//! cursors). At most one page can ever be corrupted, because pages are
//! erased one at a time — a crash during erase damages exactly one page.

use embedded_storage::nor_flash::MultiwriteNorFlash;

use crate::chunk::{self, ChunkState, Slot};
use crate::error::Error;
use crate::fmt::{info, warn};
use crate::page;
use crate::region::Region;

pub(crate) struct Recovered {
    pub write_offset: u32,
    pub write_count: u8,
    pub read_cursor: u32,
    pub destructive_cursor: u32,
    pub free_space: u32,
}

pub(crate) fn recover<F: MultiwriteNorFlash>(
    flash: &mut F,
    region: &Region,
) -> Result<Recovered, Error<F>> {
    repair_corruption(flash, region)?;
    let (write_offset, write_count, fresh) = locate_tail(flash, region)?;
    let head = if fresh {
        // Nothing has ever been written anywhere in the region: page 0
        // itself isn't stamped yet, so there is no "previous page" for
        // a backward walk to find. Head trivially equals tail.
        write_offset
    } else {
        locate_head(flash, region, write_offset)?
    };
    let free_space = compute_free_space(flash, region)?;
    Ok(Recovered {
        write_offset,
        write_count,
        read_cursor: head,
        destructive_cursor: head,
        free_space,
    })
}

/// Phase A: find and erase the one page a crash could have corrupted.
/// Stops at the first corrupted page found, per `spec.md` §4.2.
fn repair_corruption<F: MultiwriteNorFlash>(
    flash: &mut F,
    region: &Region,
) -> Result<(), Error<F>> {
    for i in 0..region.page_count() {
        let page_start = region.nth_page(i);
        let mut counter = [0u8; 1];
        flash.read(page_start, &mut counter).map_err(Error::flash)?;

        if !page::is_legal(counter[0]) {
            warn!(
                "page {} has an illegal sequence counter, erasing to repair",
                i
            );
            flash
                .erase(page_start, page_start + region.page_size)
                .map_err(Error::flash)?;
            return Ok(());
        }
        if counter[0] == page::ERASED {
            continue;
        }
        if page_is_corrupt(flash, region, page_start)? {
            warn!("page {} has an impossible chunk layout, erasing to repair", i);
            flash
                .erase(page_start, page_start + region.page_size)
                .map_err(Error::flash)?;
            return Ok(());
        }
    }
    Ok(())
}

/// Walk a page's chunks in order, reporting whether any slot has an
/// impossible size/state combination.
fn page_is_corrupt<F: MultiwriteNorFlash>(
    flash: &mut F,
    region: &Region,
    page_start: u32,
) -> Result<bool, Error<F>> {
    let page_end = page_start + region.page_size;
    let mut pos = page_start + 1;
    while pos < page_end {
        let mut header = [0u8; 2];
        flash.read(pos, &mut header).map_err(Error::flash)?;
        match chunk::decode(header[0], header[1]) {
            Slot::Slack => return Ok(false),
            Slot::Chunk { size, .. } => {
                let next = pos + chunk::chunk_len(size);
                if next > page_end {
                    return Ok(true);
                }
                pos = next;
            }
            Slot::Corrupt => return Ok(true),
        }
    }
    Ok(false)
}

/// Phase B: the tail lives on the most-recently-stamped page. Walk its
/// already-written chunks to find where free space begins, stamping the
/// next page if the walk runs off the end of this one and that next page
/// is already erased.
fn locate_tail<F: MultiwriteNorFlash>(
    flash: &mut F,
    region: &Region,
) -> Result<(u32, u8, bool), Error<F>> {
    let mut newest: Option<(u32, u8)> = None;
    for i in 0..region.page_count() {
        let page_start = region.nth_page(i);
        let mut counter = [0u8; 1];
        flash.read(page_start, &mut counter).map_err(Error::flash)?;
        if counter[0] == page::ERASED {
            continue;
        }
        match newest {
            Some((_, stamp))
                if page::cleared_bits(stamp) >= page::cleared_bits(counter[0]) => {}
            _ => newest = Some((page_start, counter[0])),
        }
    }

    let Some((page_start, stamp)) = newest else {
        // Brand-new FIFO: nothing written anywhere yet.
        return Ok((region.start, 1, true));
    };

    let mut write_count = page::next_write_count(
        page::write_count_of(stamp).expect("phase A guarantees a legal stamp"),
    );
    let page_end = page_start + region.page_size;
    let mut pos = page_start + 1;

    loop {
        if pos == page_end {
            let next_page = region.next_page(page_start);
            let mut counter = [0u8; 1];
            flash.read(next_page, &mut counter).map_err(Error::flash)?;
            if counter[0] == page::ERASED {
                let stamp = page::stamp_for(write_count);
                flash.write(next_page, &[stamp]).map_err(Error::flash)?;
                write_count = page::next_write_count(write_count);
                pos = next_page + 1;
            } else {
                pos = next_page;
            }
            break;
        }

        let mut header = [0u8; 2];
        flash.read(pos, &mut header).map_err(Error::flash)?;
        match chunk::decode(header[0], header[1]) {
            Slot::Slack => break,
            Slot::Chunk { size, .. } => pos += chunk::chunk_len(size),
            Slot::Corrupt => {
                warn!("tail walk hit a corrupt slot that phase A should have removed");
                break;
            }
        }
    }

    Ok((pos, write_count, false))
}

/// Phase C: walk backward from the tail's page looking for the boundary
/// between already-reclaimed space and the oldest page still holding
/// unconsumed data.
fn locate_head<F: MultiwriteNorFlash>(
    flash: &mut F,
    region: &Region,
    write_offset: u32,
) -> Result<u32, Error<F>> {
    let tail_page = region.page_start(write_offset);
    let parked = write_offset == tail_page;

    let mut page_start = tail_page;
    for _ in 0..region.page_count() {
        let candidate = region.prev_page(page_start);
        if candidate == tail_page {
            // Full lap: every other page is live front-to-back.
            return Ok(if parked { tail_page + 1 } else { write_offset });
        }
        page_start = candidate;

        let mut counter = [0u8; 1];
        flash.read(page_start, &mut counter).map_err(Error::flash)?;
        if counter[0] == page::ERASED {
            return Ok(region.next_page(page_start) + 1);
        }

        let mut header = [0u8; 2];
        flash
            .read(page_start + 1, &mut header)
            .map_err(Error::flash)?;
        match chunk::decode(header[0], header[1]) {
            Slot::Chunk {
                state: ChunkState::Consumed,
                ..
            } => {
                if let Some(pos) = scan_for_valid(flash, region, page_start)? {
                    return Ok(pos);
                }
                info!(
                    "fully consumed page {} found during recovery, erasing",
                    region.page_index(page_start)
                );
                let page_end = page_start + region.page_size;
                flash.erase(page_start, page_end).map_err(Error::flash)?;
                return Ok(region.next_page(page_start) + 1);
            }
            _ => continue,
        }
    }

    Ok(if parked { tail_page + 1 } else { write_offset })
}

/// Scan a page (known to start with a consumed chunk) for the first
/// still-valid chunk. `None` if every chunk on the page is consumed.
fn scan_for_valid<F: MultiwriteNorFlash>(
    flash: &mut F,
    region: &Region,
    page_start: u32,
) -> Result<Option<u32>, Error<F>> {
    let page_end = page_start + region.page_size;
    let mut pos = page_start + 1;
    while pos < page_end {
        let mut header = [0u8; 2];
        flash.read(pos, &mut header).map_err(Error::flash)?;
        match chunk::decode(header[0], header[1]) {
            Slot::Chunk {
                state: ChunkState::Valid,
                ..
            } => return Ok(Some(pos)),
            Slot::Chunk { size, .. } => pos += chunk::chunk_len(size),
            Slot::Slack => return Ok(None),
            Slot::Corrupt => return Ok(None),
        }
    }
    Ok(None)
}

/// Recompute `free_space` from scratch, per the invariant in `spec.md`
/// §8: total region size minus the header+payload of every non-consumed
/// chunk, minus one reserved counter byte per non-erased page.
fn compute_free_space<F: MultiwriteNorFlash>(
    flash: &mut F,
    region: &Region,
) -> Result<u32, Error<F>> {
    let mut used = 0u32;
    for i in 0..region.page_count() {
        let page_start = region.nth_page(i);
        let mut counter = [0u8; 1];
        flash.read(page_start, &mut counter).map_err(Error::flash)?;
        if counter[0] == page::ERASED {
            continue;
        }
        used += 1; // this page's counter byte
        let page_end = page_start + region.page_size;
        let mut pos = page_start + 1;
        while pos < page_end {
            let mut header = [0u8; 2];
            flash.read(pos, &mut header).map_err(Error::flash)?;
            match chunk::decode(header[0], header[1]) {
                Slot::Slack => break,
                Slot::Chunk { size, state } => {
                    let len = chunk::chunk_len(size);
                    if state != ChunkState::Consumed {
                        used += len;
                    }
                    pos += len;
                }
                Slot::Corrupt => break,
            }
        }
    }
    Ok(region.len - used)
}
