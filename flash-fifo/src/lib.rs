//! A power-fail-tolerant FIFO queue over raw NOR flash.
//!
//! Records are appended with [`Fifo::write`], read non-destructively
//! with [`Fifo::read`], and retired with [`Fifo::consume`]. A crash at
//! any point leaves the flash in a state [`Fifo::open`] can always
//! recover from, at the cost of at most one erased page.
#![no_std]

mod chunk;
mod cursor;
mod directory;
mod error;
mod fmt;
mod page;
mod recovery;
mod region;
#[cfg(test)]
mod test_flash;

use embedded_storage::nor_flash::MultiwriteNorFlash;

pub use error::Error;
use fmt::{trace, warn};
use region::Region;

/// An open handle onto one FIFO's window of a flash device.
///
/// Does not own the flash device: every operation takes `&mut F`, so a
/// single physical chip can host several independent `Fifo`s over
/// disjoint `(start, len)` windows, each opened and used on demand.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Fifo {
    id: u8,
    region: Region,
    write_offset: u32,
    write_count: u8,
    raw_read_chunk_start: u32,
    raw_read_chunk_offset: u32,
    destructive_read_offset: u32,
    free_space: u32,
    tell: u32,
}

impl Fifo {
    /// Open (or recover) the FIFO occupying `[start, start+len)` of
    /// `flash`. `id` identifies this FIFO for the purposes of
    /// enforcing at most one open handle at a time; it is otherwise
    /// opaque and need not relate to `start`.
    ///
    /// Returns `Ok(None)` if `id` is already held by another open
    /// handle. Runs the full open-time recovery scan before returning,
    /// so this call's cost is proportional to the region's occupancy,
    /// not just its size.
    pub fn open<F: MultiwriteNorFlash>(
        flash: &mut F,
        id: u8,
        start: u32,
        len: u32,
    ) -> Result<Option<Self>, Error<F>> {
        validate_region::<F>(start, len)?;

        if !directory::acquire(id) {
            return Ok(None);
        }

        let region = Region {
            start,
            len,
            page_size: F::ERASE_SIZE as u32,
        };

        let recovered = match recovery::recover(flash, &region) {
            Ok(r) => r,
            Err(e) => {
                directory::release(id);
                return Err(e);
            }
        };

        trace!("fifo {} opened: write_offset={}", id, recovered.write_offset);

        Ok(Some(Fifo {
            id,
            region,
            write_offset: recovered.write_offset,
            write_count: recovered.write_count,
            raw_read_chunk_start: recovered.read_cursor,
            raw_read_chunk_offset: 0,
            destructive_read_offset: recovered.destructive_cursor,
            free_space: recovered.free_space,
            tell: 0,
        }))
    }

    /// Release this handle's id, allowing a future `open` to reclaim
    /// it. Nothing needs flushing: every committed byte is already on
    /// flash by the time a write call returns.
    pub fn close(self) {
        // Drop does the actual release; this method exists so callers
        // have an explicit, named operation to call.
    }

    /// Bytes of unconsumed-or-buffered data the FIFO currently holds.
    pub fn size(&self) -> usize {
        (self.region.len - self.free_space) as usize
    }

    /// No-op: every write lands on flash synchronously, so there is
    /// nothing buffered to flush. Present for API parity with systems
    /// that do buffer.
    pub fn sync(&self) {}

    /// Cumulative number of bytes ever returned by [`Fifo::read`] on
    /// this handle. Resets to zero on every `open`; not itself part of
    /// the FIFO's on-flash state.
    pub fn tell(&self) -> u32 {
        self.tell
    }

    /// Append `data` as one chunk. Returns `data.len()` on success, or
    /// `0` if the record is too large for this region's page size, too
    /// large to encode (`>= 0xFF` bytes), exceeds the currently free
    /// space, or the tail is parked waiting on a page erase that
    /// hasn't happened yet. Never an error unless the flash itself
    /// faults.
    pub fn write<F: MultiwriteNorFlash>(
        &mut self,
        flash: &mut F,
        data: &[u8],
    ) -> Result<usize, Error<F>> {
        if data.len() >= chunk::SLACK_SIZE as usize {
            return Ok(0);
        }
        let size = data.len() as u8;
        let page_size = self.region.page_size;
        if size as u32 > chunk::max_payload(page_size) {
            return Ok(0);
        }
        if size as u32 + chunk::HEADER_LEN > self.free_space {
            return Ok(0);
        }

        // Remember where the tail was before any parking/slack
        // adjustment below, so an idle read/destructive cursor that
        // was tracking it can be carried forward by the same amount.
        let idle_at = self.write_offset;

        if !self.resolve_park(flash)? {
            self.catch_up_idle_cursors(flash, idle_at)?;
            return Ok(0);
        }

        let page_start = self.region.page_start(self.write_offset);
        let page_end = page_start + page_size;
        if self.write_offset + chunk::chunk_len(size) > page_end {
            // End-of-page slack is never charged against `free_space`:
            // `compute_free_space` (recovery.rs) stops counting a page's
            // contents at its first slack slot too, so both sides of a
            // close/open cycle agree on what's "used" without a page
            // erase ever having to separately refund slack bytes.
            self.write_offset = page_end;
            if !self.resolve_park(flash)? {
                self.catch_up_idle_cursors(flash, idle_at)?;
                return Ok(0);
            }
        }

        self.catch_up_idle_cursors(flash, idle_at)?;

        let at = self.write_offset;
        flash.write(at, &[size]).map_err(Error::flash)?;
        flash
            .write(at + chunk::HEADER_LEN, data)
            .map_err(Error::flash)?;
        flash
            .write(at + 1, &[chunk::ChunkState::Valid.to_byte()])
            .map_err(Error::flash)?;

        self.write_offset = at + chunk::chunk_len(size);
        self.free_space -= chunk::chunk_len(size);
        trace!("fifo {} wrote {} bytes at {}", self.id, data.len(), at);

        // landed exactly on the next page's counter byte: try to park
        // there too, so the next write doesn't pay for it. Best-effort;
        // if the next page isn't erased yet, we just stay parked.
        if self.region.page_start(self.write_offset) == self.write_offset {
            let _ = self.resolve_park(flash)?;
        }

        Ok(data.len())
    }

    /// If the tail sits at a page boundary, stamp the page's sequence
    /// counter and step past it. Returns `false` if the tail is parked
    /// and the page still awaits an erase (caller must not write).
    fn resolve_park<F: MultiwriteNorFlash>(&mut self, flash: &mut F) -> Result<bool, Error<F>> {
        if self.region.page_start(self.write_offset) != self.write_offset {
            return Ok(true);
        }
        let mut counter = [0u8; 1];
        flash
            .read(self.write_offset, &mut counter)
            .map_err(Error::flash)?;
        if counter[0] != page::ERASED {
            return Ok(false);
        }
        let stamp = page::stamp_for(self.write_count);
        flash.write(self.write_offset, &[stamp]).map_err(Error::flash)?;
        self.write_count = page::next_write_count(self.write_count);
        self.write_offset += 1;
        self.free_space = self.free_space.saturating_sub(1);
        Ok(true)
    }

    /// Carry an idle read/destructive cursor forward across however
    /// many pages the tail just crossed while parking. A cursor is
    /// "idle" here if it was sitting exactly at the tail before this
    /// write touched anything — which can only mean the FIFO was
    /// fully drained up to that point, so no real chunk lived on any
    /// page the tail skipped past. If the destructive cursor was one
    /// of the idle ones, the page it left behind is reclaimed through
    /// the ordinary drained-page check, same as in `consume`.
    fn catch_up_idle_cursors<F: MultiwriteNorFlash>(
        &mut self,
        flash: &mut F,
        idle_at: u32,
    ) -> Result<(), Error<F>> {
        if self.raw_read_chunk_start == idle_at {
            self.raw_read_chunk_start = self.write_offset;
        }
        if self.destructive_read_offset == idle_at {
            let old_page = self.region.page_start(idle_at);
            self.destructive_read_offset = self.write_offset;
            if self.region.page_start(self.write_offset) != old_page {
                self.maybe_erase(flash, old_page)?;
            }
        }
        Ok(())
    }

    /// Copy up to `buf.len()` unread bytes into `buf`, advancing the
    /// non-destructive read cursor. Returns the number of bytes
    /// actually copied, which is less than `buf.len()` only when the
    /// cursor catches up to the tail.
    pub fn read<F: MultiwriteNorFlash>(
        &mut self,
        flash: &mut F,
        buf: &mut [u8],
    ) -> Result<usize, Error<F>> {
        let mut delivered = 0usize;
        while delivered < buf.len() {
            if self.raw_read_chunk_start == self.write_offset {
                let mut size_byte = [0u8; 1];
                flash
                    .read(self.raw_read_chunk_start, &mut size_byte)
                    .map_err(Error::flash)?;
                if size_byte[0] == chunk::SLACK_SIZE {
                    break;
                }
                // else: tail parked behind the cursor's numeric
                // position, genuinely more data sits right here.
            }

            let mut header = [0u8; 2];
            flash
                .read(self.raw_read_chunk_start, &mut header)
                .map_err(Error::flash)?;
            let size = header[0] as u32;
            let remaining = size - self.raw_read_chunk_offset;
            let want = (buf.len() - delivered) as u32;
            let take = remaining.min(want);

            let src =
                self.raw_read_chunk_start + chunk::HEADER_LEN + self.raw_read_chunk_offset;
            flash
                .read(src, &mut buf[delivered..delivered + take as usize])
                .map_err(Error::flash)?;
            delivered += take as usize;
            self.tell += take;

            if take == remaining {
                self.raw_read_chunk_offset = 0;
                self.raw_read_chunk_start =
                    cursor::advance(flash, &self.region, self.raw_read_chunk_start, self.write_offset)?;
            } else {
                self.raw_read_chunk_offset += take;
                break;
            }
        }
        Ok(delivered)
    }

    /// Mark up to `max` bytes' worth of already-read chunks consumed,
    /// reclaiming their space, and erase any page this drains
    /// entirely. Only ever consumes whole chunks, and only chunks the
    /// non-destructive read cursor has already passed; returns the
    /// number of bytes actually consumed.
    pub fn consume<F: MultiwriteNorFlash>(
        &mut self,
        flash: &mut F,
        max: usize,
    ) -> Result<usize, Error<F>> {
        let mut remaining = max as u32;
        let mut consumed_total = 0u32;

        while remaining > 0 {
            if self.destructive_read_offset == self.raw_read_chunk_start {
                break;
            }

            let mut header = [0u8; 2];
            flash
                .read(self.destructive_read_offset, &mut header)
                .map_err(Error::flash)?;
            let size = header[0] as u32;
            if size > remaining {
                break;
            }

            flash
                .write(
                    self.destructive_read_offset + 1,
                    &[chunk::ChunkState::Consumed.to_byte()],
                )
                .map_err(Error::flash)?;
            remaining -= size;
            consumed_total += size;
            self.free_space += size + chunk::HEADER_LEN;

            let prev_page = self.region.page_start(self.destructive_read_offset);
            let next = cursor::advance(
                flash,
                &self.region,
                self.destructive_read_offset,
                self.raw_read_chunk_start,
            )?;
            self.destructive_read_offset = next;

            if self.region.page_start(next) != prev_page {
                self.maybe_erase(flash, prev_page)?;
            }
        }

        Ok(consumed_total as usize)
    }

    /// Erase `page_start` if its first chunk is consumed and neither
    /// cursor lives there. The destructive cursor only just crossed
    /// out of this page, which (consumption being strictly in order)
    /// means every chunk on it is consumed, not just the first — this
    /// checks only the first because that's what the crossing already
    /// guarantees.
    fn maybe_erase<F: MultiwriteNorFlash>(
        &mut self,
        flash: &mut F,
        page_start: u32,
    ) -> Result<(), Error<F>> {
        let mut header = [0u8; 2];
        flash.read(page_start + 1, &mut header).map_err(Error::flash)?;
        let first_consumed = matches!(
            chunk::decode(header[0], header[1]),
            chunk::Slot::Chunk {
                state: chunk::ChunkState::Consumed,
                ..
            }
        );
        if !first_consumed {
            return Ok(());
        }

        let tail_here = self.region.page_start(self.write_offset) == page_start;
        let read_here = self.region.page_start(self.raw_read_chunk_start) == page_start;
        if tail_here || read_here {
            return Ok(());
        }

        let page_end = page_start + self.region.page_size;
        flash.erase(page_start, page_end).map_err(Error::flash)?;
        self.free_space += 1;
        warn!(
            "fifo {} reclaimed drained page {}",
            self.id,
            self.region.page_index(page_start)
        );
        Ok(())
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        directory::release(self.id);
    }
}

fn validate_region<F: MultiwriteNorFlash>(start: u32, len: u32) -> Result<(), Error<F>> {
    let page_size = F::ERASE_SIZE as u32;
    if page_size == 0 || len % page_size != 0 || start % page_size != 0 {
        return Err(Error::InvalidRegion);
    }
    let page_count = len / page_size;
    if page_count < 3 {
        return Err(Error::InvalidRegion);
    }
    if page_count > page::CYCLE_LEN {
        return Err(Error::TooManyPages);
    }
    Ok(())
}

/// Erase a flash device's entire reported capacity.
pub fn format<F: MultiwriteNorFlash>(flash: &mut F) -> Result<(), Error<F>> {
    let capacity = flash.capacity() as u32;
    flash.erase(0, capacity).map_err(Error::flash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_flash::VirtualNorFlash;

    const FILE_SIZE: u32 = 384;
    const FILE_OFFSET: u32 = 0;

    fn open(flash: &mut VirtualNorFlash<384>, id: u8) -> Fifo {
        Fifo::open(flash, id, FILE_OFFSET, FILE_SIZE)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn basic_write_then_read() {
        let mut flash = VirtualNorFlash::<384>::new();
        let mut fifo = open(&mut flash, 1);

        assert_eq!(fifo.write(&mut flash, b"hello").unwrap(), 5);
        // 1 page counter byte + 2-byte header + 5-byte payload
        assert_eq!(fifo.size(), 8);

        let mut buf = [0u8; 5];
        assert_eq!(fifo.read(&mut flash, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(fifo.tell(), 5);

        // still unconsumed, so still counted in size()
        assert_eq!(fifo.size(), 8);
    }

    #[test]
    fn write_fails_when_record_too_large_for_a_page() {
        let mut flash = VirtualNorFlash::<384>::new();
        let mut fifo = open(&mut flash, 2);

        let oversized = [0u8; 126]; // page_size(128) - header(2) - counter(1) + 1
        assert_eq!(fifo.write(&mut flash, &oversized).unwrap(), 0);
    }

    #[test]
    fn write_parks_tail_across_a_page_boundary() {
        let mut flash = VirtualNorFlash::<384>::new();
        let mut fifo = open(&mut flash, 3);

        // first page holds 125 usable bytes after its counter; fill it
        // close to the edge so the next write must cross into page 2.
        assert_eq!(fifo.write(&mut flash, &[0xAAu8; 100]).unwrap(), 100);
        assert_eq!(fifo.write(&mut flash, &[0xBBu8; 50]).unwrap(), 50);

        let mut buf = [0u8; 150];
        assert_eq!(fifo.read(&mut flash, &mut buf).unwrap(), 150);
        assert_eq!(&buf[..100], &[0xAAu8; 100][..]);
        assert_eq!(&buf[100..], &[0xBBu8; 50][..]);
    }

    #[test]
    fn partial_consume_keeps_unconsumed_remainder() {
        let mut flash = VirtualNorFlash::<384>::new();
        let mut fifo = open(&mut flash, 4);

        fifo.write(&mut flash, b"first").unwrap();
        fifo.write(&mut flash, b"second").unwrap();

        let mut buf = [0u8; 11];
        fifo.read(&mut flash, &mut buf).unwrap();

        // only the first record's worth is eligible to be retired
        assert_eq!(fifo.consume(&mut flash, 5).unwrap(), 5);
        // counter byte + "second"'s header + payload remain charged
        assert_eq!(fifo.size(), 9);
    }

    #[test]
    fn consume_reclaims_a_fully_drained_page() {
        let mut flash = VirtualNorFlash::<384>::new();
        let mut fifo = open(&mut flash, 5);

        // fill page 1 with one big record, spill a second record onto
        // page 2, then fully read and consume the first record so
        // page 1 becomes eligible for erasure.
        let first = [1u8; 100];
        let second = [2u8; 30];
        fifo.write(&mut flash, &first).unwrap();
        fifo.write(&mut flash, &second).unwrap();

        let mut buf = [0u8; 130];
        fifo.read(&mut flash, &mut buf).unwrap();
        assert_eq!(fifo.consume(&mut flash, 100).unwrap(), 100);

        // page 1's counter byte should read back erased (0xFF)
        assert_eq!(flash.bytes()[0], 0xFF);
    }

    #[test]
    fn read_skips_invalid_and_consumed_chunks() {
        let mut flash = VirtualNorFlash::<384>::new();
        let mut fifo = open(&mut flash, 6);

        fifo.write(&mut flash, b"a").unwrap();
        fifo.write(&mut flash, b"bb").unwrap();
        fifo.write(&mut flash, b"ccc").unwrap();

        let mut buf = [0u8; 1];
        fifo.read(&mut flash, &mut buf).unwrap();
        assert_eq!(fifo.consume(&mut flash, 1).unwrap(), 1);

        let mut rest = [0u8; 5];
        let n = fifo.read(&mut flash, &mut rest).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&rest, b"bbccc");
    }

    #[test]
    fn ring_wraps_after_several_pages_fill_and_drain() {
        let mut flash = VirtualNorFlash::<384>::new();
        let mut fifo = open(&mut flash, 7);

        for round in 0..6u8 {
            let payload = [round; 40];
            assert_eq!(fifo.write(&mut flash, &payload).unwrap(), 40);
            let mut buf = [0u8; 40];
            assert_eq!(fifo.read(&mut flash, &mut buf).unwrap(), 40);
            assert_eq!(buf, payload);
            assert_eq!(fifo.consume(&mut flash, 40).unwrap(), 40);
        }

        // not exactly 0: the page holding the most recent record still
        // has an active (not yet erased) counter byte outstanding.
        assert_eq!(fifo.size(), 1);
    }

    #[test]
    fn double_open_is_refused() {
        let mut flash = VirtualNorFlash::<384>::new();
        let fifo = open(&mut flash, 9);
        assert!(Fifo::open(&mut flash, 9, FILE_OFFSET, FILE_SIZE)
            .unwrap()
            .is_none());
        fifo.close();
        assert!(Fifo::open(&mut flash, 9, FILE_OFFSET, FILE_SIZE)
            .unwrap()
            .is_some());
    }

    #[test]
    fn recovers_unread_data_after_reopen() {
        let mut flash = VirtualNorFlash::<384>::new();
        {
            let mut fifo = open(&mut flash, 10);
            fifo.write(&mut flash, b"durable").unwrap();
            fifo.close();
        }

        let mut fifo = open(&mut flash, 10);
        let mut buf = [0u8; 7];
        assert_eq!(fifo.read(&mut flash, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn recovers_across_power_loss_mid_commit() {
        let mut flash = VirtualNorFlash::<384>::new();
        {
            let mut fifo = open(&mut flash, 13);
            assert_eq!(fifo.write(&mut flash, b"first").unwrap(), 5);

            // simulate power loss partway through committing the second
            // record: the size byte and payload land, but the write that
            // would flip its state byte from "reserved" to "valid" never
            // does.
            flash.fail_after(1 + 6);
            assert_eq!(fifo.write(&mut flash, &[0xAAu8; 6]).unwrap(), 6);

            // power restored: later writes land normally again.
            flash.fail_after(u32::MAX);
            assert_eq!(fifo.write(&mut flash, b"third").unwrap(), 5);

            fifo.close();
        }

        // reopen: recovery must walk past the torn record (its size byte
        // is enough to compute its length, even though it never became
        // valid) straight to the next record that did commit.
        let mut fifo = open(&mut flash, 13);

        let mut buf = [0u8; 5];
        assert_eq!(fifo.read(&mut flash, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"first");

        let mut buf2 = [0u8; 5];
        assert_eq!(fifo.read(&mut flash, &mut buf2).unwrap(), 5);
        assert_eq!(&buf2, b"third");

        let mut buf3 = [0u8; 1];
        assert_eq!(fifo.read(&mut flash, &mut buf3).unwrap(), 0);
    }

    #[test]
    fn write_returns_zero_when_free_space_exhausted() {
        let mut flash = VirtualNorFlash::<384>::new();
        let mut fifo = open(&mut flash, 11);

        let mut total = 0;
        loop {
            let n = fifo.write(&mut flash, &[0u8; 40]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
            assert!(total < 384, "write never refused, free_space accounting is broken");
        }
    }

    #[test]
    fn region_rejecting_bad_sizes() {
        let mut flash = VirtualNorFlash::<384>::new();
        // not a multiple of the page size
        assert!(matches!(
            Fifo::open(&mut flash, 20, 0, 200),
            Err(Error::InvalidRegion)
        ));
        // not page-aligned
        assert!(matches!(
            Fifo::open(&mut flash, 21, 1, 256),
            Err(Error::InvalidRegion)
        ));
    }
}
