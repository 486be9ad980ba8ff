//! Shared cursor-advance engine (`spec.md` §4.3).
//!
//! Both the non-destructive read cursor and the destructive cursor move
//! forward by the exact same rule: skip consumed/invalid chunks and
//! end-of-page slack until parked on a valid chunk or on the other
//! cursor, whichever comes first. Neither this function nor its callers
//! write anything to flash — marking a chunk consumed happens before
//! `advance` is called, in the consume path.

use embedded_storage::nor_flash::MultiwriteNorFlash;

use crate::chunk::{decode, Slot, SLACK_SIZE};
use crate::error::Error;
use crate::fmt::warn;
use crate::region::Region;

/// Move a cursor one chunk (or more, skipping dead slots) forward from
/// `pos`, stopping at the next valid chunk or at `stop_at`, whichever is
/// reached first.
pub(crate) fn advance<F: MultiwriteNorFlash>(
    flash: &mut F,
    region: &Region,
    mut pos: u32,
    stop_at: u32,
) -> Result<u32, Error<F>> {
    loop {
        let mut header = [0u8; 2];
        flash.read(pos, &mut header).map_err(Error::flash)?;
        let size_byte = header[0];

        let page_start = region.page_start(pos);
        let page_end = page_start + region.page_size;

        let mut next = if size_byte == SLACK_SIZE {
            page_end
        } else {
            pos + crate::chunk::chunk_len(size_byte)
        };
        if next >= page_end {
            next = region.next_page(page_start) + 1;
        }

        if next == stop_at {
            return Ok(next);
        }

        let mut next_header = [0u8; 2];
        flash.read(next, &mut next_header).map_err(Error::flash)?;
        match decode(next_header[0], next_header[1]) {
            Slot::Chunk { state, .. } if state == crate::chunk::ChunkState::Valid => {
                return Ok(next);
            }
            Slot::Chunk { .. } | Slot::Slack => {
                pos = next;
            }
            Slot::Corrupt => {
                warn!("cursor advance hit an unexpected slot layout past recovery; parking");
                return Ok(next);
            }
        }
    }
}
