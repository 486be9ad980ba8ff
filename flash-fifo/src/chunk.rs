//! Chunk header encode/decode.
//!
//! A chunk occupies `size + 2` contiguous bytes within a single page:
//! one size byte, one state byte, then `size` payload bytes. `size` is
//! never `0xFF` for a real chunk — that value is reserved to mark
//! end-of-page slack.

pub(crate) const STATE_INVALID: u8 = 0xFF;
pub(crate) const STATE_VALID: u8 = 0xFE;
pub(crate) const STATE_CONSUMED: u8 = 0xFC;

/// Size byte value meaning "no chunk here, rest of page is unused".
pub(crate) const SLACK_SIZE: u8 = 0xFF;

/// Bytes of header preceding the payload (size byte + state byte).
pub(crate) const HEADER_LEN: u32 = 2;

/// Largest payload a chunk may carry, leaving room for its own header
/// and the page's sequence-counter byte.
pub(crate) fn max_payload(page_size: u32) -> u32 {
    page_size - HEADER_LEN - 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    /// Reserved: size/payload committed (or not) but the state flip
    /// never landed. Indistinguishable from a torn write.
    Invalid,
    /// Written and committed; readable.
    Valid,
    /// Logically deleted; eligible for its page to be erased.
    Consumed,
}

impl ChunkState {
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            STATE_INVALID => Some(ChunkState::Invalid),
            STATE_VALID => Some(ChunkState::Valid),
            STATE_CONSUMED => Some(ChunkState::Consumed),
            _ => None,
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            ChunkState::Invalid => STATE_INVALID,
            ChunkState::Valid => STATE_VALID,
            ChunkState::Consumed => STATE_CONSUMED,
        }
    }
}

/// What a 2-byte header at some slot decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// End-of-page slack; no chunk here, nothing further on this page.
    Slack,
    /// A chunk with a legal state byte.
    Chunk { size: u8, state: ChunkState },
    /// Neither slack nor a legal chunk: `size != 0xFF` but the state byte
    /// isn't one of the three legal values, or `size == 0xFF` but the
    /// state byte isn't `0xFF` either. This is the "impossible state
    /// combination" `spec.md` §4.2 Phase A erases on sight.
    Corrupt,
}

pub(crate) fn decode(size_byte: u8, state_byte: u8) -> Slot {
    if size_byte == SLACK_SIZE {
        if state_byte == STATE_INVALID {
            Slot::Slack
        } else {
            Slot::Corrupt
        }
    } else {
        match ChunkState::from_byte(state_byte) {
            Some(state) => Slot::Chunk {
                size: size_byte,
                state,
            },
            None => Slot::Corrupt,
        }
    }
}

/// Total on-flash length of a chunk (header + payload) given its size byte.
pub(crate) fn chunk_len(size: u8) -> u32 {
    size as u32 + HEADER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_slack() {
        assert_eq!(decode(SLACK_SIZE, STATE_INVALID), Slot::Slack);
    }

    #[test]
    fn decodes_valid_chunk() {
        assert_eq!(
            decode(4, STATE_VALID),
            Slot::Chunk {
                size: 4,
                state: ChunkState::Valid
            }
        );
    }

    #[test]
    fn decodes_invalid_chunk() {
        assert_eq!(
            decode(4, STATE_INVALID),
            Slot::Chunk {
                size: 4,
                state: ChunkState::Invalid
            }
        );
    }

    #[test]
    fn decodes_consumed_chunk() {
        assert_eq!(
            decode(4, STATE_CONSUMED),
            Slot::Chunk {
                size: 4,
                state: ChunkState::Consumed
            }
        );
    }

    #[test]
    fn rejects_slack_size_with_live_state() {
        // the assignment-vs-comparison typo from spec.md §9: a page that
        // looks like slack but carries a non-erased state byte is corrupt,
        // not slack.
        assert_eq!(decode(SLACK_SIZE, STATE_VALID), Slot::Corrupt);
    }

    #[test]
    fn rejects_illegal_state_byte() {
        assert_eq!(decode(4, 0x55), Slot::Corrupt);
    }

    #[test]
    fn chunk_len_includes_header() {
        assert_eq!(chunk_len(4), 6);
        assert_eq!(chunk_len(0), 2);
    }

    #[test]
    fn max_payload_reserves_counter_byte() {
        assert_eq!(max_payload(128), 125);
    }
}
