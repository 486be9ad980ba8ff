//! At-most-one-open-handle-per-id enforcement (`spec.md` §5, §9 "Handle &
//! directory").
//!
//! One `u8` id space, one atomic slot per id. `open` claims a slot with a
//! compare-exchange; `close`/`drop` releases it. No lock is needed since
//! the whole operation is a single atomic compare-and-swap.

use core::sync::atomic::{AtomicBool, Ordering};

const SLOTS: usize = 256;

struct Directory {
    open: [AtomicBool; SLOTS],
}

// AtomicBool::new is const, so this array literal can be built with a
// macro-free repeat expression.
#[allow(clippy::declare_interior_mutable_const)]
const CLOSED: AtomicBool = AtomicBool::new(false);

static DIRECTORY: Directory = Directory {
    open: [CLOSED; SLOTS],
};

/// Attempt to claim `id`. Returns `true` if the id was free and is now
/// held, `false` if another handle already holds it.
pub(crate) fn acquire(id: u8) -> bool {
    DIRECTORY.open[id as usize]
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Release a previously claimed id. No-op if it wasn't held (defensive;
/// should never happen given `Fifo` owns its id for its lifetime).
pub(crate) fn release(id: u8) {
    DIRECTORY.open[id as usize].store(false, Ordering::Release);
}
