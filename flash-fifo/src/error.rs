use embedded_storage::nor_flash::MultiwriteNorFlash;
use thiserror::Error;

/// Errors returned by [`crate::Fifo`] operations.
///
/// Genuine flash I/O failures are surfaced here. Everything the
/// specification treats as a FIFO-level outcome rather than an error —
/// an oversized record, a tail parked waiting on an erase, reaching the
/// end of the stream — is instead encoded in the returned byte count,
/// never in this type.
#[derive(Debug, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "defmt", defmt(bound = "F::Error: defmt::Format"))]
pub enum Error<F: MultiwriteNorFlash> {
    /// The underlying flash device reported an error.
    #[error("flash I/O failure")]
    Flash(F::Error),
    /// `start`/`len` do not describe a usable FIFO region: `len` is not a
    /// multiple of the page size, or smaller than the recommended
    /// triple-buffering minimum, or `start` is not page-aligned.
    #[error("flash region is not a valid FIFO window")]
    InvalidRegion,
    /// The region spans more pages than the page sequence counter can
    /// order (see `spec.md` §9); reduce `len` or extend the counter.
    #[error("region holds more pages than the sequence counter can order")]
    TooManyPages,
}

impl<F: MultiwriteNorFlash> Error<F> {
    pub(crate) fn flash(e: F::Error) -> Self {
        Error::Flash(e)
    }
}
