//! Logging shim: routes through `defmt` or `log`, whichever feature is
//! enabled, and compiles to nothing when neither is.

#![allow(unused)]

macro_rules! trace {
    ($($arg:tt)*) => {
        {
            #[cfg(feature = "defmt")]
            defmt::trace!($($arg)*);
            #[cfg(feature = "log")]
            log::trace!($($arg)*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($($arg)*,);
        }
    };
}

macro_rules! debug {
    ($($arg:tt)*) => {
        {
            #[cfg(feature = "defmt")]
            defmt::debug!($($arg)*);
            #[cfg(feature = "log")]
            log::debug!($($arg)*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($($arg)*,);
        }
    };
}

macro_rules! info {
    ($($arg:tt)*) => {
        {
            #[cfg(feature = "defmt")]
            defmt::info!($($arg)*);
            #[cfg(feature = "log")]
            log::info!($($arg)*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($($arg)*,);
        }
    };
}

macro_rules! warn {
    ($($arg:tt)*) => {
        {
            #[cfg(feature = "defmt")]
            defmt::warn!($($arg)*);
            #[cfg(feature = "log")]
            log::warn!($($arg)*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($($arg)*,);
        }
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        {
            #[cfg(feature = "defmt")]
            defmt::error!($($arg)*);
            #[cfg(feature = "log")]
            log::error!($($arg)*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ($($arg)*,);
        }
    };
}

pub(crate) use debug;
pub(crate) use error;
pub(crate) use info;
pub(crate) use trace;
pub(crate) use warn;
