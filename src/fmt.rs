//! Logging macros forwarding to `defmt` or `log` depending on the enabled
//! feature, compiled out entirely when neither is selected.
//!
//! Only plain `{}` placeholders may be used in format strings so that the
//! same call site is valid for both backends.
#![allow(unused_macros)]

macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::trace!($s $(, $x)*);
        #[cfg(all(feature = "log-04", not(feature = "defmt")))]
        ::log_04::trace!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "log-04")))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::debug!($s $(, $x)*);
        #[cfg(all(feature = "log-04", not(feature = "defmt")))]
        ::log_04::debug!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "log-04")))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::warn!($s $(, $x)*);
        #[cfg(all(feature = "log-04", not(feature = "defmt")))]
        ::log_04::warn!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "log-04")))]
        let _ = ($( & $x ),*);
    }};
}
