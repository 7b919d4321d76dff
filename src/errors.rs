//! Common error type shared by the future store, the engines and the device
//! drivers built on top of them.

/// Errors surfaced by the I²C engines and the future store.
///
/// Every variant maps to an errno-style negative code through
/// [`Error::code`], which is the value reported by
/// [`Future::error`](crate::future::Future::error) consumers that prefer raw
/// integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// No room left in the command queue or the future store.
    NoCapacity,
    /// A caller-supplied parameter was out of range.
    InvalidInput,
    /// The bus status read back did not match the expected status for the
    /// current transfer phase.
    Protocol,
    /// A future's byte stream was over- or under-run. This indicates a
    /// programming error in a device driver, such as two producers feeding
    /// the same future.
    ByteSequence,
    /// Reserved for device drivers layering timeouts on top of
    /// [`Future::wait`](crate::future::Future::wait); never produced by the
    /// engines themselves.
    Timeout,
}

impl Error {
    /// Returns the errno-style code for this error (always negative).
    pub const fn code(self) -> i8 {
        match self {
            Error::NoCapacity => -11,
            Error::InvalidInput => -22,
            Error::Protocol => -71,
            Error::ByteSequence => -84,
            Error::Timeout => -62,
        }
    }
}

impl core::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoCapacity => write!(f, "No room left in the queue or future store"),
            Error::InvalidInput => write!(f, "A parameter was out of range"),
            Error::Protocol => write!(f, "Unexpected bus status"),
            Error::ByteSequence => write!(f, "Future byte stream over- or under-run"),
            Error::Timeout => write!(f, "A timeout occurred"),
        }
    }
}
