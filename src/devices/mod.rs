//! Drivers for I²C devices, built on the [`i2c`](crate::i2c) core.
//!
//! Each driver wraps an [`i2c::Device`](crate::i2c::Device), defines one
//! future type per operation that needs staged input or typed output, and
//! exposes both an asynchronous API (allocate a future, launch, poll or
//! wait at leisure) and blocking conveniences built on
//! [`Future::wait`](crate::future::Future::wait).

pub mod ds1307;
