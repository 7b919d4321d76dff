//! # fastavr
//!
//! Bare-metal, allocation-free I²C master framework for 8-bit AVR
//! microcontrollers (ATmega328P/2560/644/32U4, ATtiny84/85).
//!
//! ## Overview
//!
//! The crate is built around an asynchronous I²C master transaction engine
//! and a future-based result delivery mechanism:
//!
//! - [`future::FutureStore`] owns a fixed pool of result slots. Device
//!   drivers allocate a typed [`future::Future`] from it, stage the bytes to
//!   transmit, and later read back the received value.
//! - [`i2c::twi::Twi`] is the interrupt-driven engine for MCUs with the
//!   hardware two-wire interface. Commands are queued from foreground code
//!   and executed byte by byte from the `TWI` interrupt.
//! - [`i2c::usi::Usi`] presents the same [`i2c::Master`] surface on MCUs
//!   that only have the USI peripheral, executing each command synchronously
//!   through bit-banged SCL/SDA.
//!
//! Both engines honour the same transaction rules: consecutive commands of
//! one future are chained with repeated START conditions, transactions are
//! delimited by STOP, and bus faults are surfaced on the affected future
//! according to the configured [`i2c::ErrorPolicy`].
//!
//! Capacities are compile-time constants and no code path allocates.
//!
//! ## Example
//!
//! ```rust, no_run
//! use fastavr::devices::ds1307::Ds1307;
//! use fastavr::future::FutureStore;
//! use fastavr::i2c::{twi, Config, Master};
//!
//! # fn example(hw: impl twi::Instance + Send) -> Result<(), fastavr::i2c::ConfigError> {
//! static STORE: FutureStore<8, 16> = FutureStore::new();
//!
//! let bus = twi::Twi::<_, 16>::new(hw, &STORE, Config::default());
//! bus.enable()?;
//!
//! let rtc = Ds1307::new(&bus);
//! if let Ok(time) = rtc.read_time(&STORE) {
//!     let _ = time.seconds;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
#![doc = document_features::document_features!()]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, rust_2018_idioms)]
#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod fmt;

mod errors;

pub mod delay;
pub mod devices;
pub mod future;
pub mod i2c;

pub use errors::Error;

mod private {
    pub trait Sealed {}
}
