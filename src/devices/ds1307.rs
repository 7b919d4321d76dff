//! # DS1307 real-time clock
//!
//! Battery-backed RTC with 56 bytes of general-purpose RAM and a square
//! wave output pin, addressed at `0x68`.
//!
//! Clock registers hold BCD values; the futures returned by this driver
//! decode them on [`GetTimeFuture::get`], so consumers only ever see binary
//! fields. Every operation follows the same shape: allocate the matching
//! future from a store, launch it, then poll or wait.
//!
//! ```rust, no_run
//! use fastavr::devices::ds1307::{Ds1307, GetTimeFuture};
//! use fastavr::future::{FutureStatus, FutureStore};
//! # fn example<M: fastavr::i2c::Master>(bus: &M) -> Result<(), fastavr::Error> {
//! static STORE: FutureStore<8, 16> = FutureStore::new();
//!
//! let rtc = Ds1307::new(bus);
//! let time = GetTimeFuture::new(&STORE)?;
//! rtc.get_time(&time)?;
//! // ... do other work ...
//! if time.wait() == FutureStatus::Ready {
//!     let now = time.get().unwrap();
//!     let _ = (now.hours, now.minutes, now.seconds);
//! }
//! # Ok(())
//! # }
//! ```

use bytemuck::{Pod, Zeroable};
use enumset::EnumSet;

use crate::errors::Error;
use crate::future::{Future, FutureStatus, FutureStorage};
use crate::i2c::{Device, Finish, Master};

const ADDRESS: u8 = 0x68;
const TIME_ADDRESS: u8 = 0x00;
const CONTROL_ADDRESS: u8 = 0x07;
const RAM_START: u8 = 0x08;
const RAM_END: u8 = 0x40;
const CLOCK_HALT: u8 = 0x80;
const SQUARE_WAVE_ENABLE: u8 = 0x10;
const OUTPUT_LEVEL: u8 = 0x80;

/// Usable general-purpose RAM size, in bytes.
pub const RAM_SIZE: u8 = RAM_END - RAM_START;

/// Calendar time, in binary (the driver converts from and to the device's
/// BCD representation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Time {
    /// Seconds after the minute, `0..=59`.
    pub seconds: u8,
    /// Minutes after the hour, `0..=59`.
    pub minutes: u8,
    /// Hours since midnight, `0..=23`.
    pub hours: u8,
    /// Day of the week, `1..=7`; the device only requires it to be
    /// incremented consistently.
    pub weekday: u8,
    /// Day of the month, `1..=31`.
    pub day: u8,
    /// Month, `1..=12`.
    pub month: u8,
    /// Years since 2000, `0..=99`.
    pub year: u8,
}

/// Square wave output frequency selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SquareWaveFrequency {
    /// 1 Hz.
    Hz1 = 0x00,
    /// 4.096 kHz.
    Hz4096 = 0x01,
    /// 8.192 kHz.
    Hz8192 = 0x02,
    /// 32.768 kHz.
    Hz32768 = 0x03,
}

fn bcd_to_binary(bcd: u8) -> u8 {
    (bcd >> 4) * 10 + (bcd & 0x0F)
}

fn binary_to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

impl Time {
    fn from_bcd(raw: Time) -> Time {
        Time {
            seconds: bcd_to_binary(raw.seconds),
            minutes: bcd_to_binary(raw.minutes),
            hours: bcd_to_binary(raw.hours),
            weekday: raw.weekday,
            day: bcd_to_binary(raw.day),
            month: bcd_to_binary(raw.month),
            year: bcd_to_binary(raw.year),
        }
    }

    fn to_bcd(self) -> Time {
        Time {
            seconds: binary_to_bcd(self.seconds),
            minutes: binary_to_bcd(self.minutes),
            hours: binary_to_bcd(self.hours),
            weekday: self.weekday,
            day: binary_to_bcd(self.day),
            month: binary_to_bcd(self.month),
            year: binary_to_bcd(self.year),
        }
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct TimePayload {
    address: u8,
    time: Time,
}

macro_rules! delegate_future {
    ($future:ty) => {
        impl $future {
            /// The slot id referenced by this future's commands.
            pub fn id(&self) -> u8 {
                self.0.id()
            }

            /// Current status.
            pub fn status(&self) -> FutureStatus {
                self.0.status()
            }

            /// Busy-polls until the status is terminal and returns it.
            pub fn wait(&self) -> FutureStatus {
                self.0.wait()
            }

            /// Error recorded on the future, if the transaction failed.
            pub fn error(&self) -> Option<Error> {
                self.0.error()
            }
        }
    };
}

/// Future resolving to the current [`Time`].
pub struct GetTimeFuture<'a>(Future<'a, Time, u8>);

impl<'a> GetTimeFuture<'a> {
    /// Allocates the future.
    pub fn new(store: &'a dyn FutureStorage) -> Result<Self, Error> {
        Ok(GetTimeFuture(Future::new(store, TIME_ADDRESS)?))
    }

    /// The decoded time of a ready future.
    pub fn get(&self) -> Option<Time> {
        self.0.get().map(Time::from_bcd)
    }
}
delegate_future!(GetTimeFuture<'_>);

/// Void future carrying a [`Time`] to store into the clock registers.
pub struct SetTimeFuture<'a>(Future<'a, (), TimePayload>);

impl<'a> SetTimeFuture<'a> {
    /// Allocates the future, encoding `time` for the device.
    pub fn new(store: &'a dyn FutureStorage, time: &Time) -> Result<Self, Error> {
        let payload = TimePayload {
            address: TIME_ADDRESS,
            time: time.to_bcd(),
        };
        Ok(SetTimeFuture(Future::new(store, payload)?))
    }
}
delegate_future!(SetTimeFuture<'_>);

/// Future resolving to one RAM byte.
pub struct GetRamFuture<'a>(Future<'a, u8, u8>);

impl<'a> GetRamFuture<'a> {
    /// Allocates the future for RAM offset `address` (`0..RAM_SIZE`).
    pub fn new(store: &'a dyn FutureStorage, address: u8) -> Result<Self, Error> {
        if address >= RAM_SIZE {
            return Err(Error::InvalidInput);
        }
        Ok(GetRamFuture(Future::new(store, RAM_START + address)?))
    }

    /// The byte read from RAM, once ready.
    pub fn get(&self) -> Option<u8> {
        self.0.get()
    }
}
delegate_future!(GetRamFuture<'_>);

/// Future resolving to a block of RAM bytes.
pub struct GetRamBlockFuture<'a, const N: usize>(Future<'a, [u8; N], u8>);

impl<'a, const N: usize> GetRamBlockFuture<'a, N> {
    /// Allocates the future for `N` bytes starting at RAM offset
    /// `address`.
    pub fn new(store: &'a dyn FutureStorage, address: u8) -> Result<Self, Error> {
        if address as usize + N > RAM_SIZE as usize {
            return Err(Error::InvalidInput);
        }
        Ok(GetRamBlockFuture(Future::new(store, RAM_START + address)?))
    }

    /// The bytes read from RAM, once ready.
    pub fn get(&self) -> Option<[u8; N]> {
        self.0.get()
    }
}

impl<const N: usize> GetRamBlockFuture<'_, N> {
    /// The slot id referenced by this future's commands.
    pub fn id(&self) -> u8 {
        self.0.id()
    }

    /// Current status.
    pub fn status(&self) -> FutureStatus {
        self.0.status()
    }

    /// Busy-polls until the status is terminal and returns it.
    pub fn wait(&self) -> FutureStatus {
        self.0.wait()
    }

    /// Error recorded on the future, if the transaction failed.
    pub fn error(&self) -> Option<Error> {
        self.0.error()
    }
}

/// Void future writing one RAM byte.
pub struct SetRamFuture<'a>(Future<'a, (), [u8; 2]>);

impl<'a> SetRamFuture<'a> {
    /// Allocates the future writing `value` at RAM offset `address`.
    pub fn new(store: &'a dyn FutureStorage, address: u8, value: u8) -> Result<Self, Error> {
        if address >= RAM_SIZE {
            return Err(Error::InvalidInput);
        }
        Ok(SetRamFuture(Future::new(
            store,
            [RAM_START + address, value],
        )?))
    }
}
delegate_future!(SetRamFuture<'_>);

/// Void future writing a block of RAM bytes.
pub struct SetRamBlockFuture<'a>(Future<'a, (), u8>);

impl<'a> SetRamBlockFuture<'a> {
    /// Allocates the future writing `data` starting at RAM offset
    /// `address`.
    pub fn new(store: &'a dyn FutureStorage, address: u8, data: &[u8]) -> Result<Self, Error> {
        if address as usize + data.len() > RAM_SIZE as usize {
            return Err(Error::InvalidInput);
        }
        let future = Future::new(store, RAM_START + address)?;
        if !store.stage_input(future.id(), data) {
            return Err(Error::InvalidInput);
        }
        Ok(SetRamBlockFuture(future))
    }
}
delegate_future!(SetRamBlockFuture<'_>);

/// Void future halting the clock oscillator.
pub struct HaltClockFuture<'a>(Future<'a, (), [u8; 2]>);

impl<'a> HaltClockFuture<'a> {
    /// Allocates the future.
    pub fn new(store: &'a dyn FutureStorage) -> Result<Self, Error> {
        Ok(HaltClockFuture(Future::new(
            store,
            [TIME_ADDRESS, CLOCK_HALT],
        )?))
    }
}
delegate_future!(HaltClockFuture<'_>);

/// Void future configuring the square wave / output pin control register.
pub struct ControlFuture<'a>(Future<'a, (), [u8; 2]>);

impl<'a> ControlFuture<'a> {
    fn new(store: &'a dyn FutureStorage, control: u8) -> Result<Self, Error> {
        Ok(ControlFuture(Future::new(
            store,
            [CONTROL_ADDRESS, control],
        )?))
    }

    /// Future enabling the square wave output at `frequency`.
    pub fn enable_output(
        store: &'a dyn FutureStorage,
        frequency: SquareWaveFrequency,
    ) -> Result<Self, Error> {
        Self::new(store, SQUARE_WAVE_ENABLE | frequency as u8)
    }

    /// Future disabling the square wave output, driving the pin to
    /// `level`.
    pub fn disable_output(store: &'a dyn FutureStorage, level: bool) -> Result<Self, Error> {
        Self::new(store, if level { OUTPUT_LEVEL } else { 0 })
    }
}
delegate_future!(ControlFuture<'_>);

/// DS1307 driver.
#[derive(Debug)]
pub struct Ds1307<'a, M: Master> {
    device: Device<'a, M>,
}

impl<'a, M: Master> Ds1307<'a, M> {
    /// Creates the driver on `bus`.
    pub fn new(bus: &'a M) -> Self {
        Ds1307 {
            device: Device::new(bus, ADDRESS),
        }
    }

    /// Launches a clock read into `future`.
    pub fn get_time(&self, future: &GetTimeFuture<'_>) -> Result<(), Error> {
        self.device.launch(
            future.id(),
            &[
                self.device.write(EnumSet::empty()),
                self.device.read(Finish::ForceStop.into()),
            ],
        )
    }

    /// Launches a clock write from `future`.
    pub fn set_time(&self, future: &SetTimeFuture<'_>) -> Result<(), Error> {
        self.device.launch(
            future.id(),
            &[self.device.write(Finish::ForceStop | Finish::FinishFuture)],
        )
    }

    /// Launches a one-byte RAM read into `future`.
    pub fn get_ram(&self, future: &GetRamFuture<'_>) -> Result<(), Error> {
        self.device.launch(
            future.id(),
            &[
                self.device.write(EnumSet::empty()),
                self.device.read(Finish::ForceStop.into()),
            ],
        )
    }

    /// Launches a RAM block read into `future`.
    pub fn get_ram_block<const N: usize>(
        &self,
        future: &GetRamBlockFuture<'_, N>,
    ) -> Result<(), Error> {
        self.device.launch(
            future.id(),
            &[
                self.device.write(EnumSet::empty()),
                self.device.read(Finish::ForceStop.into()),
            ],
        )
    }

    /// Launches a one-byte RAM write from `future`.
    pub fn set_ram(&self, future: &SetRamFuture<'_>) -> Result<(), Error> {
        self.device.launch(
            future.id(),
            &[self.device.write(Finish::ForceStop | Finish::FinishFuture)],
        )
    }

    /// Launches a RAM block write from `future`.
    pub fn set_ram_block(&self, future: &SetRamBlockFuture<'_>) -> Result<(), Error> {
        self.device.launch(
            future.id(),
            &[self.device.write(Finish::ForceStop | Finish::FinishFuture)],
        )
    }

    /// Launches a clock halt from `future`.
    pub fn halt_clock(&self, future: &HaltClockFuture<'_>) -> Result<(), Error> {
        self.device.launch(
            future.id(),
            &[self.device.write(Finish::ForceStop | Finish::FinishFuture)],
        )
    }

    /// Launches a control register update from `future` (see
    /// [`ControlFuture::enable_output`] and
    /// [`ControlFuture::disable_output`]).
    pub fn set_control(&self, future: &ControlFuture<'_>) -> Result<(), Error> {
        self.device.launch(
            future.id(),
            &[self.device.write(Finish::ForceStop | Finish::FinishFuture)],
        )
    }

    /// Reads the current time, blocking until the transaction resolves.
    pub fn read_time(&self, store: &dyn FutureStorage) -> Result<Time, Error> {
        let future = GetTimeFuture::new(store)?;
        self.get_time(&future)?;
        match future.wait() {
            FutureStatus::Ready => future.get().ok_or(Error::Protocol),
            _ => Err(future.error().unwrap_or(Error::Protocol)),
        }
    }

    /// Writes the time, blocking until the transaction resolves.
    pub fn write_time(&self, store: &dyn FutureStorage, time: &Time) -> Result<(), Error> {
        let future = SetTimeFuture::new(store, time)?;
        self.set_time(&future)?;
        match future.wait() {
            FutureStatus::Ready => Ok(()),
            _ => Err(future.error().unwrap_or(Error::Protocol)),
        }
    }

    /// Reads one RAM byte, blocking until the transaction resolves.
    pub fn read_ram(&self, store: &dyn FutureStorage, address: u8) -> Result<u8, Error> {
        let future = GetRamFuture::new(store, address)?;
        self.get_ram(&future)?;
        match future.wait() {
            FutureStatus::Ready => future.get().ok_or(Error::Protocol),
            _ => Err(future.error().unwrap_or(Error::Protocol)),
        }
    }

    /// Writes one RAM byte, blocking until the transaction resolves.
    pub fn write_ram(&self, store: &dyn FutureStorage, address: u8, value: u8) -> Result<(), Error> {
        let future = SetRamFuture::new(store, address, value)?;
        self.set_ram(&future)?;
        match future.wait() {
            FutureStatus::Ready => Ok(()),
            _ => Err(future.error().unwrap_or(Error::Protocol)),
        }
    }
}
