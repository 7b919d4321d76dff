//! # Inter-Integrated Circuit (I2C) - Master mode
//!
//! ## Overview
//!
//! Two engine implementations share the surface defined here:
//!
//! - [`twi::Twi`] for MCUs with the hardware two-wire interface
//!   (ATmega328P/2560/644/32U4): commands are queued and executed from the
//!   `TWI` interrupt, one bus operation per interrupt.
//! - [`usi::Usi`] for MCUs with only the USI peripheral (ATtiny84/85):
//!   pushing a command executes it synchronously through bit-banged
//!   SCL/SDA before returning.
//!
//! Device drivers talk to either engine through the [`Master`] trait and the
//! [`Device`] helper, so the same driver code compiles unchanged for both
//! families.
//!
//! ## Transactions
//!
//! A *transaction* is a run of consecutive [`Command`]s referencing the same
//! future. The engines join commands of one transaction with repeated START
//! conditions and delimit transactions with STOP. The driver pushes every
//! command of a transaction and then calls [`Master::commit`]; the
//! interrupt-driven engine will not start executing before that signal.
//!
//! ## Configuration
//!
//! Engines are configured with a [`Config`] value: bus [`Mode`], CPU clock
//! (bit timings and the TWI bitrate are derived from it at
//! [`Master::enable`] time), the [`ErrorPolicy`] applied on bus faults, and
//! optional [`DebugHook`] / completion callback instrumentation.

use enumset::{EnumSet, EnumSetType};
use fugit::HertzU32;

use crate::errors::Error;

mod eh;
pub mod twi;
pub mod usi;

mod device;
pub use device::Device;

/// TWI status register values for the master code paths, right-aligned as
/// read from the upper five status bits.
///
/// The bit-banged engine synthesises the same values so
/// [`Master::last_status`] is uniform across engines: an ACK value turns
/// into its NACK counterpart by adding 0x08.
pub mod status {
    /// A START condition has been transmitted.
    pub const START: u8 = 0x08;
    /// A repeated START condition has been transmitted.
    pub const REPEAT_START: u8 = 0x10;
    /// SLA+W has been transmitted and ACKed.
    pub const SLA_W_ACK: u8 = 0x18;
    /// SLA+W has been transmitted and NACKed.
    pub const SLA_W_NACK: u8 = 0x20;
    /// A data byte has been transmitted and ACKed.
    pub const DATA_SENT_ACK: u8 = 0x28;
    /// A data byte has been transmitted and NACKed.
    pub const DATA_SENT_NACK: u8 = 0x30;
    /// Bus arbitration was lost.
    pub const ARBITRATION_LOST: u8 = 0x38;
    /// SLA+R has been transmitted and ACKed.
    pub const SLA_R_ACK: u8 = 0x40;
    /// SLA+R has been transmitted and NACKed.
    pub const SLA_R_NACK: u8 = 0x48;
    /// A data byte has been received and ACKed.
    pub const DATA_RECV_ACK: u8 = 0x50;
    /// A data byte has been received and NACKed.
    pub const DATA_RECV_NACK: u8 = 0x58;
}

/// I²C bus mode, selecting the SCL frequency and the matching bus timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Standard mode, 100 kHz SCL.
    Standard,
    /// Fast mode, 400 kHz SCL.
    Fast,
}

impl Mode {
    /// The SCL frequency of this mode.
    pub const fn scl_frequency(self) -> HertzU32 {
        match self {
            Mode::Standard => HertzU32::from_raw(100_000),
            Mode::Fast => HertzU32::from_raw(400_000),
        }
    }
}

/// Rule deciding which queued commands survive a bus fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorPolicy {
    /// Discard every queued command. Futures of discarded foreign
    /// transactions are left untouched; the completion callback reports the
    /// fault.
    ClearAllCommands,
    /// Discard only the remaining commands of the faulted transaction;
    /// subsequent transactions proceed from a fresh START.
    ClearTransactionCommands,
}

/// Protocol step reported to a [`DebugHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DebugStatus {
    /// A START condition is being issued.
    Start,
    /// A repeated START condition is being issued.
    RepeatStart,
    /// SLA+W is being transmitted; the payload is the address byte.
    AddrWrite,
    /// SLA+R is being transmitted; the payload is the address byte.
    AddrRead,
    /// A data byte is being transmitted; the payload is the byte.
    Send,
    /// A data byte is being received, more will follow.
    Recv,
    /// The last data byte is being received.
    RecvLast,
    /// A STOP condition is being issued.
    Stop,
    /// The byte to transmit was pulled from the future.
    SendOk,
    /// The future had no byte left to transmit.
    SendError,
    /// The received byte was stored into the future; the payload is the
    /// byte.
    RecvOk,
    /// The future had no room for the received byte; the payload is the
    /// byte.
    RecvError,
}

/// Observer invoked at every protocol step with a [`DebugStatus`] tag and,
/// where meaningful, the byte involved.
///
/// Must be non-blocking and short: on TWI MCUs it runs from the interrupt
/// handler.
pub type DebugHook = fn(DebugStatus, u8);

/// Completion notification emitted when a command retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Callback {
    /// The command finished and more commands of the same transaction
    /// remain queued.
    EndCommand,
    /// The command finished and no further queued command belongs to its
    /// transaction.
    EndTransaction,
    /// The command faulted; its future carries the error.
    Error,
}

/// Engine configuration.
///
/// Create a default configuration with [`Config::default`], then adjust
/// individual settings with the `with_*` methods. All methods are `const`,
/// so a configuration can be built in a `static` initialiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    mode: Mode,
    cpu_clock: HertzU32,
    error_policy: ErrorPolicy,
    debug_hook: Option<DebugHook>,
    on_complete: Option<fn(Callback)>,
}

impl Config {
    /// Default configuration: standard mode, 16 MHz CPU clock,
    /// [`ErrorPolicy::ClearAllCommands`], no instrumentation.
    pub const fn new() -> Self {
        Config {
            mode: Mode::Standard,
            cpu_clock: HertzU32::from_raw(16_000_000),
            error_policy: ErrorPolicy::ClearAllCommands,
            debug_hook: None,
            on_complete: None,
        }
    }

    /// Sets the bus mode.
    pub const fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the CPU clock frequency that bit timings and the TWI bitrate
    /// are derived from.
    pub const fn with_cpu_clock(mut self, cpu_clock: HertzU32) -> Self {
        self.cpu_clock = cpu_clock;
        self
    }

    /// Sets the error policy applied on bus faults.
    pub const fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    /// Installs a per-step debug observer.
    pub const fn with_debug_hook(mut self, debug_hook: DebugHook) -> Self {
        self.debug_hook = Some(debug_hook);
        self
    }

    /// Installs a completion callback invoked when commands retire.
    ///
    /// On TWI MCUs the callback runs from the interrupt handler and must be
    /// short.
    pub const fn with_on_complete(mut self, on_complete: fn(Callback)) -> Self {
        self.on_complete = Some(on_complete);
        self
    }

    /// The configured bus mode.
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// The configured CPU clock.
    pub const fn cpu_clock(&self) -> HertzU32 {
        self.cpu_clock
    }

    /// The configured error policy.
    pub const fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    pub(crate) fn debug_hook(&self) -> Option<DebugHook> {
        self.debug_hook
    }

    pub(crate) fn on_complete(&self) -> Option<fn(Callback)> {
        self.on_complete
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// I²C-specific configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ConfigError {
    /// The CPU clock is too slow to reach the selected mode's SCL
    /// frequency.
    ClockTooSlow,
}

impl core::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::ClockTooSlow => {
                write!(f, "CPU clock too slow for the selected bus mode")
            }
        }
    }
}

/// Finishing behaviour flags of a [`Command`].
#[derive(Debug, EnumSetType)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Finish {
    /// Issue a STOP after this command even if more commands of the same
    /// transaction follow.
    ForceStop,
    /// Force the future to ready when this command completes; used for
    /// write transactions producing no output bytes.
    FinishFuture,
}

/// Direction of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Kind {
    /// Master receives from the target.
    Read,
    /// Master transmits to the target.
    Write,
}

/// One addressed bus operation, as queued by device drivers and consumed by
/// the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Command {
    kind: Kind,
    /// Target address, pre-shifted into the wire format with the R/W bit
    /// cleared.
    target: u8,
    finish: EnumSet<Finish>,
    future_id: u8,
}

impl Command {
    /// Creates a read command for the 7-bit address `address`.
    ///
    /// The future id is assigned when the command is launched through a
    /// [`Device`].
    pub fn read(address: u8, finish: EnumSet<Finish>) -> Self {
        Command {
            kind: Kind::Read,
            target: address << 1,
            finish,
            future_id: 0,
        }
    }

    /// Creates a write command for the 7-bit address `address`.
    pub fn write(address: u8, finish: EnumSet<Finish>) -> Self {
        Command {
            kind: Kind::Write,
            target: address << 1,
            finish,
            future_id: 0,
        }
    }

    /// The direction of this command.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The pre-shifted wire address (R/W bit clear).
    pub fn target(&self) -> u8 {
        self.target
    }

    /// The finishing behaviour flags.
    pub fn finish(&self) -> EnumSet<Finish> {
        self.finish
    }

    /// The future this command reports into; 0 until launched.
    pub fn future_id(&self) -> u8 {
        self.future_id
    }

    pub(crate) fn with_future(mut self, future_id: u8) -> Self {
        self.future_id = future_id;
        self
    }
}

/// Common surface of the two engines.
///
/// Device drivers hold a reference to an engine through this trait and stay
/// oblivious to whether commands execute from the TWI interrupt or inline.
pub trait Master {
    /// Configures bus pins and the peripheral and derives the bus timings
    /// from the configuration.
    fn enable(&self) -> Result<(), ConfigError>;

    /// Tears down the peripheral and releases the bus pins.
    fn disable(&self);

    /// Returns whether the engine can accept `commands` more commands.
    fn room_for(&self, commands: usize) -> bool;

    /// Queues one command.
    ///
    /// The interrupt-driven engine returns after enqueueing; the bit-banged
    /// engine executes the command to completion before returning. Errors
    /// are [`Error::NoCapacity`] when the queue is full and
    /// [`Error::Protocol`] when inline execution faulted (or an earlier
    /// fault put the engine into fail-fast mode).
    fn push(&self, command: Command) -> Result<(), Error>;

    /// Signals that every command of the current transaction has been
    /// pushed, starting the engine if it is idle.
    fn commit(&self);

    /// The last bus status observed, as a [`status`] value.
    fn last_status(&self) -> u8;

    /// Returns whether a transaction is currently in flight.
    fn is_busy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_addresses_are_pre_shifted() {
        let read = Command::read(0x68, Finish::ForceStop.into());
        assert_eq!(read.target(), 0xD0);
        assert_eq!(read.kind(), Kind::Read);
        assert!(read.finish().contains(Finish::ForceStop));
        assert!(!read.finish().contains(Finish::FinishFuture));
        assert_eq!(read.future_id(), 0);

        let write = Command::write(0x1E, EnumSet::empty());
        assert_eq!(write.target(), 0x3C);
        assert_eq!(write.kind(), Kind::Write);
    }

    #[test]
    fn config_builder_round_trip() {
        let config = Config::default()
            .with_mode(Mode::Fast)
            .with_error_policy(ErrorPolicy::ClearTransactionCommands)
            .with_cpu_clock(HertzU32::from_raw(8_000_000));
        assert_eq!(config.mode(), Mode::Fast);
        assert_eq!(config.error_policy(), ErrorPolicy::ClearTransactionCommands);
        assert_eq!(config.cpu_clock().raw(), 8_000_000);
        assert_eq!(config.mode().scl_frequency().raw(), 400_000);
    }
}
