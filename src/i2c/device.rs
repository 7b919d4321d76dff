//! Base helper for I²C device drivers.

use enumset::EnumSet;

use super::{Command, Finish, Master};
use crate::errors::Error;

/// One target device on the bus.
///
/// Wraps an engine reference and the device's 7-bit address, and launches
/// whole transactions: every command is stamped with the future id, pushed,
/// and the transaction is committed, so the engine never observes a
/// half-pushed transaction.
///
/// Device drivers embed a `Device` and express each operation as a future
/// allocation followed by [`launch`](Device::launch); see
/// [`Ds1307`](crate::devices::ds1307::Ds1307) for the canonical shape.
#[derive(Debug)]
pub struct Device<'a, M: Master> {
    bus: &'a M,
    address: u8,
}

impl<'a, M: Master> Device<'a, M> {
    /// Creates a handle for the device with the given 7-bit address.
    pub fn new(bus: &'a M, address: u8) -> Self {
        Device { bus, address }
    }

    /// The underlying engine.
    pub fn bus(&self) -> &'a M {
        self.bus
    }

    /// A read command addressed to this device.
    pub fn read(&self, finish: EnumSet<Finish>) -> Command {
        Command::read(self.address, finish)
    }

    /// A write command addressed to this device.
    pub fn write(&self, finish: EnumSet<Finish>) -> Command {
        Command::write(self.address, finish)
    }

    /// Launches one transaction on behalf of the future with id
    /// `future_id`: checks queue room, pushes every command stamped with the
    /// id, and commits.
    ///
    /// Fails with [`Error::InvalidInput`] for an empty command list or an
    /// invalid id and [`Error::NoCapacity`] when the queue cannot take the
    /// whole transaction. A push failure aborts the remaining pushes but
    /// still commits, so the engine can retire what was queued.
    pub fn launch(&self, future_id: u8, commands: &[Command]) -> Result<(), Error> {
        if commands.is_empty() || future_id == 0 {
            return Err(Error::InvalidInput);
        }
        if !self.bus.room_for(commands.len()) {
            return Err(Error::NoCapacity);
        }
        let mut result = Ok(());
        for command in commands {
            if let Err(error) = self.bus.push(command.with_future(future_id)) {
                result = Err(error);
                break;
            }
        }
        self.bus.commit();
        result
    }
}
