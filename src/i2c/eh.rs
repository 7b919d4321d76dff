//! [`embedded_hal::i2c::I2c`] implementations for both engines.
//!
//! Each operation of a transaction maps to one queued [`Command`] over a
//! scratch future sized for the transaction's combined read length, so
//! embedded-hal consumers get the standard repeated-START chaining and a
//! single STOP without touching the future API themselves.

use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation, SevenBitAddress};
use enumset::EnumSet;

use super::{Command, Finish, Master, twi, usi};
use crate::errors::Error;
use crate::future::{FutureStatus, FutureStorage};

impl embedded_hal::i2c::Error for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Protocol => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
            _ => ErrorKind::Other,
        }
    }
}

/// Releases the scratch slot on every exit path.
struct SlotGuard<'a> {
    store: &'a dyn FutureStorage,
    id: u8,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.store.release(self.id);
    }
}

fn run_transaction<M: Master>(
    bus: &M,
    store: &dyn FutureStorage,
    address: SevenBitAddress,
    operations: &mut [Operation<'_>],
) -> Result<(), Error> {
    if operations.is_empty() {
        return Ok(());
    }
    let mut total_read = 0;
    for operation in operations.iter() {
        if let Operation::Read(buffer) = operation {
            // a zero-length read would still clock one byte off the bus
            if buffer.is_empty() {
                return Err(Error::InvalidInput);
            }
            total_read += buffer.len();
        }
    }

    let guard = SlotGuard {
        store,
        id: store.register(&[], total_read)?,
    };
    for operation in operations.iter() {
        if let Operation::Write(bytes) = operation
            && !store.stage_input(guard.id, bytes)
        {
            return Err(Error::InvalidInput);
        }
    }

    if !bus.room_for(operations.len()) {
        return Err(Error::NoCapacity);
    }
    let last = operations.len() - 1;
    let mut pushed = Ok(());
    for (index, operation) in operations.iter().enumerate() {
        let mut finish = EnumSet::empty();
        if index == last {
            finish |= Finish::ForceStop;
            if total_read == 0 {
                finish |= Finish::FinishFuture;
            }
        }
        let command = match operation {
            Operation::Write(_) => Command::write(address, finish),
            Operation::Read(_) => Command::read(address, finish),
        };
        if let Err(error) = bus.push(command.with_future(guard.id)) {
            pushed = Err(error);
            break;
        }
    }
    bus.commit();
    pushed?;

    // on TWI devices the interrupt drives the transaction to completion
    // while we spin; on USI devices it already completed inline
    loop {
        match store.status(guard.id) {
            FutureStatus::NotReady => core::hint::spin_loop(),
            FutureStatus::Ready => break,
            _ => return Err(store.error(guard.id).unwrap_or(Error::Protocol)),
        }
    }

    let mut offset = 0;
    for operation in operations.iter_mut() {
        if let Operation::Read(buffer) = operation {
            if !store.read_output(guard.id, offset, buffer) {
                return Err(Error::ByteSequence);
            }
            offset += buffer.len();
        }
    }
    Ok(())
}

impl<H: twi::Instance, const DEPTH: usize> ErrorType for twi::Twi<'_, H, DEPTH> {
    type Error = Error;
}

impl<H: twi::Instance, const DEPTH: usize> embedded_hal::i2c::I2c for twi::Twi<'_, H, DEPTH> {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        run_transaction(&*self, self.storage(), address, operations)
    }
}

impl<H: usi::Instance> ErrorType for usi::Usi<'_, H> {
    type Error = Error;
}

impl<H: usi::Instance> embedded_hal::i2c::I2c for usi::Usi<'_, H> {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        run_transaction(&*self, self.storage(), address, operations)
    }
}
