//! Synchronous I²C master engine for MCUs with only the USI peripheral
//! (ATtiny84/85).
//!
//! ## Overview
//!
//! These devices have no TWI hardware, so the engine drives SCL/SDA through
//! the USI shift register with software-generated clock strobes. The public
//! surface is the same [`Master`] trait as the interrupt-driven engine, but
//! [`Master::push`] executes the whole command, START through optional
//! STOP, before returning, and [`Master::commit`] issues the transaction's
//! closing STOP if the bus was left open for a repeated START.
//!
//! Futures therefore resolve by the time `push` returns; waiting on them is
//! free. Device drivers written against [`Master`] compile unchanged.
//!
//! ## Faults
//!
//! On a fault the engine STOPs the bus, marks the future, and fails every
//! further push fast until [`Master::commit`] acknowledges the end of the
//! transaction.

use core::cell::RefCell;

use critical_section::Mutex;

use super::{Callback, Command, Config, ConfigError, DebugStatus, Kind, Finish, Master, status};
use crate::delay::{self, Timings};
use crate::errors::Error;
use crate::future::FutureStorage;

/// Shift-frame length for one USI transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Eight data bits.
    Byte,
    /// A single (N)ACK bit.
    Bit,
}

/// Pin- and shift-register-level access to a USI peripheral.
///
/// The AVR implementation is [`UsiPeripheral`]; tests substitute a mock that
/// plays the slave side. SCL/SDA are open-drain: "high" releases the line,
/// and [`Instance::scl_high`] must wait out clock stretching before
/// returning.
pub trait Instance {
    /// Puts the pins and the USI into two-wire master mode.
    fn setup(&mut self);
    /// Disables the USI and releases the pins.
    fn shutdown(&mut self);
    /// Releases SDA.
    fn sda_high(&mut self);
    /// Drives SDA low.
    fn sda_low(&mut self);
    /// Releases SCL and waits for it to actually rise.
    fn scl_high(&mut self);
    /// Drives SCL low.
    fn scl_low(&mut self);
    /// Turns SDA into an input for reading data or sampling an ACK.
    fn sda_input(&mut self);
    /// Turns SDA back into an output.
    fn sda_output(&mut self);
    /// Loads the shift register.
    fn load(&mut self, byte: u8);
    /// Clocks one frame through the shift register and returns the bits
    /// sampled from the bus. Leaves SCL low and SDA as an output.
    fn transfer(&mut self, frame: Frame, timings: &Timings) -> u8;
}

struct Inner<H> {
    hw: H,
    timings: Timings,
    last: Option<Command>,
    expected: u8,
    last_status: u8,
    started: bool,
    fail_fast: bool,
}

/// Synchronous bit-banged I²C master engine.
///
/// Commands execute inline on [`Master::push`]; there is no command queue
/// and no interrupt involvement.
pub struct Usi<'a, H> {
    inner: Mutex<RefCell<Inner<H>>>,
    store: &'a dyn FutureStorage,
    config: Config,
}

impl<'a, H: Instance> Usi<'a, H> {
    /// Creates an engine over `hw`, delivering results into `store`.
    pub const fn new(hw: H, store: &'a dyn FutureStorage, config: Config) -> Self {
        Usi {
            inner: Mutex::new(RefCell::new(Inner {
                hw,
                timings: Timings::new(config.mode(), config.cpu_clock()),
                last: None,
                expected: 0,
                last_status: 0,
                started: false,
                fail_fast: false,
            })),
            store,
            config,
        }
    }

    /// The future store this engine delivers into.
    pub fn storage(&self) -> &'a dyn FutureStorage {
        self.store
    }

    /// Runs `f` with the engine state borrowed inside a critical section.
    ///
    /// Each protocol step takes its own short section so interrupts stay
    /// enabled between bus phases of a long transfer.
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<H>) -> R) -> R {
        critical_section::with(|cs| f(&mut *self.inner.borrow_ref_mut(cs)))
    }

    fn hook(&self, status: DebugStatus, data: u8) {
        if let Some(hook) = self.config.debug_hook() {
            hook(status, data);
        }
    }

    fn notify(&self, callback: Callback) {
        if let Some(notify) = self.config.on_complete() {
            notify(callback);
        }
    }

    fn exec_start(&self, repeat: bool) {
        self.hook(
            if repeat {
                DebugStatus::RepeatStart
            } else {
                DebugStatus::Start
            },
            0,
        );
        self.with_inner(|inner| {
            inner.expected = if repeat {
                status::REPEAT_START
            } else {
                status::START
            };
            inner.hw.scl_high();
            delay::loop3(inner.timings.su_sta);
            inner.hw.sda_low();
            delay::loop3(inner.timings.hd_sta);
            inner.hw.scl_low();
            inner.hw.sda_high();
            // the USI cannot observe a failed START the way TWI status does
            inner.last_status = inner.expected;
            inner.started = true;
        });
    }

    fn exec_stop(&self, error: bool) {
        self.hook(DebugStatus::Stop, 0);
        self.with_inner(|inner| {
            inner.hw.sda_low();
            inner.hw.scl_high();
            delay::loop3(inner.timings.su_sto);
            inner.hw.sda_high();
            delay::loop3(inner.timings.buf);
            if !error {
                inner.expected = 0;
            }
            inner.started = false;
            delay::loop3(inner.timings.stop_hold);
        });
    }

    /// Clocks one byte out and samples the ACK bit, synthesising the
    /// matching TWI status value.
    fn send_byte(&self, byte: u8) {
        self.with_inner(|inner| {
            inner.hw.scl_low();
            inner.hw.load(byte);
            inner.hw.transfer(Frame::Byte, &inner.timings);
            inner.hw.sda_input();
            let acked = inner.hw.transfer(Frame::Bit, &inner.timings) & 0x01 == 0;
            // a NACK status is its ACK counterpart plus 0x08
            inner.last_status = inner.expected + if acked { 0 } else { 0x08 };
        });
    }

    fn exec_addr_write(&self, command: Command) {
        self.hook(DebugStatus::AddrWrite, command.target());
        self.with_inner(|inner| inner.expected = status::SLA_W_ACK);
        self.send_byte(command.target());
    }

    fn exec_addr_read(&self, command: Command) {
        self.hook(DebugStatus::AddrRead, command.target() | 0x01);
        self.with_inner(|inner| inner.expected = status::SLA_R_ACK);
        self.send_byte(command.target() | 0x01);
    }

    fn exec_send(&self, command: Command) -> Result<(), Error> {
        match self.store.consume_input(command.future_id()) {
            Some(byte) => {
                self.hook(DebugStatus::Send, byte);
                self.hook(DebugStatus::SendOk, 0);
                self.with_inner(|inner| inner.expected = status::DATA_SENT_ACK);
                self.send_byte(byte);
                Ok(())
            }
            None => {
                self.hook(DebugStatus::Send, 0);
                self.hook(DebugStatus::SendError, 0);
                self.store
                    .set_error(command.future_id(), Error::ByteSequence);
                self.fail();
                Err(Error::ByteSequence)
            }
        }
    }

    fn exec_receive(&self, command: Command) -> Result<(), Error> {
        let id = command.future_id();
        let last_byte = self.store.output_remaining(id) == 1;
        self.hook(
            if last_byte {
                DebugStatus::RecvLast
            } else {
                DebugStatus::Recv
            },
            0,
        );
        let byte = self.with_inner(|inner| {
            inner.expected = if last_byte {
                status::DATA_RECV_NACK
            } else {
                status::DATA_RECV_ACK
            };
            inner.hw.sda_input();
            let byte = inner.hw.transfer(Frame::Byte, &inner.timings);
            // master ACKs every byte but the last one it wants
            inner.hw.load(if last_byte { 0xFF } else { 0x00 });
            inner.hw.transfer(Frame::Bit, &inner.timings);
            inner.last_status = inner.expected;
            byte
        });
        if self.store.produce_output(id, byte) {
            self.hook(DebugStatus::RecvOk, byte);
            Ok(())
        } else {
            self.hook(DebugStatus::RecvError, byte);
            self.store.set_error(id, Error::ByteSequence);
            self.fail();
            Err(Error::ByteSequence)
        }
    }

    /// Verifies the synthesised status of the step that just ran.
    fn step_ok(&self, command: Command) -> Result<(), Error> {
        let ok = self.with_inner(|inner| {
            inner.last_status == inner.expected
                || (inner.expected == status::DATA_SENT_ACK
                    && inner.last_status == status::DATA_SENT_NACK
                    && self.store.input_remaining(command.future_id()) == 0)
        });
        if ok {
            return Ok(());
        }
        self.store.set_error(command.future_id(), Error::Protocol);
        self.fail();
        Err(Error::Protocol)
    }

    /// Closes the bus after a fault and fails further pushes fast until the
    /// transaction is committed.
    fn fail(&self) {
        warn!("i2c fault, fail-fast until commit");
        self.with_inner(|inner| inner.fail_fast = true);
        self.exec_stop(true);
        self.notify(Callback::Error);
    }
}

impl<H: Instance> Master for Usi<'_, H> {
    fn enable(&self) -> Result<(), ConfigError> {
        self.with_inner(|inner| inner.hw.setup());
        debug!("usi enabled");
        Ok(())
    }

    fn disable(&self) {
        self.with_inner(|inner| {
            inner.hw.shutdown();
            inner.last = None;
            inner.expected = 0;
            inner.started = false;
            inner.fail_fast = false;
        });
        debug!("usi disabled");
    }

    fn room_for(&self, _commands: usize) -> bool {
        // commands are never queued, they execute inline
        true
    }

    fn push(&self, command: Command) -> Result<(), Error> {
        enum Open {
            Fresh,
            Repeat,
            CloseThenFresh,
        }
        let open = self.with_inner(|inner| {
            if inner.fail_fast {
                return Err(Error::Protocol);
            }
            Ok(if !inner.started {
                Open::Fresh
            } else if inner
                .last
                .is_some_and(|last| last.future_id() != command.future_id())
            {
                Open::CloseThenFresh
            } else {
                Open::Repeat
            })
        })?;

        match open {
            Open::Fresh => self.exec_start(false),
            Open::Repeat => self.exec_start(true),
            Open::CloseThenFresh => {
                // a push for another future ends the open transaction
                self.exec_stop(false);
                self.exec_start(false);
            }
        }
        self.with_inner(|inner| inner.last = Some(command));
        self.step_ok(command)?;

        match command.kind() {
            Kind::Write => {
                self.exec_addr_write(command);
                self.step_ok(command)?;
                while self.store.input_remaining(command.future_id()) > 0 {
                    self.exec_send(command)?;
                    self.step_ok(command)?;
                }
            }
            Kind::Read => {
                self.exec_addr_read(command);
                self.step_ok(command)?;
                while self.store.output_remaining(command.future_id()) > 0 {
                    self.exec_receive(command)?;
                }
            }
        }

        if command.finish().contains(Finish::FinishFuture) {
            self.store.finish(command.future_id());
        }
        if command.finish().contains(Finish::ForceStop) {
            self.exec_stop(false);
        }
        Ok(())
    }

    fn commit(&self) {
        let (executed, failed) = self.with_inner(|inner| {
            let executed = inner.last.take().is_some();
            let failed = inner.fail_fast;
            inner.fail_fast = false;
            (executed, failed)
        });
        // a command without force-stop leaves the bus open for a repeated
        // START; the end of the transaction closes it
        let open = self.with_inner(|inner| inner.started);
        if open {
            self.exec_stop(false);
        }
        if executed && !failed {
            self.notify(Callback::EndTransaction);
        }
    }

    fn last_status(&self) -> u8 {
        self.with_inner(|inner| inner.last_status)
    }

    fn is_busy(&self) -> bool {
        self.with_inner(|inner| inner.started || inner.last.is_some())
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "avr", any(feature = "attiny84", feature = "attiny85")))] {
        cfg_if::cfg_if! {
            if #[cfg(feature = "attiny84")] {
                use avr_device::attiny84 as pac;
                // PA6 = SDA, PA4 = SCL
                const SDA: u8 = 1 << 6;
                const SCL: u8 = 1 << 4;
                fn port_modify(f: impl Fn(u8) -> u8) {
                    let port = unsafe { &*pac::PORTA::ptr() };
                    port.porta().modify(|r, w| unsafe { w.bits(f(r.bits())) });
                }
                fn ddr_modify(f: impl Fn(u8) -> u8) {
                    let port = unsafe { &*pac::PORTA::ptr() };
                    port.ddra().modify(|r, w| unsafe { w.bits(f(r.bits())) });
                }
                fn pin_read() -> u8 {
                    let port = unsafe { &*pac::PORTA::ptr() };
                    port.pina().read().bits()
                }
            } else {
                use avr_device::attiny85 as pac;
                // PB0 = SDA, PB2 = SCL
                const SDA: u8 = 1 << 0;
                const SCL: u8 = 1 << 2;
                fn port_modify(f: impl Fn(u8) -> u8) {
                    let port = unsafe { &*pac::PORTB::ptr() };
                    port.portb().modify(|r, w| unsafe { w.bits(f(r.bits())) });
                }
                fn ddr_modify(f: impl Fn(u8) -> u8) {
                    let port = unsafe { &*pac::PORTB::ptr() };
                    port.ddrb().modify(|r, w| unsafe { w.bits(f(r.bits())) });
                }
                fn pin_read() -> u8 {
                    let port = unsafe { &*pac::PORTB::ptr() };
                    port.pinb().read().bits()
                }
            }
        }

        // USICR: two-wire mode, software clock strobe; USITC toggles SCL
        const USICR_BASE: u8 = 0x2A;
        const USICR_TICK: u8 = 0x2B;
        // USISR: clear all interrupt flags, counter zeroed (16 edges)
        const USISR_BYTE: u8 = 0xF0;
        // counter at 0x0E: two edges, one (N)ACK bit
        const USISR_BIT: u8 = 0xFE;
        const USIOIF: u8 = 1 << 6;

        /// The on-chip USI peripheral of the selected device, in two-wire
        /// master mode.
        pub struct UsiPeripheral {
            _marker: (),
        }

        impl UsiPeripheral {
            /// Creates the driver handle, consuming the PAC singleton.
            pub fn new(usi: pac::USI) -> Self {
                let _ = usi;
                UsiPeripheral { _marker: () }
            }

            /// Creates the driver handle without consuming the PAC
            /// singleton.
            ///
            /// # Safety
            ///
            /// The caller must guarantee nothing else drives the USI
            /// peripheral or its pins.
            pub const unsafe fn steal() -> Self {
                UsiPeripheral { _marker: () }
            }

            fn regs() -> &'static pac::usi::RegisterBlock {
                unsafe { &*pac::USI::ptr() }
            }
        }

        impl Instance for UsiPeripheral {
            fn setup(&mut self) {
                self.sda_high();
                port_modify(|bits| bits | SCL);
                ddr_modify(|bits| bits | SDA | SCL);
                let usi = Self::regs();
                usi.usidr().write(|w| unsafe { w.bits(0xFF) });
                usi.usicr().write(|w| unsafe { w.bits(USICR_BASE) });
                usi.usisr().write(|w| unsafe { w.bits(USISR_BYTE) });
            }

            fn shutdown(&mut self) {
                Self::regs().usicr().write(|w| unsafe { w.bits(0) });
                self.sda_input();
            }

            fn sda_high(&mut self) {
                port_modify(|bits| bits | SDA);
            }

            fn sda_low(&mut self) {
                port_modify(|bits| bits & !SDA);
            }

            fn scl_high(&mut self) {
                port_modify(|bits| bits | SCL);
                while pin_read() & SCL == 0 {}
            }

            fn scl_low(&mut self) {
                port_modify(|bits| bits & !SCL);
            }

            fn sda_input(&mut self) {
                ddr_modify(|bits| bits & !SDA);
            }

            fn sda_output(&mut self) {
                ddr_modify(|bits| bits | SDA);
            }

            fn load(&mut self, byte: u8) {
                Self::regs().usidr().write(|w| unsafe { w.bits(byte) });
            }

            fn transfer(&mut self, frame: Frame, timings: &Timings) -> u8 {
                let usi = Self::regs();
                let init = match frame {
                    Frame::Byte => USISR_BYTE,
                    Frame::Bit => USISR_BIT,
                };
                usi.usisr().write(|w| unsafe { w.bits(init) });
                loop {
                    delay::loop3(timings.low);
                    // SCL rising edge
                    usi.usicr().write(|w| unsafe { w.bits(USICR_TICK) });
                    while pin_read() & SCL == 0 {}
                    delay::loop3(timings.high);
                    // SCL falling edge
                    usi.usicr().write(|w| unsafe { w.bits(USICR_TICK) });
                    if usi.usisr().read().bits() & USIOIF != 0 {
                        break;
                    }
                }
                delay::loop3(timings.low);
                let data = usi.usidr().read().bits();
                usi.usidr().write(|w| unsafe { w.bits(0xFF) });
                self.sda_output();
                data
            }
        }
    }
}
