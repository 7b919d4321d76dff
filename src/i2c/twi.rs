//! Interrupt-driven I²C master engine for MCUs with the hardware two-wire
//! interface (ATmega328P/2560/644/32U4).
//!
//! ## Overview
//!
//! Commands queued through [`Master::push`] are executed from the `TWI`
//! interrupt, one bus operation per interrupt: the handler reads the status
//! register, verifies it against the expected status for the phase in
//! flight, moves the state machine forward and programs the next operation.
//! Foreground code never blocks; results arrive through the
//! [`FutureStore`](crate::future::FutureStore) referenced by each command.
//!
//! The engine does not start executing a transaction until
//! [`Master::commit`] signals that every command of it has been pushed, so
//! the queue momentarily holding only part of a transaction never produces
//! partial bus traffic.
//!
//! ## Interrupt wiring
//!
//! The engine is built for `static` placement; the interrupt handler simply
//! forwards to [`Twi::on_interrupt`]:
//!
//! ```rust, ignore
//! use fastavr::future::FutureStore;
//! use fastavr::i2c::{twi, Config, Master};
//!
//! static STORE: FutureStore<8, 16> = FutureStore::new();
//! static BUS: twi::Twi<'_, twi::TwiPeripheral, 16> =
//!     twi::Twi::new(unsafe { twi::TwiPeripheral::steal() }, &STORE, Config::new());
//!
//! #[avr_device::interrupt(atmega328p)]
//! fn TWI() {
//!     BUS.on_interrupt();
//! }
//! ```

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Deque;

use super::{
    Callback, Command, Config, ConfigError, DebugStatus, ErrorPolicy, Finish, Kind, Master, status,
};
use crate::delay::{self, Timings};
use crate::errors::Error;
use crate::future::FutureStorage;

/// Register-level access to a TWI peripheral.
///
/// The AVR implementation is [`TwiPeripheral`]; tests substitute a scripted
/// mock. Every method maps to a single register operation, so implementors
/// carry no protocol knowledge.
pub trait Instance {
    /// Enables the peripheral: bus pullups, bitrate (prescaler one), TWI
    /// enable.
    fn setup(&mut self, bitrate: u8);
    /// Disables the peripheral and releases the bus pins.
    fn shutdown(&mut self);
    /// Reads the masked status register value.
    fn status(&mut self) -> u8;
    /// Requests a START (or repeated START) condition, interrupt enabled.
    fn start(&mut self);
    /// Loads `byte` into the data register and clocks it out, interrupt
    /// enabled.
    fn send(&mut self, byte: u8);
    /// Reads the data register.
    fn data(&mut self) -> u8;
    /// Prepares to receive one byte and acknowledge it.
    fn ack(&mut self);
    /// Prepares to receive one byte and not acknowledge it.
    fn nack(&mut self);
    /// Requests a STOP condition, interrupt disabled.
    fn stop(&mut self);
    /// Clears a pending interrupt without scheduling further bus activity.
    fn release(&mut self);
}

/// Transfer phase currently in flight on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Start,
    AddrWrite,
    AddrRead,
    Send,
    Recv,
    RecvLast,
    Stop,
}

struct Inner<H, const DEPTH: usize> {
    hw: H,
    queue: Deque<Command, DEPTH>,
    state: State,
    current: Option<Command>,
    expected: u8,
    last_status: u8,
    timings: Timings,
}

/// Asynchronous I²C master engine.
///
/// `DEPTH` is the command queue capacity. The engine owns the queue and
/// borrows the future store; all interior state is guarded for concurrent
/// access from foreground code and the `TWI` interrupt.
pub struct Twi<'a, H, const DEPTH: usize> {
    inner: Mutex<RefCell<Inner<H, DEPTH>>>,
    store: &'a dyn FutureStorage,
    config: Config,
}

impl<'a, H: Instance, const DEPTH: usize> Twi<'a, H, DEPTH> {
    /// Creates an engine over `hw`, delivering results into `store`.
    ///
    /// Usable in `static` initialisers; the peripheral stays untouched
    /// until [`Master::enable`].
    pub const fn new(hw: H, store: &'a dyn FutureStorage, config: Config) -> Self {
        Twi {
            inner: Mutex::new(RefCell::new(Inner {
                hw,
                queue: Deque::new(),
                state: State::Idle,
                current: None,
                expected: 0,
                last_status: 0,
                timings: Timings::new(config.mode(), config.cpu_clock()),
            })),
            store,
            config,
        }
    }

    /// The future store this engine delivers into.
    pub fn storage(&self) -> &'a dyn FutureStorage {
        self.store
    }

    /// Executes one step of the transfer state machine.
    ///
    /// This is the `TWI` interrupt body; it must be called exactly once per
    /// "operation complete" interrupt. Returns the completion notification
    /// when the step retired a command, after forwarding it to the
    /// configured callback.
    pub fn on_interrupt(&self) -> Option<Callback> {
        let callback = critical_section::with(|cs| {
            let inner = &mut *self.inner.borrow_ref_mut(cs);
            let command = inner.current?;
            inner.last_status = inner.hw.status();

            if !self.check_status(inner) {
                self.fault(inner);
                return Some(Callback::Error);
            }

            // a completed receive phase carries the byte in the data register
            if matches!(inner.state, State::Recv | State::RecvLast) {
                let byte = inner.hw.data();
                if self.store.produce_output(command.future_id(), byte) {
                    self.hook(DebugStatus::RecvOk, byte);
                } else {
                    self.hook(DebugStatus::RecvError, byte);
                    self.store
                        .set_error(command.future_id(), Error::ByteSequence);
                    self.fault(inner);
                    return Some(Callback::Error);
                }
            }

            inner.state = self.next_state(inner);
            match inner.state {
                // the machine never transitions back into these
                State::Idle | State::Start => None,
                State::AddrWrite => {
                    self.exec_addr_write(inner);
                    None
                }
                State::AddrRead => {
                    self.exec_addr_read(inner);
                    None
                }
                State::Send => {
                    if !self.exec_send(inner) {
                        self.fault(inner);
                        return Some(Callback::Error);
                    }
                    None
                }
                State::Recv | State::RecvLast => {
                    self.exec_receive(inner);
                    None
                }
                State::Stop => Some(self.retire(inner, command)),
            }
        });

        if let Some(callback) = callback
            && let Some(notify) = self.config.on_complete()
        {
            notify(callback);
        }
        callback
    }

    /// Retires `command`: finalises its future, decides between STOP and
    /// repeated START, and reports how the command ended.
    fn retire(&self, inner: &mut Inner<H, DEPTH>, command: Command) -> Callback {
        if command.finish().contains(Finish::FinishFuture) {
            self.store.finish(command.future_id());
        }
        let transaction_continues = inner
            .queue
            .front()
            .is_some_and(|next| next.future_id() == command.future_id());
        if inner.queue.is_empty() {
            self.exec_stop(inner, false);
        } else if command.finish().contains(Finish::ForceStop) || !transaction_continues {
            // transaction boundary (or explicit stop request): close the
            // bus, then open it again for the next queued command
            self.exec_stop(inner, false);
            self.dequeue(inner, true);
        } else {
            self.dequeue(inner, false);
        }
        if transaction_continues {
            Callback::EndCommand
        } else {
            Callback::EndTransaction
        }
    }

    /// Pops the next command and opens the bus for it, or quiesces the
    /// peripheral when the queue is empty.
    fn dequeue(&self, inner: &mut Inner<H, DEPTH>, first: bool) {
        match inner.queue.pop_front() {
            None => {
                inner.current = None;
                inner.state = State::Idle;
                inner.hw.release();
            }
            Some(command) => {
                inner.current = Some(command);
                inner.state = State::Start;
                if first {
                    self.exec_start(inner);
                } else {
                    self.exec_repeat_start(inner);
                }
            }
        }
    }

    /// Computes the phase following the one that just completed.
    fn next_state(&self, inner: &Inner<H, DEPTH>) -> State {
        let Some(command) = inner.current else {
            return State::Idle;
        };
        let id = command.future_id();
        match inner.state {
            State::Start => match command.kind() {
                Kind::Write => State::AddrWrite,
                Kind::Read => State::AddrRead,
            },
            State::AddrRead | State::Recv => {
                if self.store.output_remaining(id) > 1 {
                    State::Recv
                } else {
                    State::RecvLast
                }
            }
            State::RecvLast => State::Stop,
            State::AddrWrite | State::Send => {
                if self.store.input_remaining(id) >= 1 {
                    State::Send
                } else {
                    State::Stop
                }
            }
            State::Stop | State::Idle => State::Idle,
        }
    }

    /// Verifies the status just read against the expected one.
    ///
    /// A NACK on the last transmitted byte of a write is accepted as
    /// success: some devices deliberately NACK the final byte. Any other
    /// mismatch marks the future with a protocol error (keeping an earlier
    /// recorded error if there is one).
    fn check_status(&self, inner: &mut Inner<H, DEPTH>) -> bool {
        let Some(command) = inner.current else {
            return false;
        };
        if inner.last_status == inner.expected {
            return true;
        }
        if inner.expected == status::DATA_SENT_ACK
            && inner.last_status == status::DATA_SENT_NACK
            && self.store.input_remaining(command.future_id()) == 0
        {
            return true;
        }
        self.store.set_error(command.future_id(), Error::Protocol);
        false
    }

    /// Applies the error policy, closes the bus and moves on to whatever
    /// commands survived.
    fn fault(&self, inner: &mut Inner<H, DEPTH>) {
        warn!("i2c fault: status {} expected {}", inner.last_status, inner.expected);
        if let Some(command) = inner.current {
            match self.config.error_policy() {
                ErrorPolicy::ClearAllCommands => while inner.queue.pop_front().is_some() {},
                ErrorPolicy::ClearTransactionCommands => {
                    while inner
                        .queue
                        .front()
                        .is_some_and(|next| next.future_id() == command.future_id())
                    {
                        inner.queue.pop_front();
                    }
                }
            }
        }
        self.exec_stop(inner, true);
        self.dequeue(inner, true);
    }

    fn exec_start(&self, inner: &mut Inner<H, DEPTH>) {
        self.hook(DebugStatus::Start, 0);
        inner.expected = status::START;
        inner.hw.start();
    }

    fn exec_repeat_start(&self, inner: &mut Inner<H, DEPTH>) {
        self.hook(DebugStatus::RepeatStart, 0);
        inner.expected = status::REPEAT_START;
        inner.hw.start();
    }

    fn exec_addr_write(&self, inner: &mut Inner<H, DEPTH>) {
        let Some(command) = inner.current else {
            return;
        };
        self.hook(DebugStatus::AddrWrite, command.target());
        inner.expected = status::SLA_W_ACK;
        inner.hw.send(command.target());
    }

    fn exec_addr_read(&self, inner: &mut Inner<H, DEPTH>) {
        let Some(command) = inner.current else {
            return;
        };
        self.hook(DebugStatus::AddrRead, command.target() | 0x01);
        inner.expected = status::SLA_R_ACK;
        inner.hw.send(command.target() | 0x01);
    }

    /// Pulls the next staged byte from the future and clocks it out.
    /// Returns `false` on byte-stream under-run.
    fn exec_send(&self, inner: &mut Inner<H, DEPTH>) -> bool {
        let Some(command) = inner.current else {
            return false;
        };
        match self.store.consume_input(command.future_id()) {
            Some(byte) => {
                self.hook(DebugStatus::Send, byte);
                self.hook(DebugStatus::SendOk, 0);
                inner.expected = status::DATA_SENT_ACK;
                inner.hw.send(byte);
                true
            }
            None => {
                self.hook(DebugStatus::Send, 0);
                self.hook(DebugStatus::SendError, 0);
                self.store
                    .set_error(command.future_id(), Error::ByteSequence);
                false
            }
        }
    }

    /// Arms reception of the next byte, acknowledging unless it is the last
    /// one wanted.
    fn exec_receive(&self, inner: &mut Inner<H, DEPTH>) {
        if inner.state == State::RecvLast {
            self.hook(DebugStatus::RecvLast, 0);
            inner.expected = status::DATA_RECV_NACK;
            inner.hw.nack();
        } else {
            self.hook(DebugStatus::Recv, 0);
            inner.expected = status::DATA_RECV_ACK;
            inner.hw.ack();
        }
    }

    /// Issues a STOP and observes the bus-free time before the engine may
    /// START again.
    fn exec_stop(&self, inner: &mut Inner<H, DEPTH>, error: bool) {
        self.hook(DebugStatus::Stop, 0);
        inner.hw.stop();
        if !error {
            inner.expected = 0;
        }
        inner.current = None;
        inner.state = State::Idle;
        delay::loop3(inner.timings.stop_hold);
    }

    fn hook(&self, status: DebugStatus, data: u8) {
        if let Some(hook) = self.config.debug_hook() {
            hook(status, data);
        }
    }
}

impl<H: Instance, const DEPTH: usize> Master for Twi<'_, H, DEPTH> {
    fn enable(&self) -> Result<(), ConfigError> {
        let bitrate = delay::twi_bitrate(self.config.mode(), self.config.cpu_clock())
            .ok_or(ConfigError::ClockTooSlow)?;
        critical_section::with(|cs| {
            self.inner.borrow_ref_mut(cs).hw.setup(bitrate);
        });
        debug!("twi enabled, bitrate {}", bitrate);
        Ok(())
    }

    fn disable(&self) {
        critical_section::with(|cs| {
            let inner = &mut *self.inner.borrow_ref_mut(cs);
            inner.hw.shutdown();
            while inner.queue.pop_front().is_some() {}
            inner.current = None;
            inner.state = State::Idle;
            inner.expected = 0;
        });
        debug!("twi disabled");
    }

    fn room_for(&self, commands: usize) -> bool {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.queue.capacity() - inner.queue.len() >= commands
        })
    }

    fn push(&self, command: Command) -> Result<(), Error> {
        critical_section::with(|cs| {
            self.inner
                .borrow_ref_mut(cs)
                .queue
                .push_back(command)
                .map_err(|_| Error::NoCapacity)
        })
    }

    fn commit(&self) {
        critical_section::with(|cs| {
            let inner = &mut *self.inner.borrow_ref_mut(cs);
            if inner.current.is_none() && !inner.queue.is_empty() {
                self.dequeue(inner, true);
            }
        });
    }

    fn last_status(&self) -> u8 {
        critical_section::with(|cs| self.inner.borrow_ref(cs).last_status)
    }

    fn is_busy(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).current.is_some())
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(
        target_arch = "avr",
        any(
            feature = "atmega328p",
            feature = "atmega2560",
            feature = "atmega644",
            feature = "atmega32u4",
        )
    ))] {
        cfg_if::cfg_if! {
            if #[cfg(feature = "atmega328p")] {
                use avr_device::atmega328p as pac;
                // PC4 = SDA, PC5 = SCL
                const SCL_SDA_MASK: u8 = 0x30;
                fn pullups(enable: bool) {
                    let port = unsafe { &*pac::PORTC::ptr() };
                    port.portc().modify(|r, w| unsafe {
                        w.bits(if enable { r.bits() | SCL_SDA_MASK } else { r.bits() & !SCL_SDA_MASK })
                    });
                }
            } else if #[cfg(feature = "atmega2560")] {
                use avr_device::atmega2560 as pac;
                // PD0 = SCL, PD1 = SDA
                const SCL_SDA_MASK: u8 = 0x03;
                fn pullups(enable: bool) {
                    let port = unsafe { &*pac::PORTD::ptr() };
                    port.portd().modify(|r, w| unsafe {
                        w.bits(if enable { r.bits() | SCL_SDA_MASK } else { r.bits() & !SCL_SDA_MASK })
                    });
                }
            } else if #[cfg(feature = "atmega644")] {
                use avr_device::atmega644 as pac;
                // PC0 = SCL, PC1 = SDA
                const SCL_SDA_MASK: u8 = 0x03;
                fn pullups(enable: bool) {
                    let port = unsafe { &*pac::PORTC::ptr() };
                    port.portc().modify(|r, w| unsafe {
                        w.bits(if enable { r.bits() | SCL_SDA_MASK } else { r.bits() & !SCL_SDA_MASK })
                    });
                }
            } else {
                use avr_device::atmega32u4 as pac;
                // PD0 = SCL, PD1 = SDA
                const SCL_SDA_MASK: u8 = 0x03;
                fn pullups(enable: bool) {
                    let port = unsafe { &*pac::PORTD::ptr() };
                    port.portd().modify(|r, w| unsafe {
                        w.bits(if enable { r.bits() | SCL_SDA_MASK } else { r.bits() & !SCL_SDA_MASK })
                    });
                }
            }
        }

        /// The on-chip TWI peripheral of the selected device.
        pub struct TwiPeripheral {
            _marker: (),
        }

        impl TwiPeripheral {
            /// Creates the driver handle, consuming the PAC singleton.
            pub fn new(twi: pac::TWI) -> Self {
                let _ = twi;
                TwiPeripheral { _marker: () }
            }

            /// Creates the driver handle without consuming the PAC
            /// singleton.
            ///
            /// # Safety
            ///
            /// The caller must guarantee nothing else drives the TWI
            /// peripheral.
            pub const unsafe fn steal() -> Self {
                TwiPeripheral { _marker: () }
            }

            fn regs() -> &'static pac::twi::RegisterBlock {
                unsafe { &*pac::TWI::ptr() }
            }
        }

        impl Instance for TwiPeripheral {
            fn setup(&mut self, bitrate: u8) {
                pullups(true);
                let twi = Self::regs();
                twi.twbr().write(|w| unsafe { w.bits(bitrate) });
                // prescaler one
                twi.twsr().write(|w| unsafe { w.bits(0) });
                twi.twcr().write(|w| w.twen().set_bit());
            }

            fn shutdown(&mut self) {
                Self::regs().twcr().write(|w| unsafe { w.bits(0) });
                pullups(false);
            }

            fn status(&mut self) -> u8 {
                Self::regs().twsr().read().bits() & 0xF8
            }

            fn start(&mut self) {
                Self::regs().twcr().write(|w| {
                    w.twint().set_bit();
                    w.twsta().set_bit();
                    w.twen().set_bit();
                    w.twie().set_bit()
                });
            }

            fn send(&mut self, byte: u8) {
                let twi = Self::regs();
                twi.twdr().write(|w| unsafe { w.bits(byte) });
                twi.twcr().write(|w| {
                    w.twint().set_bit();
                    w.twen().set_bit();
                    w.twie().set_bit()
                });
            }

            fn data(&mut self) -> u8 {
                Self::regs().twdr().read().bits()
            }

            fn ack(&mut self) {
                Self::regs().twcr().write(|w| {
                    w.twint().set_bit();
                    w.twea().set_bit();
                    w.twen().set_bit();
                    w.twie().set_bit()
                });
            }

            fn nack(&mut self) {
                Self::regs().twcr().write(|w| {
                    w.twint().set_bit();
                    w.twen().set_bit();
                    w.twie().set_bit()
                });
            }

            fn stop(&mut self) {
                Self::regs().twcr().write(|w| {
                    w.twint().set_bit();
                    w.twsto().set_bit();
                    w.twen().set_bit()
                });
            }

            fn release(&mut self) {
                Self::regs().twcr().write(|w| w.twint().set_bit());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::vec::Vec;

    use enumset::EnumSet;

    use super::*;
    use crate::future::{Future, FutureStatus, FutureStore};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum BusOp {
        Setup(u8),
        Shutdown,
        Start,
        Send(u8),
        Ack,
        Nack,
        Stop,
        Release,
    }

    /// Scripted TWI peripheral: returns the queued status values in order
    /// and records every bus operation.
    #[derive(Default)]
    pub(crate) struct MockTwi {
        pub statuses: VecDeque<u8>,
        pub rx: VecDeque<u8>,
        pub ops: Vec<BusOp>,
    }

    impl MockTwi {
        pub fn scripted(statuses: &[u8], rx: &[u8]) -> Self {
            MockTwi {
                statuses: statuses.iter().copied().collect(),
                rx: rx.iter().copied().collect(),
                ops: Vec::new(),
            }
        }
    }

    impl Instance for MockTwi {
        fn setup(&mut self, bitrate: u8) {
            self.ops.push(BusOp::Setup(bitrate));
        }
        fn shutdown(&mut self) {
            self.ops.push(BusOp::Shutdown);
        }
        fn status(&mut self) -> u8 {
            self.statuses.pop_front().unwrap_or(0)
        }
        fn start(&mut self) {
            self.ops.push(BusOp::Start);
        }
        fn send(&mut self, byte: u8) {
            self.ops.push(BusOp::Send(byte));
        }
        fn data(&mut self) -> u8 {
            self.rx.pop_front().unwrap_or(0xFF)
        }
        fn ack(&mut self) {
            self.ops.push(BusOp::Ack);
        }
        fn nack(&mut self) {
            self.ops.push(BusOp::Nack);
        }
        fn stop(&mut self) {
            self.ops.push(BusOp::Stop);
        }
        fn release(&mut self) {
            self.ops.push(BusOp::Release);
        }
    }

    pub(crate) fn run<const DEPTH: usize>(bus: &Twi<'_, MockTwi, DEPTH>) {
        let mut steps = 0;
        while bus.is_busy() {
            bus.on_interrupt();
            steps += 1;
            assert!(steps < 100, "engine did not go idle");
        }
    }

    pub(crate) fn ops<const DEPTH: usize>(bus: &Twi<'_, MockTwi, DEPTH>) -> Vec<BusOp> {
        critical_section::with(|cs| bus.inner.borrow_ref(cs).hw.ops.clone())
    }

    // status scripts for a write of `n` bytes and a read, as the hardware
    // would report them on a fully acknowledged transfer
    pub(crate) fn write_statuses(n: usize, first: bool) -> Vec<u8> {
        let mut s = std::vec![if first { status::START } else { status::REPEAT_START }];
        s.push(status::SLA_W_ACK);
        s.extend(std::iter::repeat_n(status::DATA_SENT_ACK, n));
        s
    }

    pub(crate) fn read_statuses(n: usize, first: bool) -> Vec<u8> {
        let mut s = std::vec![if first { status::START } else { status::REPEAT_START }];
        s.push(status::SLA_R_ACK);
        s.extend(std::iter::repeat_n(status::DATA_RECV_ACK, n.saturating_sub(1)));
        s.push(status::DATA_RECV_NACK);
        s
    }

    #[test]
    fn push_without_commit_does_not_start() {
        let store: FutureStore<4, 8> = FutureStore::new();
        let bus: Twi<'_, MockTwi, 8> = Twi::new(MockTwi::default(), &store, Config::default());
        let future: Future<'_, (), u8> = Future::new(&store, 0).unwrap();

        bus.push(Command::write(0x68, EnumSet::empty()).with_future(future.id()))
            .unwrap();
        assert!(!bus.is_busy());
        assert!(ops(&bus).is_empty());

        bus.commit();
        assert!(bus.is_busy());
        assert_eq!(ops(&bus), std::vec![BusOp::Start]);
    }

    #[test]
    fn write_then_read_transaction() {
        // register-pointer write followed by a one-byte read, the classic
        // RTC register access
        let store: FutureStore<4, 8> = FutureStore::new();
        let mut statuses = write_statuses(1, true);
        statuses.extend(read_statuses(1, false));
        let bus: Twi<'_, MockTwi, 8> =
            Twi::new(MockTwi::scripted(&statuses, &[0x37]), &store, Config::default());

        let future: Future<'_, u8, u8> = Future::new(&store, 0x00).unwrap();
        bus.push(Command::write(0x68, EnumSet::empty()).with_future(future.id()))
            .unwrap();
        bus.push(Command::read(0x68, Finish::ForceStop.into()).with_future(future.id()))
            .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(
            ops(&bus),
            std::vec![
                BusOp::Start,
                BusOp::Send(0xD0),
                BusOp::Send(0x00),
                // repeated START joins the commands of the transaction
                BusOp::Start,
                BusOp::Send(0xD1),
                BusOp::Nack,
                BusOp::Stop,
            ]
        );
        assert_eq!(future.status(), FutureStatus::Ready);
        assert_eq!(future.get(), Some(0x37));
        assert_eq!(bus.last_status(), status::DATA_RECV_NACK);
    }

    #[test]
    fn zero_length_write_skips_the_data_phase() {
        let store: FutureStore<4, 8> = FutureStore::new();
        let statuses = write_statuses(0, true);
        let bus: Twi<'_, MockTwi, 8> =
            Twi::new(MockTwi::scripted(&statuses, &[]), &store, Config::default());

        let future: Future<'_, (), ()> = Future::new(&store, ()).unwrap();
        bus.push(
            Command::write(0x68, Finish::ForceStop | Finish::FinishFuture)
                .with_future(future.id()),
        )
        .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(
            ops(&bus),
            std::vec![BusOp::Start, BusOp::Send(0xD0), BusOp::Stop]
        );
        assert_eq!(future.status(), FutureStatus::Ready);
    }

    #[test]
    fn void_write_finishes_future() {
        // set-seconds shape: two payload bytes, void result
        let store: FutureStore<4, 8> = FutureStore::new();
        let statuses = write_statuses(2, true);
        let bus: Twi<'_, MockTwi, 8> =
            Twi::new(MockTwi::scripted(&statuses, &[]), &store, Config::default());

        let future: Future<'_, (), [u8; 2]> = Future::new(&store, [0x00, 0x00]).unwrap();
        bus.push(
            Command::write(0x68, Finish::ForceStop | Finish::FinishFuture)
                .with_future(future.id()),
        )
        .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(
            ops(&bus),
            std::vec![
                BusOp::Start,
                BusOp::Send(0xD0),
                BusOp::Send(0x00),
                BusOp::Send(0x00),
                BusOp::Stop,
            ]
        );
        assert_eq!(future.wait(), FutureStatus::Ready);
        assert_eq!(future.get(), Some(()));
    }

    #[test]
    fn read_acks_all_but_the_last_byte() {
        // six-field sensor read: five ACKs, one final NACK
        let store: FutureStore<4, 8> = FutureStore::new();
        let mut statuses = write_statuses(1, true);
        statuses.extend(read_statuses(6, false));
        let rx = [1, 2, 3, 4, 5, 6];
        let bus: Twi<'_, MockTwi, 8> =
            Twi::new(MockTwi::scripted(&statuses, &rx), &store, Config::default());

        let future: Future<'_, [u8; 6], u8> = Future::new(&store, 0x03).unwrap();
        bus.push(Command::write(0x1E, EnumSet::empty()).with_future(future.id()))
            .unwrap();
        bus.push(Command::read(0x1E, Finish::ForceStop.into()).with_future(future.id()))
            .unwrap();
        bus.commit();
        run(&bus);

        let ops = ops(&bus);
        let acks = ops.iter().filter(|op| **op == BusOp::Ack).count();
        let nacks = ops.iter().filter(|op| **op == BusOp::Nack).count();
        assert_eq!((acks, nacks), (5, 1));
        // bytes land in receive order
        assert_eq!(future.get(), Some([1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn nack_on_last_written_byte_is_success() {
        let store: FutureStore<4, 8> = FutureStore::new();
        let statuses = [
            status::START,
            status::SLA_W_ACK,
            status::DATA_SENT_ACK,
            // the device NACKs the final byte; tolerated
            status::DATA_SENT_NACK,
        ];
        let bus: Twi<'_, MockTwi, 8> =
            Twi::new(MockTwi::scripted(&statuses, &[]), &store, Config::default());

        let future: Future<'_, (), [u8; 2]> = Future::new(&store, [1, 2]).unwrap();
        bus.push(
            Command::write(0x50, Finish::ForceStop | Finish::FinishFuture)
                .with_future(future.id()),
        )
        .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(future.status(), FutureStatus::Ready);
        assert_eq!(future.error(), None);
    }

    #[test]
    fn nack_on_earlier_written_byte_is_a_fault() {
        let store: FutureStore<4, 8> = FutureStore::new();
        let statuses = [
            status::START,
            status::SLA_W_ACK,
            // NACK with one byte still to go
            status::DATA_SENT_NACK,
        ];
        let bus: Twi<'_, MockTwi, 8> =
            Twi::new(MockTwi::scripted(&statuses, &[]), &store, Config::default());

        let future: Future<'_, (), [u8; 2]> = Future::new(&store, [1, 2]).unwrap();
        bus.push(
            Command::write(0x50, Finish::ForceStop | Finish::FinishFuture)
                .with_future(future.id()),
        )
        .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(future.status(), FutureStatus::Error);
        assert_eq!(future.error(), Some(Error::Protocol));
        assert_eq!(*ops(&bus).last().unwrap(), BusOp::Release);
    }

    #[test]
    fn adjacent_transactions_get_stop_then_fresh_start() {
        // two single-command transactions queued back to back, neither
        // faulting and the first without a force-stop: the engine must
        // still close the first with a STOP and open the second with a
        // fresh START, never a repeated START
        let store: FutureStore<4, 8> = FutureStore::new();
        let mut statuses = write_statuses(1, true);
        statuses.extend(write_statuses(1, true));
        let bus: Twi<'_, MockTwi, 8> =
            Twi::new(MockTwi::scripted(&statuses, &[]), &store, Config::default());

        let a: Future<'_, (), u8> = Future::new(&store, 0x11).unwrap();
        let b: Future<'_, (), u8> = Future::new(&store, 0x22).unwrap();
        bus.push(Command::write(0x68, Finish::FinishFuture.into()).with_future(a.id()))
            .unwrap();
        bus.push(
            Command::write(0x20, Finish::ForceStop | Finish::FinishFuture).with_future(b.id()),
        )
        .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(
            ops(&bus),
            std::vec![
                BusOp::Start,
                BusOp::Send(0xD0),
                BusOp::Send(0x11),
                // transaction boundary: STOP, then a fresh START for B
                BusOp::Stop,
                BusOp::Start,
                BusOp::Send(0x40),
                BusOp::Send(0x22),
                BusOp::Stop,
            ]
        );
        assert_eq!(a.status(), FutureStatus::Ready);
        assert_eq!(b.status(), FutureStatus::Ready);
        assert!(!bus.is_busy());
    }

    #[test]
    fn address_nack_clear_transaction_lets_next_transaction_run() {
        let store: FutureStore<4, 8> = FutureStore::new();
        let config = Config::default().with_error_policy(ErrorPolicy::ClearTransactionCommands);
        // A: START then SLA+W NACKed; B: full one-byte write
        let mut statuses = std::vec![status::START, status::SLA_W_NACK];
        statuses.extend(write_statuses(1, true));
        let bus: Twi<'_, MockTwi, 8> = Twi::new(MockTwi::scripted(&statuses, &[]), &store, config);

        let a: Future<'_, u8, u8> = Future::new(&store, 0x00).unwrap();
        let b: Future<'_, (), u8> = Future::new(&store, 0x55).unwrap();
        bus.push(Command::write(0x68, EnumSet::empty()).with_future(a.id()))
            .unwrap();
        bus.push(Command::read(0x68, Finish::ForceStop.into()).with_future(a.id()))
            .unwrap();
        bus.push(
            Command::write(0x20, Finish::ForceStop | Finish::FinishFuture).with_future(b.id()),
        )
        .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(a.status(), FutureStatus::Error);
        assert_eq!(a.error(), Some(Error::Protocol));
        assert_eq!(b.status(), FutureStatus::Ready);
        assert_eq!(
            ops(&bus),
            std::vec![
                BusOp::Start,
                BusOp::Send(0xD0),
                BusOp::Stop,
                // B starts over from a fresh START
                BusOp::Start,
                BusOp::Send(0x40),
                BusOp::Send(0x55),
                BusOp::Stop,
            ]
        );
        assert!(!bus.is_busy());
    }

    #[test]
    fn address_nack_clear_all_discards_foreign_commands() {
        let store: FutureStore<4, 8> = FutureStore::new();
        let statuses = [status::START, status::SLA_W_NACK];
        let bus: Twi<'_, MockTwi, 8> = Twi::new(
            MockTwi::scripted(&statuses, &[]),
            &store,
            Config::default().with_error_policy(ErrorPolicy::ClearAllCommands),
        );

        let a: Future<'_, (), u8> = Future::new(&store, 0x00).unwrap();
        let b: Future<'_, (), u8> = Future::new(&store, 0x55).unwrap();
        bus.push(
            Command::write(0x68, Finish::ForceStop | Finish::FinishFuture).with_future(a.id()),
        )
        .unwrap();
        bus.push(
            Command::write(0x20, Finish::ForceStop | Finish::FinishFuture).with_future(b.id()),
        )
        .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(a.status(), FutureStatus::Error);
        // B's commands were discarded without running; its future is simply
        // never finished
        assert_eq!(b.status(), FutureStatus::NotReady);
        assert!(!bus.is_busy());
        assert!(bus.room_for(8));
        assert_eq!(
            ops(&bus),
            std::vec![BusOp::Start, BusOp::Send(0xD0), BusOp::Stop, BusOp::Release]
        );
    }

    #[test]
    fn queue_capacity_is_enforced_and_recovered() {
        let store: FutureStore<4, 8> = FutureStore::new();
        let bus: Twi<'_, MockTwi, 2> = Twi::new(MockTwi::default(), &store, Config::default());
        let future: Future<'_, (), u8> = Future::new(&store, 0).unwrap();

        assert!(bus.room_for(2));
        let command = Command::write(0x68, EnumSet::empty()).with_future(future.id());
        bus.push(command).unwrap();
        bus.push(command).unwrap();
        assert!(!bus.room_for(1));
        assert_eq!(bus.push(command), Err(Error::NoCapacity));

        // already queued commands still execute: the first consumes the
        // staged byte, the second is an address-only write
        critical_section::with(|cs| {
            let inner = &mut *bus.inner.borrow_ref_mut(cs);
            inner.hw.statuses = write_statuses(1, true).into_iter().collect();
            inner.hw.statuses.extend(write_statuses(0, false));
        });
        bus.commit();
        run(&bus);
        assert!(bus.room_for(2));
    }

    static RECORDED: std::sync::Mutex<Vec<Callback>> = std::sync::Mutex::new(Vec::new());

    fn record(callback: Callback) {
        RECORDED.lock().unwrap().push(callback);
    }

    #[test]
    fn one_callback_per_retired_command() {
        RECORDED.lock().unwrap().clear();
        let store: FutureStore<4, 8> = FutureStore::new();
        let mut statuses = write_statuses(1, true);
        statuses.extend(read_statuses(1, false));
        let bus: Twi<'_, MockTwi, 8> = Twi::new(
            MockTwi::scripted(&statuses, &[0x00]),
            &store,
            Config::default().with_on_complete(record),
        );

        let future: Future<'_, u8, u8> = Future::new(&store, 0x00).unwrap();
        bus.push(Command::write(0x68, EnumSet::empty()).with_future(future.id()))
            .unwrap();
        bus.push(Command::read(0x68, Finish::ForceStop.into()).with_future(future.id()))
            .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(
            *RECORDED.lock().unwrap(),
            std::vec![Callback::EndCommand, Callback::EndTransaction]
        );
    }

    static TRACED: std::sync::Mutex<Vec<(DebugStatus, u8)>> = std::sync::Mutex::new(Vec::new());

    fn trace_step(status: DebugStatus, data: u8) {
        TRACED.lock().unwrap().push((status, data));
    }

    #[test]
    fn debug_hook_sees_every_step() {
        TRACED.lock().unwrap().clear();
        let store: FutureStore<4, 8> = FutureStore::new();
        let statuses = write_statuses(1, true);
        let bus: Twi<'_, MockTwi, 8> = Twi::new(
            MockTwi::scripted(&statuses, &[]),
            &store,
            Config::default().with_debug_hook(trace_step),
        );

        let future: Future<'_, (), u8> = Future::new(&store, 0xAB).unwrap();
        bus.push(
            Command::write(0x68, Finish::ForceStop | Finish::FinishFuture)
                .with_future(future.id()),
        )
        .unwrap();
        bus.commit();
        run(&bus);

        assert_eq!(
            *TRACED.lock().unwrap(),
            std::vec![
                (DebugStatus::Start, 0),
                (DebugStatus::AddrWrite, 0xD0),
                (DebugStatus::Send, 0xAB),
                (DebugStatus::SendOk, 0),
                (DebugStatus::Stop, 0),
            ]
        );
    }

    #[test]
    fn enable_validates_the_clock() {
        let store: FutureStore<1, 4> = FutureStore::new();
        let bus: Twi<'_, MockTwi, 2> = Twi::new(
            MockTwi::default(),
            &store,
            Config::default()
                .with_mode(super::super::Mode::Fast)
                .with_cpu_clock(fugit::HertzU32::from_raw(1_000_000)),
        );
        assert_eq!(bus.enable(), Err(ConfigError::ClockTooSlow));

        let bus: Twi<'_, MockTwi, 2> = Twi::new(MockTwi::default(), &store, Config::default());
        bus.enable().unwrap();
        assert_eq!(ops(&bus), std::vec![BusOp::Setup(72)]);
        bus.disable();
        assert_eq!(ops(&bus).last(), Some(&BusOp::Shutdown));
    }
}
