//! Fixed-capacity future store and typed future handles.
//!
//! A [`FutureStore`] owns a pool of result slots. Device drivers allocate a
//! slot by constructing a [`Future`], stage the bytes the transaction will
//! transmit, and queue commands referencing the slot id with one of the I²C
//! engines. The engine consumes staged input bytes during write phases,
//! produces received bytes during read phases, and finalises the slot
//! status; the driver polls or waits on the handle and reads the typed
//! result back.
//!
//! Slot ids start at 1; id 0 is reserved and never refers to a live slot.
//! All slot state is interior-mutable so a store can live in a `static` and
//! be shared between foreground code and the TWI interrupt: the status word
//! is a single atomic, everything else is guarded by critical sections.

use core::cell::RefCell;
use core::marker::PhantomData;

use bytemuck::Pod;
use critical_section::Mutex;
use portable_atomic::{AtomicU8, Ordering};

use crate::errors::Error;

/// Status of one future.
///
/// The status of a slot only ever moves forward along
/// `Invalid → NotReady → {Ready, Error}`; the terminal states are stable
/// until the handle is dropped and the slot reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FutureStatus {
    /// The slot is not allocated.
    Invalid,
    /// The transaction has not completed yet.
    NotReady,
    /// The result is available.
    Ready,
    /// The transaction failed; see the recorded error.
    Error,
}

const STATUS_INVALID: u8 = 0;
const STATUS_NOT_READY: u8 = 1;
const STATUS_READY: u8 = 2;
const STATUS_ERROR: u8 = 3;

fn decode_status(raw: u8) -> FutureStatus {
    match raw {
        STATUS_NOT_READY => FutureStatus::NotReady,
        STATUS_READY => FutureStatus::Ready,
        STATUS_ERROR => FutureStatus::Error,
        _ => FutureStatus::Invalid,
    }
}

/// Id-indexed access to the slots of a [`FutureStore`].
///
/// This is the surface the engines and the [`Future`] handles work against;
/// it erases the store's capacity parameters. All methods tolerate stale or
/// out-of-range ids by reporting failure instead of panicking.
pub trait FutureStorage: crate::private::Sealed + Sync {
    /// Allocates a slot, copying `input` into its transmit buffer and
    /// declaring `output_len` expected receive bytes.
    ///
    /// Returns the non-zero slot id, [`Error::NoCapacity`] when the pool is
    /// exhausted, or [`Error::InvalidInput`] when either buffer does not fit
    /// a slot.
    fn register(&self, input: &[u8], output_len: usize) -> Result<u8, Error>;

    /// Returns a slot to the pool.
    ///
    /// Must not be called while any queued command still references `id`.
    fn release(&self, id: u8);

    /// Current status of the slot.
    fn status(&self, id: u8) -> FutureStatus;

    /// Error recorded on the slot, if any.
    fn error(&self, id: u8) -> Option<Error>;

    /// Number of slots currently free.
    fn free_slots(&self) -> usize;

    /// Number of staged input bytes not yet consumed.
    fn input_remaining(&self, id: u8) -> usize;

    /// Number of declared output bytes not yet produced.
    fn output_remaining(&self, id: u8) -> usize;

    /// Appends bytes to the slot's transmit buffer.
    ///
    /// Only valid before the transaction starts consuming; fails when the
    /// bytes do not fit or the slot is already finalised.
    fn stage_input(&self, id: u8, bytes: &[u8]) -> bool;

    /// Pops the next staged input byte, in FIFO order.
    ///
    /// `None` indicates the engine requested a byte when none remained,
    /// which callers report as a byte-sequence error on the future.
    fn consume_input(&self, id: u8) -> Option<u8>;

    /// Appends one received byte to the slot's output buffer.
    ///
    /// When the last declared byte is produced the slot becomes
    /// [`FutureStatus::Ready`]. Returns `false` when the engine pushes
    /// beyond the declared size or the slot is already finalised.
    fn produce_output(&self, id: u8, byte: u8) -> bool;

    /// Records `error` on the slot and makes it [`FutureStatus::Error`].
    ///
    /// The first recorded error wins; later calls on an already failed slot
    /// are ignored.
    fn set_error(&self, id: u8, error: Error);

    /// Forces the slot to [`FutureStatus::Ready`].
    ///
    /// Used for transactions with no output bytes (void results). No-op on
    /// a slot that already failed.
    fn finish(&self, id: u8);

    /// Copies produced output bytes starting at `offset` into `out`.
    ///
    /// Only succeeds on a [`FutureStatus::Ready`] slot holding at least
    /// `offset + out.len()` bytes.
    fn read_output(&self, id: u8, offset: usize, out: &mut [u8]) -> bool;
}

struct SlotInner<const BUF: usize> {
    input: [u8; BUF],
    input_len: u8,
    input_pos: u8,
    output: [u8; BUF],
    output_len: u8,
    output_pos: u8,
    error: Option<Error>,
}

impl<const BUF: usize> SlotInner<BUF> {
    const fn new() -> Self {
        SlotInner {
            input: [0; BUF],
            input_len: 0,
            input_pos: 0,
            output: [0; BUF],
            output_len: 0,
            output_pos: 0,
            error: None,
        }
    }
}

struct Slot<const BUF: usize> {
    status: AtomicU8,
    inner: Mutex<RefCell<SlotInner<BUF>>>,
}

impl<const BUF: usize> Slot<BUF> {
    const fn new() -> Self {
        Slot {
            status: AtomicU8::new(STATUS_INVALID),
            inner: Mutex::new(RefCell::new(SlotInner::new())),
        }
    }
}

/// Fixed-capacity pool of future slots.
///
/// `SLOTS` is the number of concurrently live futures, `BUF` the maximum
/// byte size of a slot's transmit and receive buffers. Both are compile-time
/// constants; registration fails with [`Error::NoCapacity`] once the pool is
/// full and never allocates.
pub struct FutureStore<const SLOTS: usize, const BUF: usize> {
    slots: [Slot<BUF>; SLOTS],
}

impl<const SLOTS: usize, const BUF: usize> FutureStore<SLOTS, BUF> {
    /// Creates an empty store. Usable in `static` initialisers.
    pub const fn new() -> Self {
        assert!(SLOTS >= 1 && SLOTS <= 255, "slot ids are 8-bit");
        assert!(BUF <= 255, "buffer cursors are 8-bit");
        FutureStore {
            slots: [const { Slot::new() }; SLOTS],
        }
    }

    fn slot(&self, id: u8) -> Option<&Slot<BUF>> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize - 1)
    }
}

impl<const SLOTS: usize, const BUF: usize> Default for FutureStore<SLOTS, BUF> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SLOTS: usize, const BUF: usize> crate::private::Sealed for FutureStore<SLOTS, BUF> {}

impl<const SLOTS: usize, const BUF: usize> FutureStorage for FutureStore<SLOTS, BUF> {
    fn register(&self, input: &[u8], output_len: usize) -> Result<u8, Error> {
        if input.len() > BUF || output_len > BUF {
            return Err(Error::InvalidInput);
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .status
                .compare_exchange(
                    STATUS_INVALID,
                    STATUS_NOT_READY,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            critical_section::with(|cs| {
                let inner = &mut *slot.inner.borrow_ref_mut(cs);
                inner.input[..input.len()].copy_from_slice(input);
                inner.input_len = input.len() as u8;
                inner.input_pos = 0;
                inner.output_len = output_len as u8;
                inner.output_pos = 0;
                inner.error = None;
            });
            return Ok(index as u8 + 1);
        }
        trace!("future store exhausted");
        Err(Error::NoCapacity)
    }

    fn release(&self, id: u8) {
        if let Some(slot) = self.slot(id) {
            slot.status.store(STATUS_INVALID, Ordering::Release);
        }
    }

    fn status(&self, id: u8) -> FutureStatus {
        match self.slot(id) {
            Some(slot) => decode_status(slot.status.load(Ordering::Acquire)),
            None => FutureStatus::Invalid,
        }
    }

    fn error(&self, id: u8) -> Option<Error> {
        let slot = self.slot(id)?;
        critical_section::with(|cs| slot.inner.borrow_ref(cs).error)
    }

    fn free_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.status.load(Ordering::Acquire) == STATUS_INVALID)
            .count()
    }

    fn input_remaining(&self, id: u8) -> usize {
        match self.slot(id) {
            Some(slot) => critical_section::with(|cs| {
                let inner = slot.inner.borrow_ref(cs);
                (inner.input_len - inner.input_pos) as usize
            }),
            None => 0,
        }
    }

    fn output_remaining(&self, id: u8) -> usize {
        match self.slot(id) {
            Some(slot) => critical_section::with(|cs| {
                let inner = slot.inner.borrow_ref(cs);
                (inner.output_len - inner.output_pos) as usize
            }),
            None => 0,
        }
    }

    fn stage_input(&self, id: u8, bytes: &[u8]) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        if slot.status.load(Ordering::Acquire) != STATUS_NOT_READY {
            return false;
        }
        critical_section::with(|cs| {
            let inner = &mut *slot.inner.borrow_ref_mut(cs);
            let len = inner.input_len as usize;
            if len + bytes.len() > BUF {
                return false;
            }
            inner.input[len..len + bytes.len()].copy_from_slice(bytes);
            inner.input_len += bytes.len() as u8;
            true
        })
    }

    fn consume_input(&self, id: u8) -> Option<u8> {
        let slot = self.slot(id)?;
        if slot.status.load(Ordering::Acquire) != STATUS_NOT_READY {
            return None;
        }
        critical_section::with(|cs| {
            let inner = &mut *slot.inner.borrow_ref_mut(cs);
            if inner.input_pos >= inner.input_len {
                return None;
            }
            let byte = inner.input[inner.input_pos as usize];
            inner.input_pos += 1;
            Some(byte)
        })
    }

    fn produce_output(&self, id: u8, byte: u8) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        if slot.status.load(Ordering::Acquire) != STATUS_NOT_READY {
            return false;
        }
        critical_section::with(|cs| {
            let inner = &mut *slot.inner.borrow_ref_mut(cs);
            if inner.output_pos >= inner.output_len {
                return false;
            }
            inner.output[inner.output_pos as usize] = byte;
            inner.output_pos += 1;
            if inner.output_pos == inner.output_len {
                slot.status.store(STATUS_READY, Ordering::Release);
            }
            true
        })
    }

    fn set_error(&self, id: u8, error: Error) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        critical_section::with(|cs| {
            if slot.status.load(Ordering::Acquire) == STATUS_ERROR {
                return;
            }
            slot.inner.borrow_ref_mut(cs).error = Some(error);
            slot.status.store(STATUS_ERROR, Ordering::Release);
        });
    }

    fn finish(&self, id: u8) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let _ = slot.status.compare_exchange(
            STATUS_NOT_READY,
            STATUS_READY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn read_output(&self, id: u8, offset: usize, out: &mut [u8]) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        if slot.status.load(Ordering::Acquire) != STATUS_READY {
            return false;
        }
        critical_section::with(|cs| {
            let inner = slot.inner.borrow_ref(cs);
            let end = offset + out.len();
            if end > inner.output_pos as usize {
                return false;
            }
            out.copy_from_slice(&inner.output[offset..end]);
            true
        })
    }
}

/// Typed handle over one [`FutureStore`] slot.
///
/// `Out` is the value produced by the transaction's read phases, `In` the
/// value consumed by its write phases; either may be `()`. The handle is
/// move-only, since copying it would alias a slot, and releases the slot
/// when dropped.
///
/// Dropping a future whose commands are still queued or in flight leaves the
/// engine writing into a reclaimed slot; drivers must keep the handle alive
/// until its last command retired.
pub struct Future<'a, Out, In> {
    store: &'a dyn FutureStorage,
    id: u8,
    _marker: PhantomData<(Out, In)>,
}

impl<'a, Out: Pod, In: Pod> Future<'a, Out, In> {
    /// Registers a slot holding `input` as the staged transmit bytes and
    /// `size_of::<Out>()` expected receive bytes.
    pub fn new(store: &'a dyn FutureStorage, input: In) -> Result<Self, Error> {
        let id = store.register(bytemuck::bytes_of(&input), core::mem::size_of::<Out>())?;
        Ok(Future {
            store,
            id,
            _marker: PhantomData,
        })
    }

    /// The slot id referenced by queued commands.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Current status.
    pub fn status(&self) -> FutureStatus {
        self.store.status(self.id)
    }

    /// Error recorded on the slot, if the transaction failed.
    pub fn error(&self) -> Option<Error> {
        self.store.error(self.id)
    }

    /// Busy-polls until the status is terminal and returns it.
    ///
    /// Equivalent to [`wait_with`](Self::wait_with) with a spin-loop hint as
    /// the idle action.
    pub fn wait(&self) -> FutureStatus {
        self.wait_with(core::hint::spin_loop)
    }

    /// Polls until the status is terminal, invoking `idle` between polls.
    ///
    /// `idle` is the plug-in point for a sleep primitive: pass a closure
    /// entering the MCU's idle mode to sleep between TWI interrupts instead
    /// of spinning. Interrupts stay enabled throughout.
    pub fn wait_with(&self, mut idle: impl FnMut()) -> FutureStatus {
        loop {
            match self.status() {
                FutureStatus::NotReady => idle(),
                status => return status,
            }
        }
    }

    /// Returns the typed result of a [`FutureStatus::Ready`] future, `None`
    /// in every other state.
    pub fn get(&self) -> Option<Out> {
        let mut out = Out::zeroed();
        self.store
            .read_output(self.id, 0, bytemuck::bytes_of_mut(&mut out))
            .then_some(out)
    }
}

impl<Out, In> Drop for Future<'_, Out, In> {
    fn drop(&mut self) {
        self.store.release(self.id);
    }
}

impl<Out, In> core::fmt::Debug for Future<'_, Out, In> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Future").field("id", &self.id).finish()
    }
}
