//! The Ether: header and slot layout, producer protocol, binding.
//!
//! Buffer layout (little-endian, naturally aligned):
//!
//! ```text
//! EtherHeader { sequence: atomic u64, signature: u64, capacity: u64 }   64B
//! Slot 0      { selector: atomic u32, seq: atomic u64, commit: u64 }    64B
//!             payload (max payload size, rounded up)                 64B-aligned
//! Slot 1      ...
//! ```
//!
//! A slot is published iff its commit number equals its sequence number.
//! The producer protocol is allocate-then-commit: claim a sequence with a
//! CAS on the header counter, clear the slot's commit, release-store the
//! new sequence, write the payload in place, then release-store commit.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::info;

use crate::backing::{Backing, BUFFER_ALIGN};
use crate::{EtherError, Member, MessageSet};

/// Header at the start of every Ether buffer.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct EtherHeader {
    /// Last claimed sequence number; slot index is `seq & (capacity - 1)`.
    pub(crate) sequence: AtomicU64,
    pub(crate) signature: u64,
    pub(crate) capacity: u64,
}

/// Per-slot control block, one cache line ahead of the payload.
#[repr(C, align(64))]
pub(crate) struct SlotHeader {
    pub(crate) selector: AtomicU32,
    _pad: u32,
    pub(crate) seq: AtomicU64,
    pub(crate) commit: AtomicU64,
}

/// Typed message bus over an externally provided buffer.
#[derive(Debug)]
pub struct Ether<M: MessageSet> {
    name: String,
    backing: Backing,
    header: NonNull<EtherHeader>,
    slots: NonNull<u8>,
    capacity: u64,
    mask: u64,
    _marker: PhantomData<M>,
}

// SAFETY: all shared mutation goes through atomics; payload regions are
// handed out under the slot ownership protocol.
unsafe impl<M: MessageSet> Send for Ether<M> {}
unsafe impl<M: MessageSet> Sync for Ether<M> {}

impl<M: MessageSet> Ether<M> {
    /// Bytes from one slot's header to the next.
    pub const SLOT_STRIDE: usize = size_of::<SlotHeader>() + ((M::MAX_PAYLOAD + 63) & !63);

    /// Buffer bytes needed for `capacity` slots of this message set.
    #[must_use]
    pub const fn required_size(capacity: usize) -> usize {
        size_of::<EtherHeader>() + capacity * Self::SLOT_STRIDE
    }

    /// Bind to `backing`.
    ///
    /// With `reset`, the region is zeroed and the header stamped with this
    /// message set's signature and `capacity`. Without it, the existing
    /// header must carry the same signature and capacity; a mismatch fails
    /// the binding and leaves no partial state.
    pub fn initialize(
        name: impl Into<String>,
        capacity: usize,
        backing: Backing,
        reset: bool,
    ) -> Result<Self, EtherError> {
        let name = name.into();
        assert!(
            capacity.is_power_of_two(),
            "ether capacity must be a power of two"
        );

        let required = Self::required_size(capacity);
        if backing.len() < required {
            return Err(EtherError::BufferTooSmall {
                name,
                required,
                provided: backing.len(),
            });
        }

        let base = backing.as_ptr();
        debug_assert_eq!(base.as_ptr() as usize % BUFFER_ALIGN, 0);
        let header = base.cast::<EtherHeader>();

        if reset {
            // SAFETY: the backing is at least `required` bytes and ours.
            unsafe {
                std::ptr::write_bytes(base.as_ptr(), 0, required);
                let h = header.as_ptr();
                (*h).signature = M::SIGNATURE;
                (*h).capacity = capacity as u64;
            }
            info!(ether = %name, capacity, "ether reset and stamped");
        } else {
            // SAFETY: header-sized prefix is initialized by a prior reset.
            let h = unsafe { header.as_ref() };
            if h.signature != M::SIGNATURE {
                return Err(EtherError::SignatureMismatch {
                    name,
                    expected: M::SIGNATURE,
                    found: h.signature,
                });
            }
            if h.capacity != capacity as u64 {
                return Err(EtherError::CapacityMismatch {
                    name,
                    expected: capacity as u64,
                    found: h.capacity,
                });
            }
            info!(ether = %name, capacity, "ether attached to existing buffer");
        }

        // SAFETY: required > size_of::<EtherHeader>() keeps this in-bounds.
        let slots = unsafe {
            NonNull::new_unchecked(base.as_ptr().add(size_of::<EtherHeader>()))
        };

        Ok(Self {
            name,
            backing,
            header,
            slots,
            capacity: capacity as u64,
            mask: capacity as u64 - 1,
            _marker: PhantomData,
        })
    }

    /// Claim the next sequence number and place `value` in its slot.
    ///
    /// The returned handle must be passed to [`Ether::commit`] promptly:
    /// readers cannot advance past an uncommitted sequence, and a handle
    /// dropped without commit wedges every cursor at it.
    pub fn allocate<T: Member<M>>(&self, value: T) -> MsgRef<'_, M, T> {
        debug_assert!(align_of::<T>() <= BUFFER_ALIGN);

        let header = self.header();
        let mut cur = header.sequence.load(Ordering::Relaxed);
        let seq = loop {
            match header.sequence.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(prev) => break prev + 1,
                Err(now) => cur = now,
            }
        };

        let slot = self.slot_header(seq);
        // Clear commit before stamping seq so no reader can mistake the
        // previous lap's commit for this sequence.
        slot.commit.store(0, Ordering::Relaxed);
        slot.seq.store(seq, Ordering::Release);

        let payload = self.payload_ptr(seq).cast::<T>();
        // SAFETY: the payload region holds MAX_PAYLOAD >= size_of::<T>()
        // bytes at 64-byte alignment, and this producer owns the slot for
        // sequence `seq` until commit.
        unsafe { payload.write(value) };

        MsgRef {
            slot,
            // SAFETY: payload points into a live mapping.
            payload: unsafe { NonNull::new_unchecked(payload) },
            seq,
            _marker: PhantomData,
        }
    }

    /// Publish an allocated message: store its discriminant, then
    /// release-store `commit = seq`. Payload writes made through the handle
    /// are visible to any reader that observes the commit.
    pub fn commit<T: Member<M>>(&self, msg: MsgRef<'_, M, T>) {
        msg.slot.selector.store(T::ID, Ordering::Relaxed);
        msg.slot.commit.store(msg.seq, Ordering::Release);
    }

    /// Allocate and commit in one call.
    pub fn publish<T: Member<M>>(&self, value: T) {
        let msg = self.allocate(value);
        self.commit(msg);
    }

    /// Ether name (diagnostics).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot count.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Last claimed sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.header().sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn header(&self) -> &EtherHeader {
        // SAFETY: the header lives for as long as the backing.
        unsafe { self.header.as_ref() }
    }

    pub(crate) fn slot_header(&self, seq: u64) -> &SlotHeader {
        let offset = (seq & self.mask) as usize * Self::SLOT_STRIDE;
        // SAFETY: offset < capacity * SLOT_STRIDE, within the validated
        // backing; SlotHeader is all atomics and was zero-initialized.
        unsafe { &*self.slots.as_ptr().add(offset).cast::<SlotHeader>() }
    }

    pub(crate) fn payload_ptr(&self, seq: u64) -> *mut u8 {
        let offset = (seq & self.mask) as usize * Self::SLOT_STRIDE + size_of::<SlotHeader>();
        // SAFETY: as above; the payload region follows its slot header.
        unsafe { self.slots.as_ptr().add(offset) }
    }

    /// The backing this Ether was bound to.
    #[must_use]
    pub fn backing(&self) -> &Backing {
        &self.backing
    }
}

/// Exclusive handle to an allocated, not-yet-committed message.
///
/// Dereferences to the payload for in-place construction. Pass it to
/// [`Ether::commit`] to publish; dropping it without committing leaves the
/// sequence permanently unpublished (readers stall at it).
pub struct MsgRef<'a, M: MessageSet, T: Member<M>> {
    slot: &'a SlotHeader,
    payload: NonNull<T>,
    seq: u64,
    _marker: PhantomData<M>,
}

impl<M: MessageSet, T: Member<M>> MsgRef<'_, M, T> {
    /// Sequence number this message will publish as.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl<M: MessageSet, T: Member<M>> Deref for MsgRef<'_, M, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: exclusive slot ownership between allocate and commit.
        unsafe { self.payload.as_ref() }
    }
}

impl<M: MessageSet, T: Member<M>> DerefMut for MsgRef<'_, M, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in deref.
        unsafe { self.payload.as_mut() }
    }
}
