//! Lock-free message bus for ultra-low-latency fan-out
//!
//! The Ether is a ring of fixed-size slots over a contiguous byte buffer.
//! Producers claim monotonically increasing sequence numbers from a shared
//! header counter, write a typed payload in place, and publish it with a
//! release-store of the slot's commit number. Readers own independent
//! cursors and deliver every message in sequence order; a reader that falls
//! a full ring behind is told so and must treat it as fatal.
//!
//! Message sets are closed sums declared with [`messages!`]; the macro
//! assigns each payload type a small ordinal discriminant and folds the
//! whole list into an FNV-1a signature that guards persisted buffers
//! against schema drift.

#![deny(warnings)]
#![deny(clippy::all)]

pub mod backing;
pub mod cursor;
pub mod ring;

pub use backing::Backing;
pub use cursor::Cursor;
pub use ring::{Ether, MsgRef};

/// Errors raised while binding or reading an Ether.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EtherError {
    /// The buffer was stamped by a different compile-time message list.
    #[error("ether '{name}' signature mismatch: expected {expected:#018x}, found {found:#018x}")]
    SignatureMismatch {
        /// Ether name.
        name: String,
        /// Signature of the binding message set.
        expected: u64,
        /// Signature found in the buffer header.
        found: u64,
    },
    /// The buffer was stamped with a different slot count.
    #[error("ether '{name}' capacity mismatch: expected {expected}, found {found}")]
    CapacityMismatch {
        /// Ether name.
        name: String,
        /// Capacity requested by the binding.
        expected: u64,
        /// Capacity found in the buffer header.
        found: u64,
    },
    /// The provided buffer cannot hold the header plus the slot array.
    #[error("ether '{name}' buffer too small: need {required} bytes, have {provided}")]
    BufferTooSmall {
        /// Ether name.
        name: String,
        /// Bytes required for this capacity and message set.
        required: usize,
        /// Bytes provided by the backing.
        provided: usize,
    },
    /// The cursor fell at least one full capacity behind the producer.
    /// Unrecoverable: sequence order can no longer be guaranteed.
    #[error("reader lapped: sequence {next_seq} is {behind} behind the producer")]
    ReaderLapped {
        /// The sequence number the cursor expected next.
        next_seq: u64,
        /// How far the producer had advanced past it.
        behind: u64,
    },
}

/// A message payload storable in Ether slots.
///
/// # Safety
/// Implementors must be plain old data: `Copy`, with no padding-dependent
/// semantics and **every initialized bit pattern valid**. The reader may
/// materialize a copy concurrently with a producer overwrite; the torn copy
/// is discarded after sequence re-validation, but it is constructed first.
/// [`messages!`] emits these impls; hold its payload types to that contract.
pub unsafe trait Payload: Copy + Send + 'static {
    /// Type name, hashed into the set signature.
    const NAME: &'static str;
}

/// A closed, compile-time-ordered set of message types.
///
/// Implemented by the enum that [`messages!`] generates; the Ether, cursor,
/// and dispatcher are generic over this trait.
pub trait MessageSet: Copy + Send + 'static {
    /// Number of message types in the set.
    const COUNT: u32;
    /// Size of the largest payload.
    const MAX_PAYLOAD: usize;
    /// FNV-1a digest over the declaration-ordered type list.
    const SIGNATURE: u64;

    /// Ordinal discriminant of this message's payload type.
    fn id(&self) -> u32;

    /// Reconstruct a message from its discriminant and payload bytes.
    /// Returns `None` for an out-of-range discriminant.
    ///
    /// # Safety
    /// `payload` must be valid for reads of the payload type selected by
    /// `id`, at the alignment the Ether guarantees (64 bytes).
    unsafe fn decode(id: u32, payload: *const u8) -> Option<Self>;
}

/// Membership of a payload type in a message set, carrying its ordinal.
pub trait Member<M: MessageSet>: Payload {
    /// Ordinal of this payload type in the set's declaration order.
    const ID: u32;
}

/// FNV-1a offset basis.
pub const FNV_BASIS: u64 = 0xcbf29ce484222325;
/// FNV-1a prime.
pub const FNV_PRIME: u64 = 0x100000001b3;

/// Compile-time FNV-1a over a byte string.
#[must_use]
pub const fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Fold `(name_hash, size)` pairs into the message-list signature.
///
/// Per element, in declaration order:
/// `sig ^= name_hash ^ (size << 1); sig *= FNV_PRIME`.
#[must_use]
pub const fn type_list_signature(entries: &[(u64, usize)]) -> u64 {
    let mut sig = FNV_BASIS;
    let mut i = 0;
    while i < entries.len() {
        sig ^= entries[i].0 ^ ((entries[i].1 as u64) << 1);
        sig = sig.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    sig
}

/// Declare a closed message set.
///
/// ```
/// #[derive(Clone, Copy, Debug)]
/// #[repr(C)]
/// pub struct Tick {
///     pub px: i64,
///     pub qty: i64,
/// }
///
/// #[derive(Clone, Copy, Debug)]
/// #[repr(C)]
/// pub struct Halt {
///     pub reason: u32,
/// }
///
/// bus::messages! {
///     pub enum MdMessage {
///         Tick(Tick),
///         Halt(Halt),
///     }
/// }
///
/// use bus::MessageSet;
/// assert_eq!(MdMessage::COUNT, 2);
/// ```
///
/// Discriminants follow declaration order, starting at zero. A payload
/// type may appear in at most one set per crate (the macro emits its
/// [`Payload`] impl).
#[macro_export]
macro_rules! messages {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident($payload:ty) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug)]
        $vis enum $name {
            $(
                #[allow(missing_docs)]
                $variant($payload),
            )+
        }

        impl $crate::MessageSet for $name {
            const COUNT: u32 = [$(stringify!($variant)),+].len() as u32;

            const MAX_PAYLOAD: usize = {
                let mut max = 0usize;
                $(
                    if ::core::mem::size_of::<$payload>() > max {
                        max = ::core::mem::size_of::<$payload>();
                    }
                )+
                max
            };

            const SIGNATURE: u64 = {
                const ENTRIES: &[(u64, usize)] = &[
                    $(
                        (
                            $crate::fnv1a(stringify!($payload).as_bytes()),
                            ::core::mem::size_of::<$payload>(),
                        ),
                    )+
                ];
                $crate::type_list_signature(ENTRIES)
            };

            #[inline]
            fn id(&self) -> u32 {
                match self {
                    $( Self::$variant(_) => <$payload as $crate::Member<Self>>::ID, )+
                }
            }

            #[inline]
            unsafe fn decode(id: u32, payload: *const u8) -> Option<Self> {
                $(
                    if id == <$payload as $crate::Member<Self>>::ID {
                        // SAFETY: caller passes a payload region valid for
                        // the type selected by `id`.
                        return Some(Self::$variant(unsafe {
                            payload.cast::<$payload>().read()
                        }));
                    }
                )+
                None
            }
        }

        $crate::messages!(@members $name ; 0u32 ; $( $variant $payload ),+ );
    };

    (@members $name:ident ; $idx:expr ; $variant:ident $payload:ty) => {
        // SAFETY: message payloads are declared POD per the Payload contract.
        unsafe impl $crate::Payload for $payload {
            const NAME: &'static str = stringify!($payload);
        }

        impl $crate::Member<$name> for $payload {
            const ID: u32 = $idx;
        }
    };

    (@members $name:ident ; $idx:expr ; $variant:ident $payload:ty , $( $rest_v:ident $rest_p:ty ),+ ) => {
        $crate::messages!(@members $name ; $idx ; $variant $payload);
        $crate::messages!(@members $name ; $idx + 1 ; $( $rest_v $rest_p ),+ );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vector() {
        // Well-known FNV-1a test vectors.
        assert_eq!(fnv1a(b""), FNV_BASIS);
        assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn signature_depends_on_order_name_and_size() {
        let a = (fnv1a(b"Tick"), 16usize);
        let b = (fnv1a(b"Halt"), 4usize);
        assert_eq!(type_list_signature(&[a, b]), type_list_signature(&[a, b]));
        assert_ne!(type_list_signature(&[a, b]), type_list_signature(&[b, a]));
        let b_grown = (fnv1a(b"Halt"), 8usize);
        assert_ne!(
            type_list_signature(&[a, b]),
            type_list_signature(&[a, b_grown])
        );
    }
}
