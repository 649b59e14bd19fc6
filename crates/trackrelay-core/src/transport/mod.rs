//! Byte-stream transport with one-time endianness negotiation.
//!
//! # How byte order is handled (for beginners)
//!
//! Multi-byte numbers can be laid out in memory with the most significant byte
//! first (*big-endian*) or last (*little-endian*).  Two machines exchanging raw
//! numbers must agree on which layout is on the wire, or a `u32` value of `1`
//! written by one side is read as `16777216` by the other.
//!
//! Instead of tagging every field, each connection starts with a single
//! handshake: both ends write [`ENDIANNESS_SENTINEL`] in their own byte order
//! and read the peer's copy back.
//!
//! - Same value → both ends share a byte order; nothing is ever swapped.
//! - Byte-reversed value → the peer's order is the opposite; this end swaps
//!   every multi-byte scalar it *reads*.
//! - Anything else → the peer is not speaking this protocol; the connection is
//!   dropped.
//!
//! Writers never swap ("receiver makes it right"), so a big-endian server
//! talking to little-endian clients sends native bytes and each client fixes
//! them up on arrival.
//!
//! # Sub-modules
//!
//! - **`channel`** – [`Channel`], [`ChannelReader`], [`ChannelWriter`]: typed
//!   scalar/array reads and writes over any `AsyncRead + AsyncWrite` stream.
//! - **`stream`** – [`Endpoint`], [`Stream`], [`Listener`]: TCP and Unix-domain
//!   socket plumbing.

pub mod channel;
pub mod stream;

pub use channel::{Channel, ChannelReader, ChannelWriter};
pub use stream::{Endpoint, EndpointParseError, Listener, Stream};

use thiserror::Error;

/// The 32-bit value exchanged during endianness negotiation.
///
/// Its byte reversal (`0x7856_3412`) differs from the value itself, so the
/// "same order" and "opposite order" outcomes can never be confused.
pub const ENDIANNESS_SENTINEL: u32 = 0x1234_5678;

/// Errors raised by the transport channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The underlying socket could not be established.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer's sentinel was neither the expected value nor its byte reversal.
    #[error("unable to negotiate endianness: received sentinel 0x{received:08X}")]
    Endianness { received: u32 },

    /// A read or write failed on an established channel.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream while a read was pending.
    #[error("channel closed by peer")]
    Closed,
}

/// Byte order of multi-byte scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// The byte order of the machine this code was compiled for.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// The opposite byte order.
    pub const fn reversed(self) -> Self {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }
}

/// A fixed-width value that can travel over a [`Channel`].
///
/// Implemented for all primitive integers up to 64 bits and for `f32`/`f64`.
pub trait Scalar: Copy + Send + 'static {
    /// Encoded width in bytes (at most 8).
    const SIZE: usize;

    /// Appends the value to `out` in the given byte order.
    fn write_to(self, order: ByteOrder, out: &mut Vec<u8>);

    /// Decodes a value from the first [`Self::SIZE`] bytes of `bytes`.
    ///
    /// Callers must pass at least `SIZE` bytes.
    fn read_from(order: ByteOrder, bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl Scalar for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn write_to(self, order: ByteOrder, out: &mut Vec<u8>) {
                    match order {
                        ByteOrder::Little => out.extend_from_slice(&self.to_le_bytes()),
                        ByteOrder::Big => out.extend_from_slice(&self.to_be_bytes()),
                    }
                }

                fn read_from(order: ByteOrder, bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    match order {
                        ByteOrder::Little => <$t>::from_le_bytes(raw),
                        ByteOrder::Big => <$t>::from_be_bytes(raw),
                    }
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversed_is_an_involution() {
        assert_eq!(ByteOrder::Little.reversed(), ByteOrder::Big);
        assert_eq!(ByteOrder::Big.reversed().reversed(), ByteOrder::Big);
    }

    #[test]
    fn test_native_matches_target_endian() {
        let one = 1u16.to_ne_bytes();
        let expected = if one[0] == 1 { ByteOrder::Little } else { ByteOrder::Big };
        assert_eq!(ByteOrder::native(), expected);
    }

    #[test]
    fn test_sentinel_differs_from_its_reversal() {
        assert_ne!(ENDIANNESS_SENTINEL, ENDIANNESS_SENTINEL.swap_bytes());
    }

    #[test]
    fn test_scalar_reading_in_opposite_order_equals_swap_bytes() {
        // Arrange
        let mut buf = Vec::new();
        0xA1B2_C3D4u32.write_to(ByteOrder::Big, &mut buf);

        // Act
        let read_back = u32::read_from(ByteOrder::Little, &buf);

        // Assert
        assert_eq!(read_back, 0xA1B2_C3D4u32.swap_bytes());
    }

    #[test]
    fn test_float_scalars_survive_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let mut buf = Vec::new();
            (-1.5f32).write_to(order, &mut buf);
            std::f64::consts::PI.write_to(order, &mut buf);
            assert_eq!(f32::read_from(order, &buf[..4]), -1.5);
            assert_eq!(f64::read_from(order, &buf[4..]), std::f64::consts::PI);
        }
    }

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(<u8 as Scalar>::SIZE, 1);
        assert_eq!(<i16 as Scalar>::SIZE, 2);
        assert_eq!(<f32 as Scalar>::SIZE, 4);
        assert_eq!(<u64 as Scalar>::SIZE, 8);
    }
}
