//! Typed element codec for save-state bodies.
//!
//! Registered state is stored as arrays of fixed-width elements. Instead of
//! reinterpreting device memory as raw bytes, each element type knows how to
//! encode and decode itself in an explicit byte order. A reader that meets a
//! body written by an opposite-endian host decodes with the writer's order,
//! which is the same as swapping every 2/4/8-byte element in place.

use std::io::{self, Read};

// ---------------------------------------------------------------------------
// Byte order
// ---------------------------------------------------------------------------

/// Byte order of multi-byte elements in a save body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// The byte order of the host running this code.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Endian = Endian::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: Endian = Endian::Big;

    pub fn is_native(self) -> bool {
        self == Self::NATIVE
    }
}

// ---------------------------------------------------------------------------
// SaveItem
// ---------------------------------------------------------------------------

/// A fixed-width element that can live in a registered state block.
///
/// `SIZE` is always 1, 2, 4, or 8. Single-byte elements are written
/// identically in either byte order.
pub trait SaveItem: Copy + 'static {
    const SIZE: usize;

    /// Write `self` into `out`, which is exactly `SIZE` bytes long.
    fn encode(self, endian: Endian, out: &mut [u8]);

    /// Read a value from `bytes`, which is exactly `SIZE` bytes long.
    fn decode(bytes: &[u8], endian: Endian) -> Self;
}

/// A container of [`SaveItem`]s that can be registered as one state entry.
///
/// Implemented for the element types themselves (a single element), for
/// fixed-size arrays, and for `Vec`s whose length is fixed after
/// registration.
pub trait StateData: 'static {
    type Item: SaveItem;

    fn items(&self) -> &[Self::Item];

    fn items_mut(&mut self) -> &mut [Self::Item];
}

macro_rules! impl_save_item {
    ($($ty:ty),* $(,)?) => {
        $(
            impl SaveItem for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode(self, endian: Endian, out: &mut [u8]) {
                    let bytes = match endian {
                        Endian::Little => self.to_le_bytes(),
                        Endian::Big => self.to_be_bytes(),
                    };
                    out.copy_from_slice(&bytes);
                }

                #[inline]
                fn decode(bytes: &[u8], endian: Endian) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    match endian {
                        Endian::Little => <$ty>::from_le_bytes(buf),
                        Endian::Big => <$ty>::from_be_bytes(buf),
                    }
                }
            }

            impl StateData for $ty {
                type Item = $ty;

                fn items(&self) -> &[$ty] {
                    std::slice::from_ref(self)
                }

                fn items_mut(&mut self) -> &mut [$ty] {
                    std::slice::from_mut(self)
                }
            }
        )*
    };
}

impl_save_item!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl SaveItem for bool {
    const SIZE: usize = 1;

    #[inline]
    fn encode(self, _endian: Endian, out: &mut [u8]) {
        out[0] = self as u8;
    }

    #[inline]
    fn decode(bytes: &[u8], _endian: Endian) -> Self {
        bytes[0] != 0
    }
}

impl StateData for bool {
    type Item = bool;

    fn items(&self) -> &[bool] {
        std::slice::from_ref(self)
    }

    fn items_mut(&mut self) -> &mut [bool] {
        std::slice::from_mut(self)
    }
}

impl<T: SaveItem, const N: usize> StateData for [T; N] {
    type Item = T;

    fn items(&self) -> &[T] {
        self
    }

    fn items_mut(&mut self) -> &mut [T] {
        self
    }
}

impl<T: SaveItem> StateData for Vec<T> {
    type Item = T;

    fn items(&self) -> &[T] {
        self
    }

    fn items_mut(&mut self) -> &mut [T] {
        self
    }
}

/// Append the encoding of every element of `items` to `out`.
pub fn encode_items<T: SaveItem>(items: &[T], endian: Endian, out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + items.len() * T::SIZE, 0);
    for (item, chunk) in items.iter().zip(out[start..].chunks_exact_mut(T::SIZE)) {
        item.encode(endian, chunk);
    }
}

/// Overwrite `items` from `bytes`, which must hold exactly `items.len()`
/// encoded elements.
pub fn decode_items<T: SaveItem>(bytes: &[u8], endian: Endian, items: &mut [T]) {
    debug_assert_eq!(bytes.len(), items.len() * T::SIZE);
    for (item, chunk) in items.iter_mut().zip(bytes.chunks_exact(T::SIZE)) {
        *item = T::decode(chunk, endian);
    }
}

// ---------------------------------------------------------------------------
// Stream helpers
// ---------------------------------------------------------------------------

/// Fixed-size reads for header parsing.
pub trait ReadLeExt: Read {
    fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}
