//! Endian-correct guest memory access.
//!
//! The emulated machine is big-endian: guest memory holds the big-endian encoding of every scalar.
//! Scalar accessors convert to and from host values. The bulk accessors copy bytes verbatim and
//! leave byte order to the caller, who uses them for structure-shaped data; the two paths are kept
//! separate on purpose.

use crate::error::{MemoryError, Result};
use crate::table::RegionTable;

mod sealed {
    pub trait Sealed {}
}

/// A fixed-width scalar stored big-endian in guest memory.
///
/// Implemented for `u8`, `u16`, `u32`, `u64` and `u128` only. Width dispatch goes through this
/// trait rather than through `size_of`, so two unrelated types of the same size cannot be
/// confused.
pub trait GuestScalar: Copy + sealed::Sealed + 'static {
    /// Width in bytes.
    const WIDTH: usize;

    /// Guest (big-endian) byte representation.
    type Bytes: AsRef<[u8]> + AsMut<[u8]> + Default + Copy;

    fn from_guest_bytes(bytes: Self::Bytes) -> Self;

    fn to_guest_bytes(self) -> Self::Bytes;
}

macro_rules! impl_guest_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl GuestScalar for $ty {
                const WIDTH: usize = core::mem::size_of::<$ty>();
                type Bytes = [u8; core::mem::size_of::<$ty>()];

                #[inline]
                fn from_guest_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_be_bytes(bytes)
                }

                #[inline]
                fn to_guest_bytes(self) -> Self::Bytes {
                    self.to_be_bytes()
                }
            }
        )*
    };
}

impl_guest_scalar!(u8, u16, u32, u64, u128);

/// Rounds `addr` up to the next multiple of `align`.
///
/// `align` must be a power of two. Any other value yields an unspecified result (debug builds
/// assert); it is never silently corrected.
#[inline]
pub const fn align_up(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    let mask = align.wrapping_sub(1);
    addr.wrapping_add(mask) & !mask
}

/// Overflow-checked [`align_up`] for a power-of-two `align`.
#[inline]
pub(crate) fn checked_align_up(addr: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    Some(addr.checked_add(mask)? & !mask)
}

impl RegionTable {
    /// Reads a big-endian scalar at `addr`. The whole value must lie in one region.
    #[inline]
    pub fn read<T: GuestScalar>(&self, addr: u64) -> Result<T> {
        let mut bytes = T::Bytes::default();
        self.load(addr, bytes.as_mut())?;
        Ok(T::from_guest_bytes(bytes))
    }

    /// Writes `value` big-endian at `addr`. The whole value must lie in one region.
    #[inline]
    pub fn write<T: GuestScalar>(&self, addr: u64, value: T) -> Result<()> {
        self.store(addr, value.to_guest_bytes().as_ref())
    }

    /// Raw (non-reversing) copy of a plain-data value out of guest memory.
    pub fn read_raw<T: bytemuck::Pod>(&self, addr: u64) -> Result<T> {
        let mut value = T::zeroed();
        self.load(addr, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Raw (non-reversing) copy of a plain-data value into guest memory.
    pub fn write_raw<T: bytemuck::Pod>(&self, addr: u64, value: &T) -> Result<()> {
        self.store(addr, bytemuck::bytes_of(value))
    }

    /// Reads a NUL-terminated byte string starting at `addr`, one byte at a time.
    ///
    /// There is no length limit: the caller guarantees a terminator exists in mapped memory. An
    /// unmapped byte before the terminator fails with [`MemoryError::NoMapping`].
    pub fn read_cstring(&self, addr: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut cur = addr;
        loop {
            let byte: u8 = self.read(cur)?;
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
            cur = cur
                .checked_add(1)
                .ok_or(MemoryError::NoMapping { addr: cur, len: 1 })?;
        }
    }

    /// Reads exactly `len` raw bytes at `addr`. The range is checked before any host buffer is
    /// allocated.
    pub fn read_string(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        self.resolve_range(addr, len as u64)?;
        let mut out = vec![0u8; len];
        self.load(addr, &mut out)?;
        Ok(out)
    }

    /// Writes `bytes` followed by a NUL terminator. Nothing is written unless the whole
    /// `bytes.len() + 1` range is mapped.
    pub fn write_cstring(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        let terminator = addr
            .checked_add(len)
            .ok_or(MemoryError::NoMapping { addr, len: len + 1 })?;
        self.resolve_range(addr, len + 1)?;
        self.store(addr, bytes)?;
        self.write::<u8>(terminator, 0)
    }
}
