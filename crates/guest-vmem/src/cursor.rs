//! Typed cursor over guest memory.

use core::fmt;
use core::marker::PhantomData;

use crate::access::GuestScalar;
use crate::error::Result;
use crate::memory::Memory;

/// A moving window over guest memory with element width `T::WIDTH`.
///
/// The cursor does not own memory; it is a guest address (plus the origin it started from) bound
/// to a [`Memory`]. Reads return values, never references into guest memory. Accesses that fail
/// leave the current address unchanged.
///
/// The element width is fixed by `T`. Code that needs a different width at a particular call site
/// rebinds the same addresses with [`Cursor::cast`].
pub struct Cursor<'m, T: GuestScalar> {
    mem: &'m Memory,
    addr: u64,
    origin: u64,
    _width: PhantomData<T>,
}

pub type Cursor8<'m> = Cursor<'m, u8>;
pub type Cursor16<'m> = Cursor<'m, u16>;
pub type Cursor32<'m> = Cursor<'m, u32>;
pub type Cursor64<'m> = Cursor<'m, u64>;
pub type Cursor128<'m> = Cursor<'m, u128>;

impl<T: GuestScalar> Clone for Cursor<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GuestScalar> Copy for Cursor<'_, T> {}

impl<T: GuestScalar> fmt::Debug for Cursor<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("width", &T::WIDTH)
            .field("addr", &format_args!("0x{:x}", self.addr))
            .field("origin", &format_args!("0x{:x}", self.origin))
            .finish()
    }
}

impl<'m, T: GuestScalar> Cursor<'m, T> {
    pub fn new(mem: &'m Memory, addr: u64) -> Self {
        Self {
            mem,
            addr,
            origin: addr,
            _width: PhantomData,
        }
    }

    #[inline]
    fn step(&self, count: u64) -> u64 {
        self.addr
            .wrapping_add(count.wrapping_mul(T::WIDTH as u64))
    }

    /// Reads the element at the current address without moving.
    pub fn get(&self) -> Result<T> {
        self.mem.read(self.addr)
    }

    /// Reads the element at the current address, then advances past it.
    pub fn read_next(&mut self) -> Result<T> {
        let value = self.get()?;
        self.addr = self.step(1);
        Ok(value)
    }

    /// Writes `value` at the current address without moving.
    pub fn set(&self, value: T) -> Result<()> {
        self.mem.write(self.addr, value)
    }

    /// Writes `value` at the current address, then advances past it. Returns the new current
    /// address.
    pub fn push(&mut self, value: T) -> Result<u64> {
        self.set(value)?;
        self.addr = self.step(1);
        Ok(self.addr)
    }

    /// Reads element `index` counted from the current address. The cursor does not move.
    pub fn at(&self, index: u64) -> Result<T> {
        self.mem.read(self.step(index))
    }

    /// Moves back to the origin.
    pub fn reset(&mut self) {
        self.addr = self.origin;
    }

    #[inline]
    pub fn current_address(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn origin_address(&self) -> u64 {
        self.origin
    }

    /// Advances by `bytes` without accessing memory. Returns the new current address.
    pub fn offset_by(&mut self, bytes: u64) -> u64 {
        self.addr = self.addr.wrapping_add(bytes);
        self.addr
    }

    /// Moves to `addr`; the origin is kept.
    pub fn set_address(&mut self, addr: u64) {
        self.addr = addr;
    }

    /// Same current address and origin, accessed with width `U`.
    pub fn cast<U: GuestScalar>(self) -> Cursor<'m, U> {
        Cursor {
            mem: self.mem,
            addr: self.addr,
            origin: self.origin,
            _width: PhantomData,
        }
    }
}
