use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use std::alloc::{alloc_zeroed, Layout};

use crate::error::{MemoryError, Result};
use crate::layout::{RegionKind, RegionSpec};

/// A contiguous guest-address interval `[start, start + size)` with its own host backing buffer.
///
/// # Threading / data races
/// Guest memory is concurrently read and written by CPU threads and device engines without any
/// host-side synchronization; races between them are part of the emulated machine's semantics.
/// The backing store is therefore a slice of [`AtomicU8`] and every access is a byte-granular
/// `Relaxed` load/store, which keeps unsynchronized accesses free of Rust data-race UB without
/// imposing ordering the target architecture does not have.
///
/// The backing buffer is released when the region is dropped.
pub struct Region {
    spec: RegionSpec,
    backing: Box<[AtomicU8]>,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("kind", &self.spec.kind)
            .field("start", &format_args!("0x{:x}", self.spec.start))
            .field("size", &format_args!("0x{:x}", self.spec.size))
            .field("host", &self.host_buffer())
            .finish()
    }
}

/// Reserves `size` zeroed bytes of backing storage.
///
/// Uses `alloc_zeroed` directly so large regions are satisfied by lazily-committed zero pages
/// instead of being touched up front.
fn alloc_backing(size: u64) -> Result<Box<[AtomicU8]>> {
    let len = usize::try_from(size).map_err(|_| MemoryError::HostAllocation { size })?;
    let layout =
        Layout::array::<AtomicU8>(len).map_err(|_| MemoryError::HostAllocation { size })?;
    debug_assert!(layout.size() != 0);

    // Safety: `layout` has a non-zero size (callers reject empty regions).
    let ptr = unsafe { alloc_zeroed(layout) }.cast::<AtomicU8>();
    if ptr.is_null() {
        return Err(MemoryError::HostAllocation { size });
    }

    // Safety: `ptr` was returned by the global allocator for the layout of `[AtomicU8; len]`, and
    // the all-zero bit pattern is a valid `AtomicU8`.
    Ok(unsafe { Box::from_raw(core::ptr::slice_from_raw_parts_mut(ptr, len)) })
}

impl Region {
    /// Allocates zeroed backing storage for `[start, start + size)`.
    pub fn set_range(kind: RegionKind, start: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        if start.checked_add(size).is_none() {
            return Err(MemoryError::InvalidLayout("region end overflows u64"));
        }
        Ok(Self {
            spec: RegionSpec::new(kind, start, size),
            backing: alloc_backing(size)?,
        })
    }

    #[inline]
    pub fn spec(&self) -> RegionSpec {
        self.spec
    }

    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.spec.kind
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.spec.start
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.spec.size
    }

    /// Exclusive end address.
    #[inline]
    pub fn end(&self) -> u64 {
        self.spec.end()
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.spec.contains(addr)
    }

    /// Returns `true` if the whole `[addr, addr + len)` lies inside this region. An empty range is
    /// contained iff `addr` is.
    #[inline]
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        if len == 0 {
            return self.contains(addr);
        }
        match addr.checked_add(len) {
            Some(end) => addr >= self.start() && end <= self.end(),
            None => false,
        }
    }

    /// Host address of the first backing byte (guest address `start`).
    ///
    /// Writing through the returned pointer is permitted: the backing bytes are atomics and
    /// therefore interior-mutable.
    #[inline]
    pub fn host_buffer(&self) -> *mut u8 {
        self.backing.as_ptr() as *mut u8
    }

    /// Host pointer backing guest address `addr`, or `None` if `addr` is outside this region.
    pub fn host_pointer_for(&self, addr: u64) -> Option<*mut u8> {
        if !self.contains(addr) {
            return None;
        }
        let offset = (addr - self.start()) as usize;
        Some(self.host_buffer().wrapping_add(offset))
    }

    /// Reverse translation: guest address backed by `host`, if it points into this region's
    /// buffer. The buffer range is half-open, so the final byte maps and one-past-the-end does
    /// not.
    pub fn guest_address_for(&self, host: *const u8) -> Option<u64> {
        let base = self.host_buffer() as usize;
        let host = host as usize;
        if host >= base && host - base < self.backing.len() {
            Some(self.start() + (host - base) as u64)
        } else {
            None
        }
    }

    #[inline]
    fn range(&self, addr: u64, len: usize) -> Result<&[AtomicU8]> {
        let len_u64 = len as u64;
        if len == 0 || !self.contains_range(addr, len_u64) {
            return Err(MemoryError::NoMapping { addr, len: len_u64 });
        }
        let start = (addr - self.start()) as usize;
        Ok(&self.backing[start..start + len])
    }

    /// Copies guest bytes at `addr` into `dst` verbatim.
    pub fn load(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let src = self.range(addr, dst.len())?;
        for (slot, byte) in dst.iter_mut().zip(src) {
            *slot = byte.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copies `src` into guest memory at `addr` verbatim.
    pub fn store(&self, addr: u64, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let dst = self.range(addr, src.len())?;
        for (byte, value) in dst.iter().zip(src.iter().copied()) {
            byte.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn fill(&self, addr: u64, len: u64, value: u8) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let len_usize =
            usize::try_from(len).map_err(|_| MemoryError::NoMapping { addr, len })?;
        for byte in self.range(addr, len_usize)? {
            byte.store(value, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::set_range(RegionKind::VideoMem, 0x1000, 0x100).unwrap()
    }

    #[test]
    fn backing_starts_zeroed() {
        let r = region();
        let mut buf = [0xffu8; 0x100];
        r.load(0x1000, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_sized_region_is_rejected() {
        assert_eq!(
            Region::set_range(RegionKind::VideoMem, 0x1000, 0).unwrap_err(),
            MemoryError::InvalidSize
        );
    }

    #[test]
    fn contains_range_boundaries() {
        let r = region();
        assert!(r.contains_range(0x1000, 0x100));
        assert!(r.contains_range(0x10ff, 1));
        assert!(!r.contains_range(0x10ff, 2));
        assert!(!r.contains_range(0xfff, 2));
        assert!(r.contains_range(0x1080, 0));
        assert!(!r.contains_range(0x1100, 0));
        assert!(!r.contains_range(u64::MAX, 2));
    }

    #[test]
    fn load_store_out_of_range_is_no_mapping() {
        let r = region();
        assert_eq!(
            r.store(0x10fe, &[1, 2, 3]).unwrap_err(),
            MemoryError::NoMapping {
                addr: 0x10fe,
                len: 3
            }
        );
        let mut buf = [0u8; 4];
        assert!(r.load(0xffe, &mut buf).is_err());
        // A failed store must not write a partial prefix.
        r.load(0x10fe, &mut buf[..2]).unwrap();
        assert_eq!(&buf[..2], &[0, 0]);
    }

    #[test]
    fn host_pointer_round_trip_and_last_byte_boundary() {
        let r = region();
        let first = r.host_pointer_for(0x1000).unwrap();
        assert_eq!(first, r.host_buffer());
        let last = r.host_pointer_for(0x10ff).unwrap();
        assert_eq!(r.guest_address_for(last), Some(0x10ff));
        assert_eq!(r.guest_address_for(last.wrapping_add(1)), None);
        assert_eq!(r.host_pointer_for(0x1100), None);
    }

    #[test]
    fn host_pointer_writes_are_visible_through_load() {
        let r = region();
        let ptr = r.host_pointer_for(0x1010).unwrap();
        // Safety: `ptr` points into the live backing buffer of `r`.
        unsafe { ptr.write(0x5a) };
        let mut buf = [0u8; 1];
        r.load(0x1010, &mut buf).unwrap();
        assert_eq!(buf, [0x5a]);
    }
}
