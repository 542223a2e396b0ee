//! Manual allocator for the user memory region.
//!
//! Allocations are tracked as `{addr, size}` descriptors in two lists. The *used* list holds
//! outstanding allocations in allocation order; the *free* list holds released intervals sorted
//! by address. New memory is first carved from the free list (first fit), then bump-allocated at a
//! frontier that only moves forward. Every byte in `[base, frontier)` belongs to exactly one
//! descriptor in one of the two lists.

use tracing::{error, warn};

use crate::access::checked_align_up;
use crate::error::{MemoryError, Result};
use crate::layout::RegionKind;
use crate::table::RegionTable;

/// An interval of user memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub addr: u64,
    pub size: u64,
}

impl Allocation {
    #[inline]
    pub const fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    /// Exclusive end address.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.addr + self.size
    }
}

/// Normalises an allocation alignment: `0` means unaligned, anything else must be a power of two.
fn normalize_align(align: u64) -> Result<u64> {
    match align {
        0 => Ok(1),
        a if a.is_power_of_two() => Ok(a),
        a => Err(MemoryError::InvalidAlignment { align: a }),
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserMemAllocator {
    base: u64,
    capacity: u64,
    frontier: u64,
    used: Vec<Allocation>,
    free: Vec<Allocation>,
}

impl UserMemAllocator {
    /// Allocator for a user region at `[base, base + capacity)`.
    pub fn new(base: u64, capacity: u64) -> Self {
        Self {
            base,
            capacity,
            frontier: base,
            used: Vec::new(),
            free: Vec::new(),
        }
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the user region.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.capacity
    }

    /// Bytes not held by outstanding allocations.
    pub fn available_size(&self) -> u64 {
        self.capacity.saturating_sub(self.used_size())
    }

    pub fn used_size(&self) -> u64 {
        self.used.iter().map(|a| a.size).sum()
    }

    pub fn free_size(&self) -> u64 {
        self.free.iter().map(|a| a.size).sum()
    }

    /// Next bump-allocation address.
    #[inline]
    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    /// Outstanding allocations, in allocation order.
    pub fn used(&self) -> &[Allocation] {
        &self.used
    }

    /// Released intervals, sorted by address.
    pub fn free_list(&self) -> &[Allocation] {
        &self.free
    }

    /// Drops all descriptors and rewinds the frontier.
    pub fn clear(&mut self) {
        self.used.clear();
        self.free.clear();
        self.frontier = self.base;
    }

    /// Allocates `size` zero-filled bytes aligned to `align` (a power of two; `0` is treated as
    /// `1`).
    ///
    /// On failure the used list, the free list and the frontier are unchanged.
    pub fn alloc(&mut self, table: &RegionTable, size: u64, align: u64) -> Result<u64> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let align = normalize_align(align)?;

        let available = self.available_size();
        if available < size {
            error!(requested = size, available, "not enough free user memory");
            return Err(MemoryError::OutOfMemory {
                requested: size,
                available,
            });
        }

        if let Some((index, addr)) = self.find_free(size, align) {
            table.fill(addr, size, 0)?;
            self.carve(index, addr, size);
            self.used.push(Allocation::new(addr, size));
            return Ok(addr);
        }

        let exhausted = MemoryError::AddressSpaceExhausted {
            addr: self.frontier,
            size,
        };
        let addr = checked_align_up(self.frontier, align).ok_or_else(|| exhausted.clone())?;
        let user = table
            .by_kind(RegionKind::UserMem)
            .ok_or(MemoryError::NotInitialized)?;
        if !user.contains_range(addr, size) {
            return Err(exhausted);
        }

        warn!(addr, size, "user memory alloc: creating new block at frontier");
        table.fill(addr, size, 0)?;
        if addr > self.frontier {
            // Alignment padding below the new block stays allocatable.
            self.insert_free(Allocation::new(self.frontier, addr - self.frontier));
            self.coalesce();
        }
        self.frontier = addr + size;
        self.used.push(Allocation::new(addr, size));
        Ok(addr)
    }

    /// First free descriptor (in address order) that can hold `size` bytes at an `align`-aligned
    /// address, with that address.
    fn find_free(&self, size: u64, align: u64) -> Option<(usize, u64)> {
        self.free.iter().enumerate().find_map(|(i, d)| {
            let addr = checked_align_up(d.addr, align)?;
            let end = addr.checked_add(size)?;
            (end <= d.end()).then_some((i, addr))
        })
    }

    /// Removes `[addr, addr + size)` from free descriptor `index`. Padding in front of `addr` stays
    /// in place; any tail is inserted right after it, which keeps the list sorted.
    fn carve(&mut self, index: usize, addr: u64, size: u64) {
        let desc = self.free[index];
        let head = addr - desc.addr;
        let tail_start = addr + size;
        let tail = desc.end() - tail_start;

        match (head, tail) {
            (0, 0) => {
                self.free.remove(index);
            }
            (0, _) => {
                let d = &mut self.free[index];
                d.addr += size;
                d.size -= size;
            }
            (_, 0) => self.free[index].size = head,
            (_, _) => {
                self.free[index].size = head;
                self.free
                    .insert(index + 1, Allocation::new(tail_start, tail));
            }
        }
    }

    fn insert_free(&mut self, desc: Allocation) {
        let at = self.free.partition_point(|d| d.addr < desc.addr);
        self.free.insert(at, desc);
    }

    /// Releases the outstanding allocation starting at `addr`.
    ///
    /// Unknown or already-freed addresses fail with [`MemoryError::UnknownAddress`] and change
    /// nothing.
    pub fn free(&mut self, addr: u64) -> Result<Allocation> {
        let index = self
            .used
            .iter()
            .position(|a| a.addr == addr)
            .ok_or(MemoryError::UnknownAddress { addr })?;
        let desc = self.used.remove(index);
        self.insert_free(desc);
        self.coalesce();
        Ok(desc)
    }

    /// Merges address-adjacent free descriptors.
    ///
    /// Idempotent. Afterwards the free list is sorted by address and no two entries touch or
    /// overlap.
    pub fn coalesce(&mut self) {
        if self.free.len() < 2 {
            return;
        }
        self.free.sort_unstable_by_key(|d| d.addr);

        let mut i = 0;
        while i + 1 < self.free.len() {
            let cur = self.free[i];
            let next = self.free[i + 1];
            debug_assert!(cur.end() <= next.addr, "free descriptors overlap");
            if cur.end() == next.addr {
                self.free[i].size += next.size;
                self.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}
