//! The guest memory session context.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::access::GuestScalar;
use crate::alloc::{Allocation, UserMemAllocator};
use crate::cursor::Cursor;
use crate::error::{MemoryError, Result};
use crate::flags::MemoryFlags;
use crate::layout::{MemoryOptions, RegionKind, RegionSpec};
use crate::region::Region;
use crate::table::RegionTable;

#[derive(Debug, Default)]
struct RegionState {
    table: RegionTable,
    initialized: bool,
}

/// Guest address space of one emulation session.
///
/// A `Memory` is created uninitialized; [`Memory::init`] registers the region layout and
/// [`Memory::close`] releases it. The context is `Send + Sync` and is meant to be shared (e.g. via
/// `Arc<Memory>`) between CPU threads, device engines and debuggers.
///
/// # Locking
/// - The region table sits behind an `RwLock`. `init`/`close`/`reset` and on-demand region
///   creation take it exclusively, which stops every other access for their duration.
/// - Scalar and bulk accesses only take the shared side. They are not ordered against each other;
///   see [`Region`] for the byte-level data-race model.
/// - The allocator and the flags registry each have their own `Mutex`.
///
/// Lock order is region table, then allocator.
#[derive(Debug)]
pub struct Memory {
    options: MemoryOptions,
    regions: RwLock<RegionState>,
    allocator: Mutex<UserMemAllocator>,
    flags: Mutex<MemoryFlags>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        self.close();
    }
}

impl Memory {
    /// Context using the fixed region layout.
    pub fn new() -> Self {
        Self::build(MemoryOptions::default())
    }

    pub fn with_options(options: MemoryOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(options))
    }

    fn build(options: MemoryOptions) -> Self {
        Self {
            options,
            regions: RwLock::new(RegionState::default()),
            allocator: Mutex::new(UserMemAllocator::default()),
            flags: Mutex::new(MemoryFlags::new()),
        }
    }

    pub fn options(&self) -> &MemoryOptions {
        &self.options
    }

    // Every critical section leaves its state consistent, so poisoned locks are recovered.

    fn read_regions(&self) -> RwLockReadGuard<'_, RegionState> {
        self.regions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_regions(&self) -> RwLockWriteGuard<'_, RegionState> {
        self.regions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_allocator(&self) -> MutexGuard<'_, UserMemAllocator> {
        self.allocator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_flags(&self) -> MutexGuard<'_, MemoryFlags> {
        self.flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---------------------------------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------------------------------

    pub fn is_initialized(&self) -> bool {
        self.read_regions().initialized
    }

    /// Registers the configured layout. A no-op if already initialized.
    pub fn init(&self) -> Result<()> {
        let mut regions = self.write_regions();
        self.init_locked(&mut regions)
    }

    /// Releases every region and clears the allocator and flags. A no-op if not initialized.
    pub fn close(&self) {
        let mut regions = self.write_regions();
        self.close_locked(&mut regions);
    }

    /// `close` followed by `init`, as one exclusive step. A no-op if not initialized.
    pub fn reset(&self) -> Result<()> {
        let mut regions = self.write_regions();
        if !regions.initialized {
            return Ok(());
        }
        info!("resetting guest memory");
        self.close_locked(&mut regions);
        self.init_locked(&mut regions)
    }

    fn init_locked(&self, regions: &mut RegionState) -> Result<()> {
        if regions.initialized {
            return Ok(());
        }
        info!(regions = self.options.layout.len(), "initializing guest memory");

        let mut table = RegionTable::new();
        for spec in &self.options.layout {
            table.push_fixed(Region::set_range(spec.kind, spec.start, spec.size)?);
        }
        let user = table
            .by_kind(RegionKind::UserMem)
            .ok_or(MemoryError::InvalidLayout(
                "layout must contain exactly one UserMem region",
            ))?;
        *self.lock_allocator() = UserMemAllocator::new(user.start(), user.size());

        regions.table = table;
        regions.initialized = true;
        Ok(())
    }

    fn close_locked(&self, regions: &mut RegionState) {
        if !regions.initialized {
            return;
        }
        info!("closing guest memory");

        regions.table.clear();
        regions.initialized = false;
        self.lock_flags().clear();
        self.lock_allocator().clear();
    }

    /// Creates the SPU raw region for `count` SPUs at the configured base.
    ///
    /// Fails with [`MemoryError::AlreadyInitialized`] if it already exists; the table is left
    /// untouched on any failure.
    pub fn init_spu_raw_mem(&self, count: u32) -> Result<()> {
        let mut regions = self.write_regions();
        if !regions.initialized {
            return Err(MemoryError::NotInitialized);
        }
        if regions.table.by_kind(RegionKind::SpuRawMem).is_some() {
            return Err(MemoryError::AlreadyInitialized {
                kind: RegionKind::SpuRawMem,
            });
        }
        if count == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let size = self
            .options
            .spu_raw_stride
            .checked_mul(u64::from(count))
            .ok_or(MemoryError::InvalidLayout("SPU raw region size overflows u64"))?;

        let region = Region::set_range(RegionKind::SpuRawMem, self.options.spu_raw_base, size)?;
        regions.table.add(region)?;
        debug!(count, base = self.options.spu_raw_base, size, "created SPU raw region");
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Region table & translation
    // ---------------------------------------------------------------------------------------------

    /// Runs `f` against the region table under one shared lock acquisition.
    pub fn with_table<R>(&self, f: impl FnOnce(&RegionTable) -> R) -> R {
        f(&self.read_regions().table)
    }

    /// Registered regions in registration order.
    pub fn regions(&self) -> Vec<RegionSpec> {
        self.read_regions().table.specs()
    }

    pub fn region_count(&self) -> usize {
        self.read_regions().table.len()
    }

    pub fn region(&self, kind: RegionKind) -> Option<RegionSpec> {
        self.read_regions().table.by_kind(kind).map(Region::spec)
    }

    pub fn region_by_index(&self, index: usize) -> Option<RegionSpec> {
        self.read_regions().table.get(index).map(Region::spec)
    }

    /// Region owning guest address `addr`.
    pub fn resolve(&self, addr: u64) -> Result<RegionSpec> {
        self.read_regions().table.resolve(addr).map(Region::spec)
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.read_regions().table.is_mapped(addr)
    }

    /// Returns `true` if a single region holds all of `[addr, addr + size)`.
    pub fn is_range_mapped(&self, addr: u64, size: u64) -> bool {
        self.read_regions().table.is_range_mapped(addr, size)
    }

    /// Host pointer backing `addr`.
    ///
    /// The pointer stays valid until the next `close`/`reset`. Bytes behind it may be accessed
    /// concurrently by other threads.
    pub fn to_host_pointer(&self, addr: u64) -> Result<*mut u8> {
        self.read_regions().table.to_host_pointer(addr)
    }

    pub fn reverse_resolve(&self, host: *const u8) -> Result<u64> {
        self.read_regions().table.reverse_resolve(host)
    }

    // ---------------------------------------------------------------------------------------------
    // Scalar / bulk access
    // ---------------------------------------------------------------------------------------------

    #[inline]
    pub fn read<T: GuestScalar>(&self, addr: u64) -> Result<T> {
        self.read_regions().table.read(addr)
    }

    #[inline]
    pub fn write<T: GuestScalar>(&self, addr: u64, value: T) -> Result<()> {
        self.read_regions().table.write(addr, value)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        self.read(addr)
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        self.read(addr)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        self.read(addr)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        self.read(addr)
    }

    pub fn read_u128(&self, addr: u64) -> Result<u128> {
        self.read(addr)
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, value)
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<()> {
        self.write(addr, value)
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write(addr, value)
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, value)
    }

    pub fn write_u128(&self, addr: u64, value: u128) -> Result<()> {
        self.write(addr, value)
    }

    /// Raw single-byte access at `addr`.
    pub fn byte(&self, addr: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn set_byte(&self, addr: u64, value: u8) -> Result<()> {
        self.write_bytes(addr, &[value])
    }

    /// Raw copy out of guest memory; no byte-order conversion.
    pub fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        self.read_regions().table.load(addr, dst)
    }

    /// Raw copy into guest memory; no byte-order conversion.
    pub fn write_bytes(&self, addr: u64, src: &[u8]) -> Result<()> {
        self.read_regions().table.store(addr, src)
    }

    pub fn read_raw<T: bytemuck::Pod>(&self, addr: u64) -> Result<T> {
        self.read_regions().table.read_raw(addr)
    }

    pub fn write_raw<T: bytemuck::Pod>(&self, addr: u64, value: &T) -> Result<()> {
        self.read_regions().table.write_raw(addr, value)
    }

    pub fn read_cstring(&self, addr: u64) -> Result<Vec<u8>> {
        self.read_regions().table.read_cstring(addr)
    }

    pub fn read_string(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.read_regions().table.read_string(addr, len)
    }

    pub fn write_cstring(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.read_regions().table.write_cstring(addr, bytes)
    }

    /// Typed cursor over guest memory starting at `addr`.
    pub fn cursor<T: GuestScalar>(&self, addr: u64) -> Cursor<'_, T> {
        Cursor::new(self, addr)
    }

    // ---------------------------------------------------------------------------------------------
    // User memory allocator
    // ---------------------------------------------------------------------------------------------

    /// Allocates `size` zeroed bytes of user memory aligned to `align`.
    pub fn alloc(&self, size: u64, align: u64) -> Result<u64> {
        let regions = self.read_regions();
        if !regions.initialized {
            return Err(MemoryError::NotInitialized);
        }
        self.lock_allocator().alloc(&regions.table, size, align)
    }

    /// Releases the allocation at `addr`. Returns `false` (changing nothing) for unknown or
    /// already-freed addresses.
    pub fn free(&self, addr: u64) -> bool {
        self.try_free(addr).is_ok()
    }

    pub fn try_free(&self, addr: u64) -> Result<Allocation> {
        self.lock_allocator().free(addr)
    }

    pub fn coalesce(&self) {
        self.lock_allocator().coalesce();
    }

    pub fn user_mem_total_size(&self) -> u64 {
        self.lock_allocator().total_size()
    }

    pub fn user_mem_available_size(&self) -> u64 {
        self.lock_allocator().available_size()
    }

    /// Snapshot of the outstanding allocations.
    pub fn used_allocations(&self) -> Vec<Allocation> {
        self.lock_allocator().used().to_vec()
    }

    /// Snapshot of the free list.
    pub fn free_allocations(&self) -> Vec<Allocation> {
        self.lock_allocator().free_list().to_vec()
    }

    // ---------------------------------------------------------------------------------------------
    // Memory flags
    // ---------------------------------------------------------------------------------------------

    pub fn add_flag(&self, addr: u64, waddr: u64, id: u64) {
        self.lock_flags().add(addr, waddr, id);
    }

    pub fn lookup_flag(&self, addr: u64) -> Option<(u64, u64)> {
        self.lock_flags().lookup(addr)
    }

    pub fn clear_flags(&self) {
        self.lock_flags().clear();
    }

    pub fn flag_count(&self) -> usize {
        self.lock_flags().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Memory {
        let mem = Memory::with_options(MemoryOptions {
            layout: vec![
                RegionSpec::new(RegionKind::MainRam, 0x1000, 0x1000),
                RegionSpec::new(RegionKind::UserMem, 0x10_0000, 0x1_0000),
            ],
            spu_raw_base: 0x20_0000,
            spu_raw_stride: 0x100,
        })
        .unwrap();
        mem.init().unwrap();
        mem
    }

    #[test]
    fn memory_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Memory>();
    }

    #[test]
    fn uninitialized_memory_maps_nothing() {
        let mem = Memory::new();
        assert!(!mem.is_initialized());
        assert!(!mem.is_mapped(0x2fff_fe00));
        assert!(matches!(
            mem.read_u32(0x2fff_fe00),
            Err(MemoryError::NoMapping { .. })
        ));
        assert_eq!(mem.alloc(0x10, 4).unwrap_err(), MemoryError::NotInitialized);
        assert_eq!(
            mem.init_spu_raw_mem(1).unwrap_err(),
            MemoryError::NotInitialized
        );
        // Reset does not initialize.
        mem.reset().unwrap();
        assert!(!mem.is_initialized());
    }

    #[test]
    fn init_is_idempotent() {
        let mem = small();
        let a = mem.alloc(0x10, 1).unwrap();
        mem.write_u32(a, 7).unwrap();
        mem.init().unwrap();
        assert_eq!(mem.read_u32(a).unwrap(), 7);
        assert_eq!(mem.used_allocations().len(), 1);
    }

    #[test]
    fn close_clears_all_state() {
        let mem = small();
        mem.alloc(0x10, 1).unwrap();
        mem.add_flag(0x1000, 0x1004, 9);
        mem.init_spu_raw_mem(2).unwrap();

        mem.close();
        assert!(!mem.is_initialized());
        assert!(mem.regions().is_empty());
        assert!(mem.used_allocations().is_empty());
        assert!(mem.free_allocations().is_empty());
        assert_eq!(mem.flag_count(), 0);
        assert_eq!(mem.lookup_flag(0x1000), None);

        // Closing twice is harmless.
        mem.close();
    }

    #[test]
    fn reset_restores_fresh_state() {
        let mem = small();
        let a = mem.alloc(0x10, 1).unwrap();
        mem.write_u32(a, 0xdead_beef).unwrap();
        mem.init_spu_raw_mem(1).unwrap();

        mem.reset().unwrap();
        assert!(mem.is_initialized());
        assert_eq!(mem.read_u32(a).unwrap(), 0);
        assert!(mem.region(RegionKind::SpuRawMem).is_none());
        assert_eq!(mem.alloc(0x10, 1).unwrap(), a);
    }

    #[test]
    fn spu_raw_region_is_created_once() {
        let mem = small();
        mem.init_spu_raw_mem(4).unwrap();
        assert_eq!(
            mem.region(RegionKind::SpuRawMem),
            Some(RegionSpec::new(RegionKind::SpuRawMem, 0x20_0000, 0x400))
        );
        let before = mem.regions();
        assert_eq!(
            mem.init_spu_raw_mem(1).unwrap_err(),
            MemoryError::AlreadyInitialized {
                kind: RegionKind::SpuRawMem
            }
        );
        assert_eq!(mem.regions(), before);
        assert!(mem.is_mapped(0x20_03ff));
        assert!(!mem.is_mapped(0x20_0400));
    }

    #[test]
    fn spu_raw_region_overlapping_layout_is_rejected() {
        let mem = Memory::with_options(MemoryOptions {
            layout: vec![RegionSpec::new(RegionKind::UserMem, 0x10_0000, 0x1000)],
            spu_raw_base: 0x10_0800,
            spu_raw_stride: 0x100,
        })
        .unwrap();
        mem.init().unwrap();
        assert!(matches!(
            mem.init_spu_raw_mem(1),
            Err(MemoryError::RegionOverlap { .. })
        ));
        assert_eq!(mem.regions().len(), 1);
    }

    #[test]
    fn raw_byte_access_matches_scalar_layout() {
        let mem = small();
        mem.write_u16(0x1000, 0xabcd).unwrap();
        assert_eq!(mem.byte(0x1000).unwrap(), 0xab);
        assert_eq!(mem.byte(0x1001).unwrap(), 0xcd);
        mem.set_byte(0x1001, 0xef).unwrap();
        assert_eq!(mem.read_u16(0x1000).unwrap(), 0xabef);
        assert!(mem.byte(0x2000).is_err());
    }

    #[test]
    fn host_pointer_is_reverse_resolvable() {
        let mem = small();
        let host = mem.to_host_pointer(0x1234).unwrap();
        assert_eq!(mem.reverse_resolve(host).unwrap(), 0x1234);
        assert_eq!(mem.resolve(0x1234).unwrap().kind, RegionKind::MainRam);
        assert_eq!(mem.region_by_index(1).unwrap().kind, RegionKind::UserMem);
        assert!(mem.region_by_index(2).is_none());
        assert_eq!(mem.region_count(), 2);
    }
}
