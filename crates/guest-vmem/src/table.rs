//! Region table and guest ↔ host address translation.

use crate::error::{MemoryError, Result};
use crate::layout::{RegionKind, RegionSpec};
use crate::region::Region;

/// Registered regions, in registration order.
///
/// Resolution is first-match in registration order: a guest address belongs to the first region
/// whose interval contains it, even when a later region also covers it.
#[derive(Debug, Default)]
pub struct RegionTable {
    regions: Vec<Region>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Region by registration index.
    pub fn get(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    pub fn by_kind(&self, kind: RegionKind) -> Option<&Region> {
        self.regions.iter().find(|r| r.kind() == kind)
    }

    /// Registers a fixed-layout region without overlap validation.
    pub(crate) fn push_fixed(&mut self, region: Region) {
        self.regions.push(region);
    }

    /// Registers an additional region.
    ///
    /// The region must not share its kind with, or overlap, any region already registered. On
    /// failure the table is unchanged.
    pub fn add(&mut self, region: Region) -> Result<()> {
        let spec = region.spec();
        if self.by_kind(spec.kind).is_some() {
            return Err(MemoryError::AlreadyInitialized { kind: spec.kind });
        }
        let overlaps = self
            .regions
            .iter()
            .any(|r| r.start() < spec.end() && spec.start < r.end());
        if overlaps {
            return Err(MemoryError::RegionOverlap {
                kind: spec.kind,
                start: spec.start,
                size: spec.size,
            });
        }
        self.regions.push(region);
        Ok(())
    }

    /// Drops every region, releasing its backing storage.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn specs(&self) -> Vec<RegionSpec> {
        self.regions.iter().map(Region::spec).collect()
    }

    /// Region owning `addr`.
    pub fn resolve(&self, addr: u64) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.contains(addr))
            .ok_or(MemoryError::NoMapping { addr, len: 1 })
    }

    /// Region owning `addr`, which must also contain the whole `[addr, addr + len)`.
    ///
    /// The owning region is chosen by `addr` alone; a range that starts in one region and runs
    /// into another is unmapped even when the two regions are contiguous.
    pub fn resolve_range(&self, addr: u64, len: u64) -> Result<&Region> {
        let region = self
            .resolve(addr)
            .map_err(|_| MemoryError::NoMapping { addr, len })?;
        if region.contains_range(addr, len) {
            Ok(region)
        } else {
            Err(MemoryError::NoMapping { addr, len })
        }
    }

    #[inline]
    pub fn is_mapped(&self, addr: u64) -> bool {
        self.resolve(addr).is_ok()
    }

    /// Returns `true` if `[addr, addr + size)` is backed by a single region.
    #[inline]
    pub fn is_range_mapped(&self, addr: u64, size: u64) -> bool {
        self.resolve_range(addr, size).is_ok()
    }

    pub fn to_host_pointer(&self, addr: u64) -> Result<*mut u8> {
        let region = self.resolve(addr)?;
        region
            .host_pointer_for(addr)
            .ok_or(MemoryError::NoMapping { addr, len: 1 })
    }

    /// Guest address backed by the host pointer `host`.
    pub fn reverse_resolve(&self, host: *const u8) -> Result<u64> {
        self.regions
            .iter()
            .find_map(|r| r.guest_address_for(host))
            .ok_or(MemoryError::UnknownHostPointer {
                host: host as usize,
            })
    }

    pub fn load(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.resolve_range(addr, dst.len() as u64)?.load(addr, dst)
    }

    pub fn store(&self, addr: u64, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.resolve_range(addr, src.len() as u64)?.store(addr, src)
    }

    pub fn fill(&self, addr: u64, len: u64, value: u8) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.resolve_range(addr, len)?.fill(addr, len, value)
    }
}
