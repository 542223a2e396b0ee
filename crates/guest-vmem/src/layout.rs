//! Guest address-space layout constants and configuration.
//!
//! The default layout is the fixed region table dependent guest software expects. It is kept
//! verbatim, including the places where regions overlap:
//!
//! - MainRam: `[0x0000_0001 .. 0x1000_0001)` (its last byte is also the first byte of UnkMem)
//! - GcmReportIoAddressMem / GcmNotifyIoAddressMem lie entirely inside MainRam
//!
//! Address resolution is first-match in registration order, so MainRam shadows those ranges.

use core::fmt;

use crate::error::{MemoryError, Result};

/// Main RAM base address.
pub const MAIN_RAM_BASE: u64 = 0x0000_0001;
/// Main RAM size (256 MB).
pub const MAIN_RAM_SIZE: u64 = 0x1000_0000;

pub const UNK_MEM_BASE: u64 = 0x1000_0000;
pub const UNK_MEM_SIZE: u64 = 0x0010_0000;

/// Base of the dynamically allocated user memory region.
pub const USER_MEM_BASE: u64 = 0x2fff_fe00;
pub const USER_MEM_SIZE: u64 = 0x0d50_0000;

pub const VIDEO_MEM_BASE: u64 = 0x4000_0000;
/// Video memory size (16 MB).
pub const VIDEO_MEM_SIZE: u64 = 0x0100_0000;

pub const GCM_REPORT_IO_BASE: u64 = 0x0e00_0000;
/// GCM report IO window size (16 MB).
pub const GCM_REPORT_IO_SIZE: u64 = 0x0100_0000;

pub const GCM_NOTIFY_IO_BASE: u64 = 0x0f10_0000;
/// GCM notify IO window size (512 B).
pub const GCM_NOTIFY_IO_SIZE: u64 = 0x0000_0200;

/// Base of the on-demand SPU raw region.
pub const SPU_RAW_BASE: u64 = 0xe000_0000;
/// Bytes reserved per raw SPU.
pub const SPU_RAW_STRIDE: u64 = 0x0010_0000;

/// Named guest regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    MainRam,
    UnkMem,
    UserMem,
    VideoMem,
    GcmReportIoAddressMem,
    GcmNotifyIoAddressMem,
    SpuRawMem,
}

impl RegionKind {
    pub const fn name(self) -> &'static str {
        match self {
            RegionKind::MainRam => "MainRam",
            RegionKind::UnkMem => "UnkMem",
            RegionKind::UserMem => "UserMem",
            RegionKind::VideoMem => "VideoMem",
            RegionKind::GcmReportIoAddressMem => "GcmReportIoAddressMem",
            RegionKind::GcmNotifyIoAddressMem => "GcmNotifyIoAddressMem",
            RegionKind::SpuRawMem => "SpuRawMem",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A region's placement in the guest address space.
///
/// Also used as a plain-data snapshot of a live region, since region references cannot outlive
/// the lock guarding the region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionSpec {
    pub kind: RegionKind,
    pub start: u64,
    pub size: u64,
}

impl RegionSpec {
    pub const fn new(kind: RegionKind, start: u64, size: u64) -> Self {
        Self { kind, start, size }
    }

    /// Exclusive end address. Saturates instead of wrapping.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    #[inline]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// The fixed region table registered at init, in registration order.
pub const FIXED_LAYOUT: [RegionSpec; 6] = [
    RegionSpec::new(RegionKind::MainRam, MAIN_RAM_BASE, MAIN_RAM_SIZE),
    RegionSpec::new(RegionKind::UnkMem, UNK_MEM_BASE, UNK_MEM_SIZE),
    RegionSpec::new(RegionKind::UserMem, USER_MEM_BASE, USER_MEM_SIZE),
    RegionSpec::new(RegionKind::VideoMem, VIDEO_MEM_BASE, VIDEO_MEM_SIZE),
    RegionSpec::new(
        RegionKind::GcmReportIoAddressMem,
        GCM_REPORT_IO_BASE,
        GCM_REPORT_IO_SIZE,
    ),
    RegionSpec::new(
        RegionKind::GcmNotifyIoAddressMem,
        GCM_NOTIFY_IO_BASE,
        GCM_NOTIFY_IO_SIZE,
    ),
];

/// Configuration for a [`crate::Memory`] context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOptions {
    /// Regions registered by `init`, in registration (and therefore resolution) order.
    pub layout: Vec<RegionSpec>,
    /// Base address of the on-demand SPU raw region.
    pub spu_raw_base: u64,
    /// Bytes reserved per raw SPU in the on-demand region.
    pub spu_raw_stride: u64,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            layout: FIXED_LAYOUT.to_vec(),
            spu_raw_base: SPU_RAW_BASE,
            spu_raw_stride: SPU_RAW_STRIDE,
        }
    }
}

impl MemoryOptions {
    /// Checks the structural requirements the rest of the crate relies on.
    ///
    /// Overlap between layout regions is *not* rejected (the default layout has some); see the
    /// module docs.
    pub fn validate(&self) -> Result<()> {
        let mut user_regions = 0usize;
        for (i, spec) in self.layout.iter().enumerate() {
            if spec.size == 0 {
                return Err(MemoryError::InvalidLayout("region size must be non-zero"));
            }
            // Address 0 must never be a valid guest address so it can never be handed out by the
            // allocator.
            if spec.start == 0 {
                return Err(MemoryError::InvalidLayout("no region may start at address 0"));
            }
            if spec.start.checked_add(spec.size).is_none() {
                return Err(MemoryError::InvalidLayout("region end overflows u64"));
            }
            if spec.kind == RegionKind::SpuRawMem {
                return Err(MemoryError::InvalidLayout(
                    "SpuRawMem is created on demand, not by the init layout",
                ));
            }
            if self.layout[..i].iter().any(|prev| prev.kind == spec.kind) {
                return Err(MemoryError::InvalidLayout("duplicate region kind"));
            }
            if spec.kind == RegionKind::UserMem {
                user_regions += 1;
            }
        }
        if user_regions != 1 {
            return Err(MemoryError::InvalidLayout(
                "layout must contain exactly one UserMem region",
            ));
        }
        if self.spu_raw_base == 0 || self.spu_raw_stride == 0 {
            return Err(MemoryError::InvalidLayout(
                "SPU raw base and stride must be non-zero",
            ));
        }
        Ok(())
    }
}
