use thiserror::Error;

use crate::layout::RegionKind;

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors returned by the guest address-space manager.
///
/// None of these are fatal from the memory subsystem's point of view. Callers (the CPU engine, the
/// emulated OS runtime) decide whether a given failure ends the emulated session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The guest range `[addr, addr + len)` is not covered by a single registered region.
    #[error("no mapping for guest range: addr=0x{addr:x} len={len}")]
    NoMapping { addr: u64, len: u64 },

    /// A host pointer does not fall inside any region's backing buffer.
    #[error("host pointer 0x{host:x} does not belong to guest memory")]
    UnknownHostPointer { host: usize },

    /// The user-memory region does not have enough unused bytes left for the request.
    #[error("not enough free user memory: requested=0x{requested:x} available=0x{available:x}")]
    OutOfMemory { requested: u64, available: u64 },

    /// The bump frontier cannot grow by `size` bytes without leaving the user-memory region.
    #[error("user memory address space exhausted: addr=0x{addr:x} size=0x{size:x}")]
    AddressSpaceExhausted { addr: u64, size: u64 },

    /// `free` was called with an address that is not an outstanding allocation.
    #[error("address 0x{addr:x} is not an outstanding user memory allocation")]
    UnknownAddress { addr: u64 },

    #[error("{kind} region is already initialized")]
    AlreadyInitialized { kind: RegionKind },

    #[error("guest memory is not initialized")]
    NotInitialized,

    #[error("invalid allocation alignment {align} (expected a power of two)")]
    InvalidAlignment { align: u64 },

    #[error("zero-sized request")]
    InvalidSize,

    #[error("{kind} region overlaps an existing region: start=0x{start:x} size=0x{size:x}")]
    RegionOverlap { kind: RegionKind, start: u64, size: u64 },

    #[error("invalid region layout: {0}")]
    InvalidLayout(&'static str),

    /// The host could not provide backing storage for a region.
    #[error("failed to allocate {size} bytes of host backing storage")]
    HostAllocation { size: u64 },
}
