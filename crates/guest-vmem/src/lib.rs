//! Guest virtual address space for a big-endian 32-bit target.
//!
//! The guest address space is a set of named [`Region`]s, each backed by its own host buffer.
//! [`Memory`] is the per-session context that owns them and exposes:
//!
//! - address translation (guest → region → host pointer, and host pointer → guest address)
//! - endian-correct scalar access (guest memory holds big-endian values) and raw bulk copies
//! - a first-fit / bump allocator for the `UserMem` region ([`UserMemAllocator`])
//! - an address-keyed flags registry used for address-triggered notifications ([`MemoryFlags`])
//! - typed cursors ([`Cursor`]) for sequential or indexed access from consumer code
//!
//! Every failure is reported as a [`MemoryError`]; nothing in this crate aborts the process.

mod access;
mod alloc;
mod cursor;
mod error;
mod flags;
mod layout;
mod memory;
mod region;
mod table;

pub use access::{align_up, GuestScalar};
pub use alloc::{Allocation, UserMemAllocator};
pub use cursor::{Cursor, Cursor128, Cursor16, Cursor32, Cursor64, Cursor8};
pub use error::{MemoryError, Result};
pub use flags::{MemoryFlag, MemoryFlags};
pub use layout::{
    MemoryOptions, RegionKind, RegionSpec, FIXED_LAYOUT, GCM_NOTIFY_IO_BASE, GCM_NOTIFY_IO_SIZE,
    GCM_REPORT_IO_BASE, GCM_REPORT_IO_SIZE, MAIN_RAM_BASE, MAIN_RAM_SIZE, SPU_RAW_BASE,
    SPU_RAW_STRIDE, UNK_MEM_BASE, UNK_MEM_SIZE, USER_MEM_BASE, USER_MEM_SIZE, VIDEO_MEM_BASE,
    VIDEO_MEM_SIZE,
};
pub use memory::Memory;
pub use region::Region;
pub use table::RegionTable;
