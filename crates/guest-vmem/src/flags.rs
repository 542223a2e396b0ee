//! Address-keyed side table for address-triggered notifications.
//!
//! The registry only stores associations. What happens when a guest touches a flagged address
//! (e.g. signalling an emulated synchronization primitive) is up to the consumer.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryFlag {
    /// Watched guest address.
    pub addr: u64,
    /// Guest address the consumer writes back to when the flag fires.
    pub waddr: u64,
    pub id: u64,
}

/// Flag entries in insertion order.
///
/// Entries can only be removed all at once via [`MemoryFlags::clear`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFlags {
    entries: Vec<MemoryFlag>,
}

impl MemoryFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Duplicate addresses are allowed; the earliest wins on lookup.
    pub fn add(&mut self, addr: u64, waddr: u64, id: u64) {
        self.entries.push(MemoryFlag { addr, waddr, id });
    }

    /// `(waddr, id)` of the first entry watching `addr`.
    pub fn lookup(&self, addr: u64) -> Option<(u64, u64)> {
        self.entries
            .iter()
            .find(|f| f.addr == addr)
            .map(|f| (f.waddr, f.id))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryFlag> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_first_match_in_insertion_order() {
        let mut flags = MemoryFlags::new();
        flags.add(0x1000, 0x2000, 1);
        flags.add(0x1004, 0x2004, 2);
        flags.add(0x1000, 0x3000, 3);

        assert_eq!(flags.len(), 3);
        assert_eq!(flags.lookup(0x1000), Some((0x2000, 1)));
        assert_eq!(flags.lookup(0x1004), Some((0x2004, 2)));
        assert_eq!(flags.lookup(0x1008), None);
    }

    #[test]
    fn clear_drops_everything() {
        let mut flags = MemoryFlags::new();
        flags.add(0x1000, 0x2000, 1);
        flags.add(0x1000, 0x2000, 1);
        flags.clear();
        assert!(flags.is_empty());
        assert_eq!(flags.lookup(0x1000), None);
    }
}
