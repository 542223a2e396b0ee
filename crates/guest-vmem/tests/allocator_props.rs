#![cfg(not(target_arch = "wasm32"))]

use guest_vmem::{Allocation, Memory, MemoryError, MemoryOptions, RegionKind, RegionSpec};
use proptest::prelude::*;

const BASE: u64 = 0x10_0000;
const SIZE: u64 = 0x4000;

#[derive(Clone, Debug)]
enum Op {
    Alloc { size: u64, align_shift: u32 },
    Free { pick: usize },
    FreeUnknown { offset: u64 },
    Write { pick: usize, value: u32 },
    Coalesce,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..0x300, 0u32..7).prop_map(|(size, align_shift)| Op::Alloc { size, align_shift }),
        3 => any::<usize>().prop_map(|pick| Op::Free { pick }),
        1 => (0u64..SIZE).prop_map(|offset| Op::FreeUnknown { offset }),
        2 => (any::<usize>(), any::<u32>()).prop_map(|(pick, value)| Op::Write { pick, value }),
        1 => Just(Op::Coalesce),
    ]
}

fn new_mem() -> Memory {
    let mem = Memory::with_options(MemoryOptions {
        layout: vec![RegionSpec::new(RegionKind::UserMem, BASE, SIZE)],
        ..MemoryOptions::default()
    })
    .unwrap();
    mem.init().unwrap();
    mem
}

fn assert_disjoint(mut descs: Vec<Allocation>) {
    descs.sort_unstable_by_key(|d| d.addr);
    for pair in descs.windows(2) {
        assert!(
            pair[0].end() <= pair[1].addr,
            "descriptors overlap: {:?} / {:?}",
            pair[0],
            pair[1]
        );
    }
}

fn check_invariants(mem: &Memory) {
    let used = mem.used_allocations();
    let free = mem.free_allocations();

    let used_total: u64 = used.iter().map(|a| a.size).sum();
    let free_total: u64 = free.iter().map(|a| a.size).sum();
    assert!(used_total + free_total <= SIZE);
    assert_eq!(mem.user_mem_available_size(), SIZE - used_total);

    for d in used.iter().chain(free.iter()) {
        assert!(d.size > 0);
        assert!(d.addr >= BASE && d.end() <= BASE + SIZE);
    }

    // Free list stays sorted and merged.
    for pair in free.windows(2) {
        assert!(pair[0].end() < pair[1].addr);
    }

    let mut all = used;
    all.extend(free);
    assert_disjoint(all);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_alloc_free_sequences_keep_the_lists_consistent(
        ops in proptest::collection::vec(arb_op(), 1..96),
    ) {
        let mem = new_mem();
        let mut live: Vec<(Allocation, Option<u32>)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc { size, align_shift } => {
                    let align = 1u64 << align_shift;
                    match mem.alloc(size, align) {
                        Ok(addr) => {
                            prop_assert_eq!(addr % align, 0);
                            let mut bytes = vec![0xffu8; size as usize];
                            mem.read_bytes(addr, &mut bytes).unwrap();
                            prop_assert!(bytes.iter().all(|b| *b == 0), "allocation not zeroed");
                            live.push((Allocation::new(addr, size), None));
                        }
                        Err(MemoryError::OutOfMemory { requested, available }) => {
                            prop_assert_eq!(requested, size);
                            prop_assert!(available < size);
                        }
                        Err(MemoryError::AddressSpaceExhausted { .. }) => {}
                        Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                    }
                }
                Op::Free { pick } => {
                    if !live.is_empty() {
                        let (desc, _) = live.remove(pick % live.len());
                        prop_assert_eq!(mem.try_free(desc.addr).unwrap(), desc);
                    }
                }
                Op::FreeUnknown { offset } => {
                    let addr = BASE + offset;
                    if live.iter().all(|(d, _)| d.addr != addr) {
                        let used = mem.used_allocations();
                        let free = mem.free_allocations();
                        prop_assert!(!mem.free(addr));
                        prop_assert_eq!(mem.used_allocations(), used);
                        prop_assert_eq!(mem.free_allocations(), free);
                    }
                }
                Op::Write { pick, value } => {
                    if !live.is_empty() {
                        let i = pick % live.len();
                        let (desc, tag) = &mut live[i];
                        if desc.size >= 4 {
                            mem.write_u32(desc.addr, value).unwrap();
                            *tag = Some(value);
                        }
                    }
                }
                Op::Coalesce => {
                    let before = mem.free_allocations();
                    mem.coalesce();
                    prop_assert_eq!(mem.free_allocations(), before);
                }
            }
            check_invariants(&mem);
        }

        // Writes into one allocation never leak into another.
        for (desc, tag) in &live {
            if let Some(value) = tag {
                prop_assert_eq!(mem.read_u32(desc.addr).unwrap(), *value);
            }
        }

        // Releasing everything leaves one free interval covering what was handed out.
        for (desc, _) in &live {
            prop_assert!(mem.free(desc.addr));
        }
        prop_assert!(mem.used_allocations().is_empty());
        prop_assert!(mem.free_allocations().len() <= 1);
        if let Some(run) = mem.free_allocations().first() {
            prop_assert_eq!(run.addr, BASE);
        }
    }

    #[test]
    fn scalar_values_round_trip_big_endian(
        offset in 0u64..(SIZE - 16),
        v8 in any::<u8>(),
        v16 in any::<u16>(),
        v32 in any::<u32>(),
        v64 in any::<u64>(),
        v128 in any::<u128>(),
    ) {
        let mem = new_mem();
        let addr = BASE + offset;

        mem.write_u8(addr, v8).unwrap();
        prop_assert_eq!(mem.read_u8(addr).unwrap(), v8);

        mem.write_u16(addr, v16).unwrap();
        prop_assert_eq!(mem.read_u16(addr).unwrap(), v16);
        prop_assert_eq!(mem.byte(addr).unwrap(), v16.to_be_bytes()[0]);

        mem.write_u32(addr, v32).unwrap();
        prop_assert_eq!(mem.read_u32(addr).unwrap(), v32);

        mem.write_u64(addr, v64).unwrap();
        prop_assert_eq!(mem.read_u64(addr).unwrap(), v64);

        mem.write_u128(addr, v128).unwrap();
        prop_assert_eq!(mem.read_u128(addr).unwrap(), v128);
        let mut raw = [0u8; 16];
        mem.read_bytes(addr, &mut raw).unwrap();
        prop_assert_eq!(raw, v128.to_be_bytes());
    }
}
