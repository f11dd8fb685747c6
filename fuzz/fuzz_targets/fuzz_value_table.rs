//! Fuzz target: value table reference counting and id recycling
//!
//! Drives an arbitrary sequence of store / finalize operations and checks
//! the table's invariants after every step:
//! 1. Live ids are never in the free list
//! 2. Seeded ids (0..=6) are never collected
//! 3. Stored values round-trip through their encoding
//!
//! Run: cargo +nightly fuzz run fuzz_value_table

#![no_main]
use libfuzzer_sys::fuzz_target;
use wasmgo_runtime::values::{Encoded, Value, ValueTable};

fuzz_target!(|data: &[u8]| {
    let mut table = ValueTable::default();
    let mut live: Vec<(u32, Value)> = Vec::new();

    for chunk in data.chunks(2) {
        let op = chunk[0] % 4;
        let operand = chunk.get(1).copied().unwrap_or(0);
        match op {
            0 => {
                let v = Value::object("Object");
                if let Encoded::Ref { id, .. } = table.store(&v) {
                    live.push((id, v));
                }
            }
            1 => {
                let v = Value::str(format!("s{}", operand));
                if let Encoded::Ref { id, .. } = table.store(&v) {
                    live.push((id, v));
                }
            }
            2 => {
                if !live.is_empty() {
                    let (id, _) = live.swap_remove(operand as usize % live.len());
                    table.remove_ref(id);
                }
            }
            _ => {
                // take another reference to an already-live value
                if !live.is_empty() {
                    let (_, v) = live[operand as usize % live.len()].clone();
                    if let Encoded::Ref { id, .. } = table.store(&v) {
                        live.push((id, v));
                    }
                }
            }
        }

        for (id, v) in &live {
            assert!(table.is_live(*id), "live id {} was collected", id);
            let bits = Encoded::Ref {
                id: *id,
                type_flag: v.type_flag(),
            }
            .bits();
            assert!(table.load(bits).same(v), "id {} decoded to a different value", id);
        }
        for id in 0..=6u32 {
            assert!(table.is_live(id), "seeded id {} was collected", id);
        }
    }
});
