//! Serialises argv and the environment into guest memory.
//!
//! The guest's data section owns `[0, 4096)`. Command-line and environment
//! strings are written from 4096 upward, each NUL-terminated and 8-byte
//! aligned, followed by the argv pointer array (one 64-bit slot per entry,
//! zero-terminated) and the envp pointer array (likewise). Everything must
//! fit below 4096 + 8192, where the guest expects its own data to start.

use std::collections::BTreeMap;

use wasmer::AsStoreRef;

use crate::error::VmError;
use crate::mem::MemView;

/// First byte available for argument strings.
const ARGS_FLOOR: u64 = 4096;
/// First byte the guest claims for itself; arguments must end below it.
const DATA_CEILING: u64 = 4096 + 8192;

/// Write `args` and `env` into guest memory, returning `(argc, argv)` for
/// the guest's `run` export.
///
/// Environment entries are written as `KEY=VALUE` in lexicographic key
/// order; a `BTreeMap` input makes that ordering inherent.
pub fn store_arguments(
    mem: &MemView,
    store: &impl AsStoreRef,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> Result<(i32, i32), VmError> {
    let mut offset = ARGS_FLOOR;

    let write_str = |offset: &mut u64, s: &str| -> Result<u64, VmError> {
        let ptr = *offset;
        mem.write_bytes(store, *offset, s.as_bytes())?;
        mem.set_u8(store, *offset + s.len() as u64, 0)?;
        *offset += s.len() as u64 + 1;
        if *offset % 8 != 0 {
            *offset += 8 - *offset % 8;
        }
        Ok(ptr)
    };

    let argc = args.len() as i32;
    let mut ptrs: Vec<u64> = Vec::with_capacity(args.len() + env.len() + 2);
    for arg in args {
        ptrs.push(write_str(&mut offset, arg)?);
    }
    ptrs.push(0);
    for (key, value) in env {
        ptrs.push(write_str(&mut offset, &format!("{}={}", key, value))?);
    }
    ptrs.push(0);

    let argv = offset;
    for ptr in &ptrs {
        mem.set_u32(store, offset, *ptr as u32)?;
        mem.set_u32(store, offset + 4, 0)?;
        offset += 8;
    }

    if offset >= DATA_CEILING {
        return Err(VmError::ArgumentOverflow((offset - ARGS_FLOOR) as usize));
    }

    Ok((argc, argv as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmer::{Memory, MemoryType, Store};

    fn scratch() -> (Store, MemView) {
        let mut store = Store::default();
        let memory = Memory::new(&mut store, MemoryType::new(1, None, false)).unwrap();
        let mut mem = MemView::default();
        mem.bind(memory);
        (store, mem)
    }

    fn cstr_at(mem: &MemView, store: &Store, ptr: u64) -> String {
        let mut out = Vec::new();
        let mut addr = ptr;
        loop {
            let b = mem.get_u8(store, addr).unwrap();
            if b == 0 {
                break;
            }
            out.push(b);
            addr += 1;
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_layout_argv_then_sorted_env() {
        let (store, mem) = scratch();
        let args = vec!["js".to_string(), "hello".to_string()];
        let mut env = BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());

        let (argc, argv) = store_arguments(&mem, &store, &args, &env).unwrap();
        assert_eq!(argc, 2);
        let argv = argv as u64;
        assert!(argv >= ARGS_FLOOR);

        // argv entries, then the terminating zero
        let p0 = mem.get_u32(&store, argv).unwrap() as u64;
        let p1 = mem.get_u32(&store, argv + 8).unwrap() as u64;
        assert_eq!(mem.get_u32(&store, argv + 16).unwrap(), 0);
        assert_eq!(p0, ARGS_FLOOR);
        assert_eq!(p0 % 8, 0);
        assert_eq!(p1 % 8, 0);
        assert_eq!(cstr_at(&mem, &store, p0), "js");
        assert_eq!(cstr_at(&mem, &store, p1), "hello");

        // envp entries sorted by key, then the terminating zero
        let e0 = mem.get_u32(&store, argv + 24).unwrap() as u64;
        let e1 = mem.get_u32(&store, argv + 32).unwrap() as u64;
        assert_eq!(mem.get_u32(&store, argv + 40).unwrap(), 0);
        assert_eq!(cstr_at(&mem, &store, e0), "A=1");
        assert_eq!(cstr_at(&mem, &store, e1), "B=2");

        // every pointer slot's high word is zero
        for slot in 0..6 {
            assert_eq!(mem.get_u32(&store, argv + slot * 8 + 4).unwrap(), 0);
        }
    }

    #[test]
    fn test_empty_args_and_env() {
        let (store, mem) = scratch();
        let (argc, argv) = store_arguments(&mem, &store, &[], &BTreeMap::new()).unwrap();
        assert_eq!(argc, 0);
        // two terminating zero slots and nothing else
        assert_eq!(argv as u64, ARGS_FLOOR);
        assert_eq!(mem.get_u32(&store, argv as u64).unwrap(), 0);
        assert_eq!(mem.get_u32(&store, argv as u64 + 8).unwrap(), 0);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let (store, mem) = scratch();
        let args = vec!["x".repeat(9000)];
        let err = store_arguments(&mem, &store, &args, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, VmError::ArgumentOverflow(_)));
    }

    #[test]
    fn test_overflow_boundary_is_exclusive() {
        let (store, mem) = scratch();
        // One string padded so strings + pointer slots land exactly on the
        // ceiling: 8176 string bytes + 3 pointer slots = 8200 > 8192.
        let args = vec!["x".repeat(8175)];
        assert!(store_arguments(&mem, &store, &args, &BTreeMap::new()).is_err());

        // Comfortably below the ceiling succeeds.
        let args = vec!["x".repeat(8000)];
        assert!(store_arguments(&mem, &store, &args, &BTreeMap::new()).is_ok());
    }
}
