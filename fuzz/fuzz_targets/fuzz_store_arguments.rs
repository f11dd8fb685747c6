//! Fuzz target: argv/env serialisation into guest memory
//!
//! Feeds arbitrary argument vectors and environments to the argument
//! writer and verifies:
//! 1. No panics on any input
//! 2. Success implies an 8-byte-aligned argv inside the argument window
//! 3. Failure is only ever the overflow error
//!
//! Run: cargo +nightly fuzz run fuzz_store_arguments -- -max_len=16384

#![no_main]
use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use wasmgo_runtime::args::store_arguments;
use wasmgo_runtime::error::VmError;
use wasmgo_runtime::mem::MemView;
use wasmer::{Memory, MemoryType, Store};

#[derive(Arbitrary, Debug)]
struct Input {
    args: Vec<String>,
    env: Vec<(String, String)>,
}

fuzz_target!(|input: Input| {
    let mut store = Store::default();
    let memory = match Memory::new(&mut store, MemoryType::new(1, None, false)) {
        Ok(m) => m,
        Err(_) => return,
    };
    let mut mem = MemView::default();
    mem.bind(memory);

    let env: BTreeMap<String, String> = input.env.into_iter().collect();
    match store_arguments(&mem, &store, &input.args, &env) {
        Ok((argc, argv)) => {
            assert_eq!(argc as usize, input.args.len());
            assert!(argv >= 4096);
            assert!((argv as u64) < 4096 + 8192);
            assert_eq!(argv % 8, 0);
        }
        Err(VmError::ArgumentOverflow(_)) => {}
        Err(other) => panic!("unexpected error: {}", other),
    }
});
