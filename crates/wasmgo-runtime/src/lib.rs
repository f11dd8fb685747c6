// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WASMGO - HOST BRIDGE RUNTIME
//
// Embedder for WebAssembly modules built with the Go toolchain.
// - Wasmer runtime with Cranelift compiler
// - Byte-exact `go` import ABI: operands at fixed stack-pointer offsets
// - NaN-boxed value table bridging guest handles to host values
// - Cooperative event loop: run, timer-driven resume, exit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

//! A guest compiled for this ABI expects the host to provide time,
//! randomness, timers, console output, and a reflective value bridge under
//! the `go` import namespace, and exposes linear memory `mem` plus the
//! entry points `run(argc, argv)`, `resume()` and `getsp()`.
//!
//! [`Runtime`] is the embedder surface: load a module, hand it argv and an
//! environment, and await the guest's exit code.

// Argument serialisation into guest memory
pub mod args;
// Console output buffering and sinks
pub mod console;
// Host-facing error kinds
pub mod error;
// Little-endian typed access to guest linear memory
pub mod mem;
// Value model, reference table, NaN-box encoding
pub mod values;

// The ambient host surface (global, fs, process, constructors)
mod builtins;
// The `go` import table and reflective call machinery
mod imports;
// The instance driver and event loop
pub mod runtime;
// Timeout scheduling
mod timers;

pub use console::OutputSink;
pub use error::VmError;
pub use runtime::Runtime;
pub use values::Value;
