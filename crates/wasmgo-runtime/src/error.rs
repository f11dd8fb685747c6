//! Error types for the host bridge.

use thiserror::Error;

/// Errors surfaced to the embedding host.
///
/// Errors raised *inside* an import handler on behalf of the guest (a thrown
/// reflective call, a bad `copyBytes*` operand) are never represented here:
/// they are converted to status bytes in guest memory per the ABI. `VmError`
/// covers the host-facing failures only.
#[derive(Debug, Error)]
pub enum VmError {
    /// A driver operation was attempted before `load_module`.
    #[error("no module loaded")]
    ModuleNotLoaded,

    /// `resume` was invoked after the guest called `wasmExit`.
    #[error("bad callback: instance already exited")]
    AlreadyExited,

    /// argv + environment exceed the 8192-byte window above the 4096 floor.
    #[error("arguments/environment too large: {0} bytes past the data floor")]
    ArgumentOverflow(usize),

    /// The guest returned from `run` without exiting, with no timer
    /// registered and no event in flight. Nothing can ever wake it.
    #[error("guest parked with no pending events or timers")]
    Deadlock,

    /// A required export (`mem`, `run`, `resume`, `getsp`) is missing or has
    /// the wrong shape.
    #[error("missing or mistyped module export: {0}")]
    Export(#[from] wasmer::ExportError),

    /// Linear-memory access outside the guest's current bounds.
    #[error("linear memory access: {0}")]
    Memory(#[from] wasmer::MemoryAccessError),

    /// The module failed to compile.
    #[error("module compilation: {0}")]
    Compile(#[from] wasmer::CompileError),

    /// The module failed to instantiate against the `go` import table.
    #[error("module instantiation: {0}")]
    Instantiation(#[from] wasmer::InstantiationError),

    /// The guest trapped, or a host-fatal condition was raised inside an
    /// import handler.
    #[error("guest trap: {0}")]
    Trap(#[from] wasmer::RuntimeError),
}
