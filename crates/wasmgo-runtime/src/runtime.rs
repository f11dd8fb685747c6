//! Instance driver: module lifecycle and the host event loop.
//!
//! The driver compiles and instantiates the guest, seeds argv/env into its
//! linear memory, invokes the `run` export, and then pumps timer events —
//! each delivered as a `resume` into the guest — until the guest calls
//! `wasmExit`. The guest owns the thread while it runs; the host only
//! regains control inside import calls and between events.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::warn;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use wasmer::{FunctionEnv, Instance, Module, Store, TypedFunction};
use wasmer_compiler_cranelift::Cranelift;

use crate::args;
use crate::builtins;
use crate::console::{ConsoleBuffer, OutputSink};
use crate::error::VmError;
use crate::imports;
use crate::mem::MemView;
use crate::timers::TimerRegistry;
use crate::values::{Value, ValueTable};

/// The guest exports the host drives.
#[derive(Clone)]
pub(crate) struct GuestExports {
    pub(crate) run: TypedFunction<(i32, i32), ()>,
    pub(crate) resume: TypedFunction<(), ()>,
    pub(crate) getsp: TypedFunction<(), i32>,
}

/// Per-instance state stored in the wasmer `FunctionEnv`.
///
/// `mem` and `exports` are bound once at load; everything mutable during a
/// run lives behind `shared`, which import handlers lock only briefly and
/// never across a call back into the guest.
pub struct HostState {
    pub(crate) mem: MemView,
    pub(crate) exports: Option<GuestExports>,
    pub(crate) shared: Arc<Mutex<HostData>>,
}

/// Mutable host data for one instance run.
pub(crate) struct HostData {
    pub(crate) values: ValueTable,
    pub(crate) timers: TimerRegistry,
    pub(crate) console: ConsoleBuffer,
    pub(crate) exited: bool,
    pub(crate) exit_code: i32,
    pub(crate) global: Value,
    pub(crate) runtime_self: Value,
    /// Wall-clock milliseconds when this instance was created.
    pub(crate) time_origin_ms: f64,
    pub(crate) started: Instant,
}

/// Embedder-facing driver for one guest instance.
///
/// ```no_run
/// # async fn demo() -> Result<(), wasmgo_runtime::VmError> {
/// use std::collections::BTreeMap;
/// use wasmgo_runtime::Runtime;
///
/// let mut runtime = Runtime::new();
/// runtime.load_module(&std::fs::read("program.wasm").unwrap())?;
/// let code = runtime
///     .run(&["js".to_string()], &BTreeMap::new())
///     .await?;
/// assert_eq!(code, 0);
/// # Ok(())
/// # }
/// ```
pub struct Runtime {
    store: Store,
    env: FunctionEnv<HostState>,
    instance: Option<Instance>,
    shared: Arc<Mutex<HostData>>,
    events: UnboundedReceiver<i32>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_sink(OutputSink::Stdout)
    }

    /// A runtime whose console output goes to `sink` instead of stdout.
    pub fn with_sink(sink: OutputSink) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let (global, runtime_self) = builtins::make_world();
        let shared = Arc::new(Mutex::new(HostData {
            values: ValueTable::new(global.clone(), runtime_self.clone()),
            timers: TimerRegistry::new(tx),
            console: ConsoleBuffer::new(sink),
            exited: false,
            exit_code: 0,
            global,
            runtime_self,
            time_origin_ms: chrono::Utc::now().timestamp_millis() as f64,
            started: Instant::now(),
        }));

        let mut store = Store::new(Cranelift::default());
        let env = FunctionEnv::new(
            &mut store,
            HostState {
                mem: MemView::default(),
                exports: None,
                shared: Arc::clone(&shared),
            },
        );

        Runtime {
            store,
            env,
            instance: None,
            shared,
            events,
        }
    }

    fn shared(&self) -> MutexGuard<'_, HostData> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compile `wasm` (binary, or WAT text) and instantiate it against the
    /// `go` import table, then bind the exports the driver needs: linear
    /// memory `mem` and the functions `run`, `resume`, `getsp`.
    pub fn load_module(&mut self, wasm: &[u8]) -> Result<(), VmError> {
        let module = Module::new(&self.store, wasm)?;
        let import_object = imports::build(&mut self.store, &self.env);
        let instance = Instance::new(&mut self.store, &module, &import_object)?;

        let memory = instance.exports.get_memory("mem")?.clone();
        let exports = GuestExports {
            run: instance.exports.get_typed_function(&self.store, "run")?,
            resume: instance.exports.get_typed_function(&self.store, "resume")?,
            getsp: instance.exports.get_typed_function(&self.store, "getsp")?,
        };

        let state = self.env.as_mut(&mut self.store);
        state.mem.bind(memory);
        state.exports = Some(exports);
        self.instance = Some(instance);
        Ok(())
    }

    pub fn module_loaded(&self) -> bool {
        self.instance.is_some()
    }

    pub fn exited(&self) -> bool {
        self.shared().exited
    }

    /// The global object (reference id 5). Embedders may attach extra
    /// capabilities to it before `run`.
    pub fn global(&self) -> Value {
        self.shared().global.clone()
    }

    /// Seed argv/env, invoke the guest's `run` export, then pump timer
    /// events until the guest exits. Returns the guest's exit code.
    pub async fn run(
        &mut self,
        args: &[String],
        env_vars: &BTreeMap<String, String>,
    ) -> Result<i32, VmError> {
        let exports = self
            .env
            .as_ref(&self.store)
            .exports
            .clone()
            .ok_or(VmError::ModuleNotLoaded)?;
        let mem = self.env.as_ref(&self.store).mem.clone();
        let (argc, argv) = args::store_arguments(&mem, &self.store, args, env_vars)?;

        exports.run.call(&mut self.store, argc, argv)?;

        while !self.exited() {
            match self.events.try_recv() {
                Ok(id) => self.deliver_timeout(id)?,
                Err(TryRecvError::Empty) => {
                    if self.shared().timers.is_empty() {
                        // The guest parked without exiting and nothing can
                        // ever wake it again.
                        return Err(VmError::Deadlock);
                    }
                    match self.events.recv().await {
                        Some(id) => self.deliver_timeout(id)?,
                        None => return Err(VmError::Deadlock),
                    }
                }
                Err(TryRecvError::Disconnected) => return Err(VmError::Deadlock),
            }
        }

        Ok(self.shared().exit_code)
    }

    /// A fired timeout: resume the guest, then keep resuming while it has
    /// not deregistered the timer id. A fire that raced an exit or a
    /// cancellation is dropped silently.
    fn deliver_timeout(&mut self, id: i32) -> Result<(), VmError> {
        if self.exited() {
            return Ok(());
        }
        self.resume()?;
        loop {
            let (still_registered, exited) = {
                let data = self.shared();
                (data.timers.contains(id), data.exited)
            };
            if !still_registered || exited {
                return Ok(());
            }
            warn!("scheduleTimeoutEvent: missed timeout event {}", id);
            self.resume()?;
        }
    }

    /// Re-enter the guest's event pump. An error once the guest exited.
    pub fn resume(&mut self) -> Result<(), VmError> {
        if self.exited() {
            return Err(VmError::AlreadyExited);
        }
        let resume = self
            .env
            .as_ref(&self.store)
            .exports
            .as_ref()
            .ok_or(VmError::ModuleNotLoaded)?
            .resume
            .clone();
        resume.call(&mut self.store)?;
        Ok(())
    }

    /// Current guest stack pointer.
    pub fn getsp(&mut self) -> Result<i32, VmError> {
        let getsp = self
            .env
            .as_ref(&self.store)
            .exports
            .as_ref()
            .ok_or(VmError::ModuleNotLoaded)?
            .getsp
            .clone();
        Ok(getsp.call(&mut self.store)?)
    }

    /// Mark the instance exited on behalf of the embedder.
    pub fn exit(&mut self, code: i32) {
        let mut data = self.shared();
        data.exited = true;
        data.exit_code = code;
        if code != 0 {
            warn!("exit code: {}", code);
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn capture_sink() -> (OutputSink, Arc<StdMutex<Vec<String>>>) {
        let lines = Arc::new(StdMutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let sink = OutputSink::Callback(Arc::new(move |chunk: &str| {
            sink_lines.lock().unwrap().push(chunk.to_string());
        }));
        (sink, lines)
    }

    /// Guest whose `run` writes `code` at sp+8 and exits immediately.
    const EXIT_WAT: &str = r#"
        (module
          (import "go" "runtime.wasmExit" (func $wasmExit (param i32)))
          (memory (export "mem") 2)
          (global $sp (mut i32) (i32.const 65536))
          (func (export "run") (param i32 i32)
            (i32.store (i32.const 65544) (i32.const {CODE}))
            (call $wasmExit (global.get $sp)))
          (func (export "resume"))
          (func (export "getsp") (result i32) (global.get $sp)))
    "#;

    fn exit_module(code: i32) -> Vec<u8> {
        EXIT_WAT.replace("{CODE}", &code.to_string()).into_bytes()
    }

    #[tokio::test]
    async fn test_run_resolves_on_synchronous_exit() {
        let (sink, lines) = capture_sink();
        let mut runtime = Runtime::with_sink(sink);
        runtime.load_module(&exit_module(0)).unwrap();
        let code = runtime
            .run(&["js".to_string()], &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(runtime.exited());
        assert!(lines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_is_returned_not_an_error() {
        let mut runtime = Runtime::with_sink(capture_sink().0);
        runtime.load_module(&exit_module(7)).unwrap();
        let code = runtime.run(&[], &BTreeMap::new()).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_resume_after_exit_is_rejected() {
        let mut runtime = Runtime::with_sink(capture_sink().0);
        runtime.load_module(&exit_module(0)).unwrap();
        runtime.run(&[], &BTreeMap::new()).await.unwrap();
        assert!(matches!(runtime.resume(), Err(VmError::AlreadyExited)));
    }

    #[tokio::test]
    async fn test_run_without_module_is_rejected() {
        let mut runtime = Runtime::with_sink(capture_sink().0);
        assert!(!runtime.module_loaded());
        assert!(matches!(
            runtime.run(&[], &BTreeMap::new()).await,
            Err(VmError::ModuleNotLoaded)
        ));
        assert!(matches!(runtime.resume(), Err(VmError::ModuleNotLoaded)));
    }

    #[tokio::test]
    async fn test_missing_export_is_a_load_error() {
        let mut runtime = Runtime::with_sink(capture_sink().0);
        let wat = br#"
            (module
              (memory (export "mem") 1)
              (func (export "run") (param i32 i32)))
        "#;
        assert!(matches!(
            runtime.load_module(wat),
            Err(VmError::Export(_))
        ));
    }

    #[tokio::test]
    async fn test_parked_guest_without_timers_is_a_deadlock() {
        let mut runtime = Runtime::with_sink(capture_sink().0);
        let wat = br#"
            (module
              (memory (export "mem") 2)
              (global $sp (mut i32) (i32.const 65536))
              (func (export "run") (param i32 i32))
              (func (export "resume"))
              (func (export "getsp") (result i32) (global.get $sp)))
        "#;
        runtime.load_module(wat).unwrap();
        assert!(matches!(
            runtime.run(&[], &BTreeMap::new()).await,
            Err(VmError::Deadlock)
        ));
    }

    #[tokio::test]
    async fn test_driver_exit_marks_the_instance() {
        let mut runtime = Runtime::with_sink(capture_sink().0);
        runtime.load_module(&exit_module(0)).unwrap();
        runtime.exit(3);
        assert!(runtime.exited());
        assert!(matches!(runtime.resume(), Err(VmError::AlreadyExited)));
    }
}
