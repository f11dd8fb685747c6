//! The `go` import namespace the guest links against.
//!
//! Every import takes a single 32-bit stack pointer; operands and results
//! sit at fixed offsets from it in linear memory. The first action of every
//! handler is the unsigned reinterpretation of `sp`. Handlers that can
//! re-enter the guest (the reflective call family) must refetch `sp`
//! through the `getsp` export before writing results: a callback can grow
//! the guest stack and relocate it.
//!
//! Failures fall in two buckets: guest-visible exceptions become
//! `(result, success=0)` in guest memory and never reach the host caller;
//! host-fatal conditions (memory faults, resume after exit) become traps
//! that abort the run.

use std::sync::Arc;

use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use wasmer::{AsStoreMut, Function, FunctionEnv, FunctionEnvMut, Imports, RuntimeError, Store};

use crate::builtins;
use crate::error::VmError;
use crate::mem::MemView;
use crate::runtime::{HostData, HostState};
use crate::values::{CallError, ClassTag, FuncKind, Value};

fn to_trap(e: VmError) -> RuntimeError {
    match e {
        VmError::Trap(t) => t,
        other => RuntimeError::user(Box::new(other)),
    }
}

fn mem(env: &FunctionEnvMut<HostState>) -> MemView {
    env.data().mem.clone()
}

/// Run `f` against the shared host data. The lock is scoped to `f`: it must
/// never be held across a call back into the guest.
fn with_shared<R>(env: &FunctionEnvMut<HostState>, f: impl FnOnce(&mut HostData) -> R) -> R {
    let shared = env.data().shared.clone();
    let mut data = shared.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut data)
}

fn load_value(env: &FunctionEnvMut<HostState>, addr: u64) -> Result<Value, VmError> {
    let bits = mem(env).get_u64(env, addr)?;
    Ok(with_shared(env, |d| d.values.load(bits)))
}

fn store_value(env: &FunctionEnvMut<HostState>, addr: u64, v: &Value) -> Result<(), VmError> {
    let enc = with_shared(env, |d| d.values.store(v));
    mem(env).set_u64(env, addr, enc.bits())
}

/// Read the value slice whose (ptr, len) header sits at `addr`.
fn load_slice_of_values(
    env: &FunctionEnvMut<HostState>,
    addr: u64,
) -> Result<Vec<Value>, VmError> {
    let mem = mem(env);
    let (ptr, len) = mem.slice_header(env, addr)?;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let bits = mem.get_u64(env, ptr + i as u64 * 8)?;
        out.push(with_shared(env, |d| d.values.load(bits)));
    }
    Ok(out)
}

/// Refetch the guest stack pointer after a potential re-entry.
fn fetch_sp(env: &mut FunctionEnvMut<HostState>) -> Result<u64, VmError> {
    let getsp = env
        .data()
        .exports
        .as_ref()
        .ok_or(VmError::ModuleNotLoaded)?
        .getsp
        .clone();
    let sp = getsp.call(&mut env.as_store_mut())?;
    Ok(sp as u32 as u64)
}

/// Re-enter the guest's event pump. Fatal once the guest has exited.
fn resume_guest(env: &mut FunctionEnvMut<HostState>) -> Result<(), VmError> {
    if with_shared(env, |d| d.exited) {
        return Err(VmError::AlreadyExited);
    }
    let resume = env
        .data()
        .exports
        .as_ref()
        .ok_or(VmError::ModuleNotLoaded)?
        .resume
        .clone();
    resume.call(&mut env.as_store_mut())?;
    Ok(())
}

/// Apply `func` to `args` with the given receiver.
pub(crate) fn call_function(
    env: &mut FunctionEnvMut<HostState>,
    func: &Value,
    receiver: &Value,
    args: &[Value],
) -> Result<Value, CallError> {
    let def = match func {
        Value::Function(def) => Arc::clone(def),
        other => {
            return Err(CallError::type_error(format!(
                "{} is not a function",
                other.kind_name()
            )))
        }
    };
    match &def.kind {
        FuncKind::Native(f) => {
            let f = Arc::clone(f);
            f(env, receiver, args)
        }
        FuncKind::Ctor(_) => Err(CallError::type_error(format!(
            "constructor {} requires new",
            def.name
        ))),
        FuncKind::Guest { id } => invoke_guest(env, *id, receiver, args),
    }
}

/// Invoke a guest callable: stage the pending event on the runtime-self
/// object, resume the guest so its event pump picks it up, then hand back
/// whatever the guest wrote into `result`.
fn invoke_guest(
    env: &mut FunctionEnvMut<HostState>,
    id: u32,
    receiver: &Value,
    args: &[Value],
) -> Result<Value, CallError> {
    let runtime_self = with_shared(env, |d| d.runtime_self.clone());
    // One event slot; a second staging before the guest consumed the first
    // would silently drop a call.
    if !runtime_self.get("_pendingEvent").is_nullish() {
        return Err(CallError::Thrown(Value::exception(
            "Error",
            "pending event already staged",
        )));
    }
    let event = Value::object_with(
        "Object",
        vec![
            ("id", Value::Number(id as f64)),
            ("this", receiver.clone()),
            ("args", Value::array(args.to_vec())),
        ],
    );
    runtime_self.set("_pendingEvent", event.clone());
    resume_guest(env).map_err(CallError::from)?;
    Ok(event.get("result"))
}

/// `new` through the reflective API.
fn construct_value(ctor: &Value, args: &[Value]) -> Result<Value, CallError> {
    let def = match ctor {
        Value::Function(def) => Arc::clone(def),
        other => {
            return Err(CallError::type_error(format!(
                "{} is not a constructor",
                other.kind_name()
            )))
        }
    };
    let tag = match def.kind {
        FuncKind::Ctor(tag) => tag,
        _ => {
            return Err(CallError::type_error(format!(
                "{} is not a constructor",
                def.name
            )))
        }
    };
    Ok(match tag {
        ClassTag::Object => Value::object("Object"),
        ClassTag::Array => match args {
            [Value::Number(n)] if *n >= 0.0 && n.fract() == 0.0 => {
                Value::array(vec![Value::Undefined; *n as usize])
            }
            _ => Value::array(args.to_vec()),
        },
        ClassTag::Uint8Array => match args.first() {
            None => Value::bytes(Vec::new()),
            Some(Value::Number(n)) if *n >= 0.0 => Value::bytes(vec![0; *n as usize]),
            Some(Value::Bytes(b)) => {
                Value::bytes(b.lock().unwrap_or_else(|e| e.into_inner()).clone())
            }
            Some(Value::Array(a)) => {
                let items = a.lock().unwrap_or_else(|e| e.into_inner());
                Value::bytes(items.iter().map(|v| v.as_number() as u8).collect())
            }
            Some(other) => {
                return Err(CallError::type_error(format!(
                    "cannot build a byte buffer from {}",
                    other.kind_name()
                )))
            }
        },
        ClassTag::Date => builtins::date_instance(),
    })
}

/// Write the outcome of a reflective invocation at the post-call stack
/// pointer: the value slot and the success byte.
fn finish_call(
    env: &mut FunctionEnvMut<HostState>,
    outcome: Result<Value, CallError>,
    result_off: u64,
    success_off: u64,
) -> Result<(), RuntimeError> {
    let (value, ok) = match outcome {
        Ok(v) => (v, 1u8),
        Err(CallError::Thrown(e)) => (e, 0u8),
        Err(CallError::Fatal(trap)) => return Err(trap),
    };
    let sp = fetch_sp(env).map_err(to_trap)?;
    store_value(env, sp + result_off, &value).map_err(to_trap)?;
    mem(env)
        .set_u8(env, sp + success_off, ok)
        .map_err(to_trap)
}

// ── runtime.* ────────────────────────────────────────────────────────

fn wasm_exit(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let code = mem(&env).get_i32(&env, sp + 8).map_err(to_trap)?;
    with_shared(&env, |d| {
        d.exited = true;
        d.exit_code = code;
    });
    if code != 0 {
        warn!("exit code: {}", code);
    }
    Ok(())
}

fn wasm_write(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let mem = mem(&env);
    // fd is read for ABI fidelity; every descriptor shares the one buffer
    let _fd = mem.get_i64(&env, sp + 8).map_err(to_trap)?;
    let ptr = mem.get_i64(&env, sp + 16).map_err(to_trap)? as u64;
    let len = mem.get_i32(&env, sp + 24).map_err(to_trap)? as usize;
    let bytes = mem.read_bytes(&env, ptr, len).map_err(to_trap)?;
    with_shared(&env, |d| d.console.write(&bytes));
    Ok(())
}

fn reset_memory_data_view(env: FunctionEnvMut<HostState>, _sp: i32) -> Result<(), RuntimeError> {
    // Views over the guest memory are taken per access, so a growth is
    // already visible; this confirms the handle is still bound.
    if !env.data().mem.is_bound() {
        return Err(to_trap(VmError::ModuleNotLoaded));
    }
    debug!("memory data view reset");
    Ok(())
}

fn nanotime1(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let ns = with_shared(&env, |d| {
        let elapsed_ms = d.started.elapsed().as_secs_f64() * 1e3;
        ((d.time_origin_ms + elapsed_ms) * 1e6) as i64
    });
    mem(&env).set_i64(&env, sp + 8, ns).map_err(to_trap)
}

fn walltime(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let msec = chrono::Utc::now().timestamp_millis();
    let mem = mem(&env);
    mem.set_i64(&env, sp + 8, msec / 1000).map_err(to_trap)?;
    mem.set_i32(&env, sp + 16, ((msec % 1000) * 1_000_000) as i32)
        .map_err(to_trap)
}

fn schedule_timeout_event(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let delay_ms = mem(&env).get_i64(&env, sp + 8).map_err(to_trap)?;
    let id = with_shared(&env, |d| d.timers.schedule(delay_ms));
    mem(&env).set_i32(&env, sp + 16, id).map_err(to_trap)
}

fn clear_timeout_event(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let id = mem(&env).get_i32(&env, sp + 8).map_err(to_trap)?;
    with_shared(&env, |d| d.timers.clear(id));
    Ok(())
}

fn get_random_data(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let mem = mem(&env);
    let (ptr, len) = mem.slice_header(&env, sp + 8).map_err(to_trap)?;
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    mem.write_bytes(&env, ptr, &buf).map_err(to_trap)
}

// ── syscall/js.* ─────────────────────────────────────────────────────

fn finalize_ref(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let id = mem(&env).get_u32(&env, sp + 8).map_err(to_trap)?;
    with_shared(&env, |d| d.values.remove_ref(id));
    Ok(())
}

fn string_val(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let s = mem(&env).load_string(&env, sp + 8).map_err(to_trap)?;
    store_value(&env, sp + 24, &Value::str(s)).map_err(to_trap)
}

fn value_get(mut env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    let name = mem(&env).load_string(&env, sp + 16).map_err(to_trap)?;
    let result = v.get(&name);
    let sp = fetch_sp(&mut env).map_err(to_trap)?;
    store_value(&env, sp + 32, &result).map_err(to_trap)
}

fn value_set(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    let name = mem(&env).load_string(&env, sp + 16).map_err(to_trap)?;
    let value = load_value(&env, sp + 32).map_err(to_trap)?;
    v.set(&name, value);
    Ok(())
}

fn value_delete(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    let name = mem(&env).load_string(&env, sp + 16).map_err(to_trap)?;
    v.delete(&name);
    Ok(())
}

fn value_index(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    let i = mem(&env).get_i64(&env, sp + 16).map_err(to_trap)?;
    store_value(&env, sp + 24, &v.index(i)).map_err(to_trap)
}

fn value_set_index(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    let i = mem(&env).get_i64(&env, sp + 16).map_err(to_trap)?;
    let value = load_value(&env, sp + 24).map_err(to_trap)?;
    v.set_index(i, value);
    Ok(())
}

fn value_call(mut env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let outcome = (|| {
        let v = load_value(&env, sp + 8)?;
        let name = mem(&env).load_string(&env, sp + 16)?;
        let args = load_slice_of_values(&env, sp + 32)?;
        let method = v.get(&name);
        Ok::<_, VmError>((v, method, args))
    })();
    let outcome = match outcome {
        Ok((v, method, args)) => call_function(&mut env, &method, &v, &args),
        Err(e) => return Err(to_trap(e)),
    };
    finish_call(&mut env, outcome, 56, 64)
}

fn value_invoke(mut env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let staged = (|| {
        let v = load_value(&env, sp + 8)?;
        let args = load_slice_of_values(&env, sp + 16)?;
        Ok::<_, VmError>((v, args))
    })();
    let outcome = match staged {
        Ok((v, args)) => call_function(&mut env, &v, &Value::Undefined, &args),
        Err(e) => return Err(to_trap(e)),
    };
    finish_call(&mut env, outcome, 40, 48)
}

fn value_new(mut env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let staged = (|| {
        let ctor = load_value(&env, sp + 8)?;
        let args = load_slice_of_values(&env, sp + 16)?;
        Ok::<_, VmError>((ctor, args))
    })();
    let outcome = match staged {
        Ok((ctor, args)) => construct_value(&ctor, &args),
        Err(e) => return Err(to_trap(e)),
    };
    finish_call(&mut env, outcome, 40, 48)
}

fn value_length(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    mem(&env)
        .set_i64(&env, sp + 16, v.length() as i64)
        .map_err(to_trap)
}

fn value_prepare_string(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    let utf8 = v.js_string().into_bytes();
    let len = utf8.len() as i64;
    store_value(&env, sp + 16, &Value::bytes(utf8)).map_err(to_trap)?;
    mem(&env).set_i64(&env, sp + 24, len).map_err(to_trap)
}

fn value_load_string(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    let bytes = match v {
        Value::Bytes(b) => b.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        _ => return Ok(()), // only prepared strings reach here
    };
    let mem = mem(&env);
    let (ptr, len) = mem.slice_header(&env, sp + 16).map_err(to_trap)?;
    let n = len.min(bytes.len());
    mem.write_bytes(&env, ptr, &bytes[..n]).map_err(to_trap)
}

fn value_instance_of(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let v = load_value(&env, sp + 8).map_err(to_trap)?;
    let ctor = load_value(&env, sp + 16).map_err(to_trap)?;
    mem(&env)
        .set_u8(&env, sp + 24, v.instance_of(&ctor) as u8)
        .map_err(to_trap)
}

fn copy_bytes_to_go(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let mem = mem(&env);
    let (dst_ptr, dst_len) = mem.slice_header(&env, sp + 8).map_err(to_trap)?;
    let src = load_value(&env, sp + 32).map_err(to_trap)?;
    let src = match src {
        Value::Bytes(b) => b,
        _ => return mem.set_u8(&env, sp + 48, 0).map_err(to_trap),
    };
    let bytes = src.lock().unwrap_or_else(|e| e.into_inner());
    let n = dst_len.min(bytes.len());
    mem.write_bytes(&env, dst_ptr, &bytes[..n]).map_err(to_trap)?;
    drop(bytes);
    mem.set_i64(&env, sp + 40, n as i64).map_err(to_trap)?;
    mem.set_u8(&env, sp + 48, 1).map_err(to_trap)
}

fn copy_bytes_to_js(env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    let sp = sp as u32 as u64;
    let mem = mem(&env);
    let dst = load_value(&env, sp + 8).map_err(to_trap)?;
    let dst = match dst {
        Value::Bytes(b) => b,
        _ => return mem.set_u8(&env, sp + 48, 0).map_err(to_trap),
    };
    let src = mem.load_slice(&env, sp + 16).map_err(to_trap)?;
    let n = {
        let mut bytes = dst.lock().unwrap_or_else(|e| e.into_inner());
        let n = bytes.len().min(src.len());
        bytes[..n].copy_from_slice(&src[..n]);
        n
    };
    mem.set_i64(&env, sp + 40, n as i64).map_err(to_trap)?;
    mem.set_u8(&env, sp + 48, 1).map_err(to_trap)
}

fn debug_import(_env: FunctionEnvMut<HostState>, sp: i32) -> Result<(), RuntimeError> {
    debug!("debug: {}", sp);
    Ok(())
}

/// Build the full `go` import object for one instance.
pub(crate) fn build(store: &mut Store, env: &FunctionEnv<HostState>) -> Imports {
    let f_exit = Function::new_typed_with_env(store, env, wasm_exit);
    let f_write = Function::new_typed_with_env(store, env, wasm_write);
    let f_reset_view = Function::new_typed_with_env(store, env, reset_memory_data_view);
    let f_nanotime = Function::new_typed_with_env(store, env, nanotime1);
    let f_walltime = Function::new_typed_with_env(store, env, walltime);
    let f_schedule = Function::new_typed_with_env(store, env, schedule_timeout_event);
    let f_clear = Function::new_typed_with_env(store, env, clear_timeout_event);
    let f_random = Function::new_typed_with_env(store, env, get_random_data);
    let f_finalize = Function::new_typed_with_env(store, env, finalize_ref);
    let f_string_val = Function::new_typed_with_env(store, env, string_val);
    let f_get = Function::new_typed_with_env(store, env, value_get);
    let f_set = Function::new_typed_with_env(store, env, value_set);
    let f_delete = Function::new_typed_with_env(store, env, value_delete);
    let f_index = Function::new_typed_with_env(store, env, value_index);
    let f_set_index = Function::new_typed_with_env(store, env, value_set_index);
    let f_call = Function::new_typed_with_env(store, env, value_call);
    let f_invoke = Function::new_typed_with_env(store, env, value_invoke);
    let f_new = Function::new_typed_with_env(store, env, value_new);
    let f_length = Function::new_typed_with_env(store, env, value_length);
    let f_prepare = Function::new_typed_with_env(store, env, value_prepare_string);
    let f_load_string = Function::new_typed_with_env(store, env, value_load_string);
    let f_instance_of = Function::new_typed_with_env(store, env, value_instance_of);
    let f_copy_to_go = Function::new_typed_with_env(store, env, copy_bytes_to_go);
    let f_copy_to_js = Function::new_typed_with_env(store, env, copy_bytes_to_js);
    let f_debug = Function::new_typed_with_env(store, env, debug_import);

    wasmer::imports! {
        "go" => {
            "runtime.wasmExit" => f_exit,
            "runtime.wasmWrite" => f_write,
            "runtime.resetMemoryDataView" => f_reset_view,
            "runtime.nanotime1" => f_nanotime,
            "runtime.walltime" => f_walltime,
            "runtime.scheduleTimeoutEvent" => f_schedule,
            "runtime.clearTimeoutEvent" => f_clear,
            "runtime.getRandomData" => f_random,
            "syscall/js.finalizeRef" => f_finalize,
            "syscall/js.stringVal" => f_string_val,
            "syscall/js.valueGet" => f_get,
            "syscall/js.valueSet" => f_set,
            "syscall/js.valueDelete" => f_delete,
            "syscall/js.valueIndex" => f_index,
            "syscall/js.valueSetIndex" => f_set_index,
            "syscall/js.valueCall" => f_call,
            "syscall/js.valueInvoke" => f_invoke,
            "syscall/js.valueNew" => f_new,
            "syscall/js.valueLength" => f_length,
            "syscall/js.valuePrepareString" => f_prepare,
            "syscall/js.valueLoadString" => f_load_string,
            "syscall/js.valueInstanceOf" => f_instance_of,
            "syscall/js.copyBytesToGo" => f_copy_to_go,
            "syscall/js.copyBytesToJS" => f_copy_to_js,
            "debug" => f_debug,
        }
    }
}
