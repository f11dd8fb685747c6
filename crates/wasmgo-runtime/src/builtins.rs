//! The ambient host surface the guest reaches through the reflective API.
//!
//! Two roots are seeded into the value table: the global object (id 5) and
//! the runtime-self object (id 6). The global carries the constructors and
//! capability objects the guest's runtime probes at startup (`Object`,
//! `Array`, `Uint8Array`, `Date`, `Math`, `fs`, `process`); the
//! runtime-self object carries `_makeFuncWrapper` and the `_pendingEvent`
//! slot of the callback protocol.
//!
//! Per-instance state: each driver builds its own world, so hosting several
//! guests never shares a capability object between them.

use std::sync::Arc;

use crate::imports::call_function;
use crate::values::{CallError, ClassTag, FuncDef, FuncKind, Value};

/// File-system entry points that only ever report `ENOSYS` through their
/// completion callback.
const FS_STUBS: &[&str] = &[
    "chmod", "chown", "close", "fchmod", "fchown", "fstat", "ftruncate", "lchown", "link",
    "lstat", "mkdir", "open", "read", "readdir", "readlink", "rename", "rmdir", "stat",
    "symlink", "truncate", "unlink", "utimes",
];

/// The sentinel error for anything this host does not implement.
pub(crate) fn enosys() -> Value {
    let err = Value::exception("Error", "not implemented");
    err.set("code", Value::str("ENOSYS"));
    err
}

/// Build the two seeded roots: `(global, runtime_self)`.
pub(crate) fn make_world() -> (Value, Value) {
    let global = Value::object("Object");
    global.set("Object", Value::ctor("Object", ClassTag::Object));
    global.set("Array", Value::ctor("Array", ClassTag::Array));
    global.set("Uint8Array", Value::ctor("Uint8Array", ClassTag::Uint8Array));
    global.set("Date", Value::ctor("Date", ClassTag::Date));
    global.set("Math", math_object());
    global.set("fs", fs_object());
    global.set("process", process_object());

    let runtime_self = Value::object_with("Go", vec![("_pendingEvent", Value::Null)]);
    runtime_self.set(
        "_makeFuncWrapper",
        Value::native_fn("_makeFuncWrapper", |_env, _this, args| {
            let id = args.first().map(|v| v.as_number()).unwrap_or(f64::NAN);
            if !(id.is_finite() && id >= 0.0) {
                return Err(CallError::type_error("callback id must be a number"));
            }
            Ok(Value::Function(Arc::new(FuncDef {
                name: format!("callback{}", id as u32),
                kind: FuncKind::Guest { id: id as u32 },
            })))
        }),
    );

    (global, runtime_self)
}

/// A fresh `Date` instance. The guest only ever asks it for the local UTC
/// offset when probing the time zone.
pub(crate) fn date_instance() -> Value {
    let date = Value::object("Date");
    date.set(
        "getTimezoneOffset",
        Value::native_fn("getTimezoneOffset", |_env, _this, _args| {
            Ok(Value::Number(0.0))
        }),
    );
    date
}

fn math_object() -> Value {
    let math = Value::object("Math");
    fn unary(name: &'static str, f: fn(f64) -> f64) -> Value {
        Value::native_fn(name, move |_env, _this, args| {
            Ok(Value::Number(f(args
                .first()
                .map(|v| v.as_number())
                .unwrap_or(f64::NAN))))
        })
    }
    math.set("abs", unary("abs", f64::abs));
    math.set("floor", unary("floor", f64::floor));
    math.set("ceil", unary("ceil", f64::ceil));
    math.set("trunc", unary("trunc", f64::trunc));
    math.set(
        "min",
        Value::native_fn("min", |_env, _this, args| {
            Ok(Value::Number(fold_numbers(args, f64::INFINITY, f64::min)))
        }),
    );
    math.set(
        "max",
        Value::native_fn("max", |_env, _this, args| {
            Ok(Value::Number(fold_numbers(args, f64::NEG_INFINITY, f64::max)))
        }),
    );
    math
}

fn fold_numbers(args: &[Value], init: f64, f: fn(f64, f64) -> f64) -> f64 {
    let mut acc = init;
    for arg in args {
        let n = arg.as_number();
        if n.is_nan() {
            return f64::NAN;
        }
        acc = f(acc, n);
    }
    acc
}

fn fs_object() -> Value {
    let fs = Value::object("Object");

    // The guest's syscall layer reads these before its first open().
    fs.set(
        "constants",
        Value::object_with(
            "Object",
            vec![
                ("O_WRONLY", Value::Number(-1.0)),
                ("O_RDWR", Value::Number(-1.0)),
                ("O_CREAT", Value::Number(-1.0)),
                ("O_TRUNC", Value::Number(-1.0)),
                ("O_APPEND", Value::Number(-1.0)),
                ("O_EXCL", Value::Number(-1.0)),
            ],
        ),
    );

    fs.set(
        "writeSync",
        Value::native_fn("writeSync", |env, _this, args| {
            let buf = match args.get(1) {
                Some(Value::Bytes(b)) => Arc::clone(b),
                _ => return Err(CallError::type_error("writeSync requires a byte buffer")),
            };
            let bytes = buf.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let shared = env.data().shared.clone();
            let n = shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .console
                .write(&bytes);
            Ok(Value::Number(n as f64))
        }),
    );

    fs.set(
        "write",
        Value::native_fn("write", |env, this, args| {
            let callback = args.get(5).cloned().unwrap_or(Value::Undefined);
            let buf_len = args.get(1).map(|v| v.length()).unwrap_or(0.0);
            let offset = args.get(2).map(|v| v.as_number()).unwrap_or(f64::NAN);
            let length = args.get(3).map(|v| v.as_number()).unwrap_or(f64::NAN);
            let position_is_null = args.get(4).map(|v| v.is_nullish()).unwrap_or(false);
            if offset != 0.0 || length != buf_len || !position_is_null {
                call_function(env, &callback, &Value::Undefined, &[enosys()])?;
                return Ok(Value::Undefined);
            }
            let write_sync = this.get("writeSync");
            let n = call_function(env, &write_sync, this, args)?;
            call_function(env, &callback, &Value::Undefined, &[Value::Null, n])?;
            Ok(Value::Undefined)
        }),
    );

    // fsync succeeds as a no-op: there is nothing behind the descriptor.
    fs.set(
        "fsync",
        Value::native_fn("fsync", |env, _this, args| {
            let callback = args.get(1).cloned().unwrap_or(Value::Undefined);
            call_function(env, &callback, &Value::Undefined, &[Value::Null])?;
            Ok(Value::Undefined)
        }),
    );

    for name in FS_STUBS {
        fs.set(
            name,
            Value::native_fn(*name, |env, _this, args| {
                // callback-style: the error travels through the last argument
                match args.last() {
                    Some(cb @ Value::Function(_)) => {
                        let cb = cb.clone();
                        call_function(env, &cb, &Value::Undefined, &[enosys()])?;
                        Ok(Value::Undefined)
                    }
                    _ => Err(CallError::Thrown(enosys())),
                }
            }),
        );
    }

    fs
}

fn process_object() -> Value {
    let process = Value::object_with(
        "Object",
        vec![("pid", Value::Number(-1.0)), ("ppid", Value::Number(-1.0))],
    );
    for name in ["getuid", "getgid", "geteuid", "getegid"] {
        process.set(
            name,
            Value::native_fn(name, |_env, _this, _args| Ok(Value::Number(-1.0))),
        );
    }
    for name in ["getgroups", "umask", "cwd", "chdir"] {
        process.set(
            name,
            Value::native_fn(name, |_env, _this, _args| {
                Err(CallError::Thrown(enosys()))
            }),
        );
    }
    process
}
