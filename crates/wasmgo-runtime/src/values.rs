// SPDX-License-Identifier: AGPL-3.0-only
//! The host-side value model and the reference table the guest holds
//! handles into.
//!
//! The guest's 64-bit value slots carry either a real IEEE-754 double or a
//! NaN-boxed reference: high 32 bits `0x7FF80000 | type_flag`, low 32 bits
//! the reference id. Finite non-zero numbers are stored verbatim and never
//! enter the table; `undefined` is the all-zero slot.
//!
//! Everything else lives in [`ValueTable`]: an append-only vector of host
//! values with parallel reference counts, an inverse lookup so the same
//! value keeps the same id while alive, and a free-list of recycled ids.
//! Ids 0..=6 are seeded at startup and can never be collected.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use wasmer::FunctionEnvMut;

use crate::runtime::HostState;

/// High word of a NaN-boxed reference, before the type flag is or-ed in.
pub const NAN_HEAD: u32 = 0x7FF8_0000;

/// Type flags carried in the low bits of the NaN head.
pub const TYPE_FLAG_NONE: u32 = 0;
pub const TYPE_FLAG_OBJECT: u32 = 1;
pub const TYPE_FLAG_STRING: u32 = 2;
pub const TYPE_FLAG_SYMBOL: u32 = 3;
pub const TYPE_FLAG_FUNCTION: u32 = 4;

/// Seeded reference ids.
pub const ID_NAN: u32 = 0;
pub const ID_ZERO: u32 = 1;
pub const ID_NULL: u32 = 2;
pub const ID_TRUE: u32 = 3;
pub const ID_FALSE: u32 = 4;
pub const ID_GLOBAL: u32 = 5;
pub const ID_SELF: u32 = 6;

/// Sentinel count for the seeded ids; never reaches zero.
const INFINITE: u32 = u32::MAX;

/// Classes distinguishable through `instanceof` and `new`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassTag {
    Object,
    Array,
    Uint8Array,
    Date,
}

/// A native host function reachable through the reflective API.
///
/// Receives the wasmer environment (so it can write output or re-enter the
/// guest), the receiver, and the argument list. `Err(CallError::Thrown)` is
/// a guest-visible exception; `Err(CallError::Fatal)` aborts the run.
pub type NativeFn = Arc<
    dyn for<'a> Fn(
            &mut FunctionEnvMut<'a, HostState>,
            &Value,
            &[Value],
        ) -> Result<Value, CallError>
        + Send
        + Sync,
>;

/// Failure channel of a reflective call.
#[derive(Debug)]
pub enum CallError {
    /// Thrown in the guest's world; delivered as `(result, success=0)`.
    Thrown(Value),
    /// Host-fatal; propagates as a trap and aborts the run.
    Fatal(wasmer::RuntimeError),
}

impl CallError {
    pub fn type_error(message: impl Into<String>) -> Self {
        CallError::Thrown(Value::exception("TypeError", message))
    }
}

impl From<crate::error::VmError> for CallError {
    fn from(e: crate::error::VmError) -> Self {
        match e {
            crate::error::VmError::Trap(t) => CallError::Fatal(t),
            other => CallError::Fatal(wasmer::RuntimeError::user(Box::new(other))),
        }
    }
}

/// What a function value is made of.
pub enum FuncKind {
    /// Implemented by the host.
    Native(NativeFn),
    /// A constructor (`new` through `valueNew`).
    Ctor(ClassTag),
    /// A guest callable registered through `_makeFuncWrapper`; invoking it
    /// stages a pending event and resumes the guest.
    Guest { id: u32 },
}

pub struct FuncDef {
    pub name: String,
    pub kind: FuncKind,
}

impl std::fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            FuncKind::Native(_) => "native",
            FuncKind::Ctor(_) => "ctor",
            FuncKind::Guest { .. } => "guest",
        };
        write!(f, "FuncDef({} {})", kind, self.name)
    }
}

/// Property bag behind `Object` and exception values.
#[derive(Debug)]
pub struct ObjectData {
    pub class: &'static str,
    props: Mutex<BTreeMap<String, Value>>,
}

impl ObjectData {
    pub fn new(class: &'static str) -> Self {
        ObjectData {
            class,
            props: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn props(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.props.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A host value the guest can hold a handle to.
///
/// Statically typed stand-in for the dynamically typed world the guest's
/// runtime was written against: reference variants share their payload via
/// `Arc`, so clones preserve identity.
#[derive(Clone, Debug)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    /// Mutable byte buffer (the guest sees a `Uint8Array`).
    Bytes(Arc<Mutex<Vec<u8>>>),
    Array(Arc<Mutex<Vec<Value>>>),
    Object(Arc<ObjectData>),
    Function(Arc<FuncDef>),
    /// A thrown error object.
    Exception(Arc<ObjectData>),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn bytes(b: Vec<u8>) -> Value {
        Value::Bytes(Arc::new(Mutex::new(b)))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn object(class: &'static str) -> Value {
        Value::Object(Arc::new(ObjectData::new(class)))
    }

    pub fn object_with(class: &'static str, props: Vec<(&str, Value)>) -> Value {
        let data = ObjectData::new(class);
        {
            let mut map = data.props();
            for (k, v) in props {
                map.insert(k.to_string(), v);
            }
        }
        Value::Object(Arc::new(data))
    }

    pub fn exception(class: &'static str, message: impl Into<String>) -> Value {
        let data = ObjectData::new(class);
        data.props()
            .insert("message".to_string(), Value::str(message.into()));
        Value::Exception(Arc::new(data))
    }

    pub fn native_fn(
        name: impl Into<String>,
        f: impl for<'a> Fn(
                &mut FunctionEnvMut<'a, HostState>,
                &Value,
                &[Value],
            ) -> Result<Value, CallError>
            + Send
            + Sync
            + 'static,
    ) -> Value {
        Value::Function(Arc::new(FuncDef {
            name: name.into(),
            kind: FuncKind::Native(Arc::new(f)),
        }))
    }

    pub fn ctor(name: impl Into<String>, tag: ClassTag) -> Value {
        Value::Function(Arc::new(FuncDef {
            name: name.into(),
            kind: FuncKind::Ctor(tag),
        }))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "Uint8Array",
            Value::Array(_) => "Array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Exception(_) => "error",
        }
    }

    /// Identity comparison: by value for primitives, by allocation for
    /// reference variants.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Inverse-map key: `None` for values that never enter the table.
    fn key(&self) -> Option<ValueKey> {
        match self {
            Value::Number(n) if *n == 0.0 => Some(ValueKey::Zero),
            Value::Number(_) | Value::Undefined => None,
            Value::Null => Some(ValueKey::Null),
            Value::Bool(b) => Some(ValueKey::Bool(*b)),
            Value::String(s) => Some(ValueKey::Str(s.clone())),
            Value::Bytes(b) => Some(ValueKey::Ptr(Arc::as_ptr(b) as usize)),
            Value::Array(a) => Some(ValueKey::Ptr(Arc::as_ptr(a) as usize)),
            Value::Object(o) | Value::Exception(o) => Some(ValueKey::Ptr(Arc::as_ptr(o) as usize)),
            Value::Function(f) => Some(ValueKey::Ptr(Arc::as_ptr(f) as usize)),
        }
    }

    /// NaN-box type flag used when this value is stored by reference.
    pub fn type_flag(&self) -> u32 {
        match self {
            Value::Object(_) | Value::Array(_) | Value::Bytes(_) | Value::Exception(_) => {
                TYPE_FLAG_OBJECT
            }
            Value::String(_) => TYPE_FLAG_STRING,
            Value::Function(_) => TYPE_FLAG_FUNCTION,
            _ => TYPE_FLAG_NONE,
        }
    }

    pub fn as_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) | Value::Null => 0.0,
            _ => f64::NAN,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    // ── Reflection façade ────────────────────────────────────────────

    /// Property read. Missing properties read as `undefined`.
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Object(o) | Value::Exception(o) => {
                o.props().get(key).cloned().unwrap_or(Value::Undefined)
            }
            Value::Array(a) => match key {
                "length" => Value::Number(a.lock().unwrap_or_else(|e| e.into_inner()).len() as f64),
                _ => Value::Undefined,
            },
            Value::Bytes(b) => match key {
                "length" | "byteLength" => {
                    Value::Number(b.lock().unwrap_or_else(|e| e.into_inner()).len() as f64)
                }
                _ => Value::Undefined,
            },
            Value::String(s) => match key {
                "length" => Value::Number(s.encode_utf16().count() as f64),
                _ => Value::Undefined,
            },
            Value::Function(f) => match key {
                "name" => Value::str(f.name.clone()),
                _ => Value::Undefined,
            },
            _ => Value::Undefined,
        }
    }

    /// Property write. Silently ignored on non-object receivers.
    pub fn set(&self, key: &str, v: Value) {
        if let Value::Object(o) | Value::Exception(o) = self {
            o.props().insert(key.to_string(), v);
        }
    }

    /// Property delete. Silently ignored on non-object receivers.
    pub fn delete(&self, key: &str) {
        if let Value::Object(o) | Value::Exception(o) = self {
            o.props().remove(key);
        }
    }

    /// Integer-indexed read.
    pub fn index(&self, i: i64) -> Value {
        if i < 0 {
            return Value::Undefined;
        }
        let i = i as usize;
        match self {
            Value::Array(a) => a
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(i)
                .cloned()
                .unwrap_or(Value::Undefined),
            Value::Bytes(b) => b
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(i)
                .map(|&byte| Value::Number(byte as f64))
                .unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    /// Integer-indexed write. Arrays grow to fit; byte buffers ignore
    /// out-of-range writes.
    pub fn set_index(&self, i: i64, v: Value) {
        if i < 0 {
            return;
        }
        let i = i as usize;
        match self {
            Value::Array(a) => {
                let mut items = a.lock().unwrap_or_else(|e| e.into_inner());
                if i >= items.len() {
                    items.resize(i + 1, Value::Undefined);
                }
                items[i] = v;
            }
            Value::Bytes(b) => {
                let mut bytes = b.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(slot) = bytes.get_mut(i) {
                    *slot = v.as_number() as u8;
                }
            }
            _ => {}
        }
    }

    /// The `length` the guest observes: element count for arrays and byte
    /// buffers, UTF-16 code units for strings, the `length` property
    /// otherwise.
    pub fn length(&self) -> f64 {
        match self {
            Value::Array(a) => a.lock().unwrap_or_else(|e| e.into_inner()).len() as f64,
            Value::Bytes(b) => b.lock().unwrap_or_else(|e| e.into_inner()).len() as f64,
            Value::String(s) => s.encode_utf16().count() as f64,
            other => {
                let n = other.get("length").as_number();
                if n.is_nan() {
                    0.0
                } else {
                    n
                }
            }
        }
    }

    /// String coercion matching what the guest's runtime expects from the
    /// host world.
    pub fn js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::Bytes(b) => {
                let bytes = b.lock().unwrap_or_else(|e| e.into_inner());
                bytes
                    .iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Array(a) => {
                let items = a.lock().unwrap_or_else(|e| e.into_inner());
                items
                    .iter()
                    .map(|v| match v {
                        Value::Undefined | Value::Null => String::new(),
                        other => other.js_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(o) => match o.class {
                "Object" => "[object Object]".to_string(),
                other => format!("[object {}]", other),
            },
            Value::Exception(o) => {
                let message = o.props().get("message").cloned();
                match message {
                    Some(Value::String(m)) if !m.is_empty() => format!("{}: {}", o.class, m),
                    _ => o.class.to_string(),
                }
            }
            Value::Function(f) => format!("function {}() {{ [native code] }}", f.name),
        }
    }

    /// `instanceof` against a constructor value. Class tags only; there is
    /// no prototype chain in this world.
    pub fn instance_of(&self, ctor: &Value) -> bool {
        let tag = match ctor {
            Value::Function(f) => match f.kind {
                FuncKind::Ctor(tag) => tag,
                _ => return false,
            },
            _ => return false,
        };
        match tag {
            ClassTag::Uint8Array => matches!(self, Value::Bytes(_)),
            ClassTag::Array => matches!(self, Value::Array(_)),
            ClassTag::Date => matches!(self, Value::Object(o) if o.class == "Date"),
            ClassTag::Object => matches!(
                self,
                Value::Object(_)
                    | Value::Array(_)
                    | Value::Bytes(_)
                    | Value::Exception(_)
                    | Value::Function(_)
            ),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{}", n)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ValueKey {
    Zero,
    Null,
    Bool(bool),
    Str(Arc<str>),
    Ptr(usize),
}

/// How a value crosses the boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Encoded {
    /// Stored verbatim as an IEEE-754 double.
    Float(f64),
    /// NaN-boxed table reference.
    Ref { id: u32, type_flag: u32 },
}

impl Encoded {
    /// The exact 8-byte slot contents, little-endian.
    pub fn bits(self) -> u64 {
        match self {
            Encoded::Float(f) => f.to_bits(),
            Encoded::Ref { id, type_flag } => {
                (((NAN_HEAD | type_flag) as u64) << 32) | id as u64
            }
        }
    }
}

/// Registry of host values the guest references by id.
#[derive(Debug)]
pub struct ValueTable {
    values: Vec<Option<Value>>,
    ref_counts: Vec<u32>,
    ids: BTreeMap<ValueKey, u32>,
    id_pool: Vec<u32>,
}

impl ValueTable {
    /// Seed the table: `{NaN→0, 0→1, null→2, true→3, false→4, global→5,
    /// runtime-self→6}`, all with infinite counts.
    pub fn new(global: Value, runtime_self: Value) -> Self {
        let seeded = vec![
            Value::Number(f64::NAN),
            Value::Number(0.0),
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            global,
            runtime_self,
        ];
        let mut ids = BTreeMap::new();
        for (id, v) in seeded.iter().enumerate() {
            // NaN has no inverse-map key; it is matched before lookup.
            if let Some(key) = v.key() {
                ids.insert(key, id as u32);
            }
        }
        ValueTable {
            ref_counts: vec![INFINITE; seeded.len()],
            values: seeded.into_iter().map(Some).collect(),
            ids,
            id_pool: Vec::new(),
        }
    }

    /// Encode `v` for an 8-byte guest slot, interning it (and taking a
    /// reference) when it is not representable as a plain double.
    pub fn store(&mut self, v: &Value) -> Encoded {
        match v {
            Value::Number(n) if n.is_nan() => Encoded::Ref {
                id: ID_NAN,
                type_flag: TYPE_FLAG_NONE,
            },
            Value::Number(n) if *n != 0.0 => Encoded::Float(*n),
            Value::Undefined => Encoded::Float(0.0),
            other => {
                let key = other.key().expect("interned values carry a key");
                let id = match self.ids.get(&key) {
                    Some(&id) => id,
                    None => {
                        let id = match self.id_pool.pop() {
                            Some(id) => id,
                            None => {
                                self.values.push(None);
                                self.ref_counts.push(0);
                                (self.values.len() - 1) as u32
                            }
                        };
                        self.values[id as usize] = Some(other.clone());
                        self.ref_counts[id as usize] = 0;
                        self.ids.insert(key, id);
                        id
                    }
                };
                if self.ref_counts[id as usize] != INFINITE {
                    self.ref_counts[id as usize] += 1;
                }
                Encoded::Ref {
                    id,
                    type_flag: other.type_flag(),
                }
            }
        }
    }

    /// Decode the raw contents of an 8-byte guest slot.
    pub fn load(&self, bits: u64) -> Value {
        let f = f64::from_bits(bits);
        if f == 0.0 {
            return Value::Undefined;
        }
        if !f.is_nan() {
            return Value::Number(f);
        }
        self.get((bits & 0xffff_ffff) as u32)
    }

    /// Table entry for `id`, or `undefined` for a dead slot.
    pub fn get(&self, id: u32) -> Value {
        self.values
            .get(id as usize)
            .and_then(|slot| slot.clone())
            .unwrap_or(Value::Undefined)
    }

    /// Drop one guest reference. At zero the slot is cleared, the inverse
    /// mapping removed, and the id recycled. Seeded ids are immune.
    pub fn remove_ref(&mut self, id: u32) {
        let idx = id as usize;
        let count = match self.ref_counts.get_mut(idx) {
            Some(c) => c,
            None => return,
        };
        if *count == INFINITE || *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            if let Some(v) = self.values[idx].take() {
                if let Some(key) = v.key() {
                    self.ids.remove(&key);
                }
            }
            self.id_pool.push(id);
        }
    }

    pub fn ref_count(&self, id: u32) -> Option<u32> {
        self.ref_counts.get(id as usize).copied()
    }

    pub fn is_live(&self, id: u32) -> bool {
        self.values
            .get(id as usize)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn pool(&self) -> &[u32] {
        &self.id_pool
    }
}

impl Default for ValueTable {
    fn default() -> Self {
        ValueTable::new(Value::object("Object"), Value::object("Object"))
    }
}
