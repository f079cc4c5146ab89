//! §3 "Obj (heap object)" — the variable-sized heap and its reference type.
//!
//! Every heap object shares one header (`marked`, `next`) and is reached
//! exclusively through `ObjRef`, a thin `Copy` wrapper around a raw
//! pointer. `ObjRef` does not own its referent — `Heap` does, via the
//! intrusive `next` list threaded through every `Obj` — so handing one out
//! costs nothing and two `ObjRef`s compare equal iff they point at the
//! same object, which is exactly the identity semantics §3 requires for
//! interned strings.
//!
//! This is the one module in the crate that reaches for `unsafe`: a
//! tracing collector fundamentally needs non-owning aliasing references
//! into a shared graph, which `Rc`/`RefCell` can model but only by paying
//! for reference counts the collector makes redundant. Every dereference
//! here is guarded by the invariant that an `ObjRef` is only ever minted
//! for an object still linked into `Heap::objects`, and sweeping an object
//! first unlinks it, so a live `ObjRef` never outlives its referent.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

use super::chunk::Chunk;
use super::table::Table;
use super::value::Value;

pub struct Obj {
    pub marked: Cell<bool>,
    pub next: Option<ObjRef>,
    pub kind: ObjKind,
}

pub enum ObjKind {
    String(StringObj),
    Function(FunctionObj),
    Native(NativeObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
}

pub struct StringObj {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl StringObj {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf-8>")
    }
}

pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: u8,
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct NativeObj {
    pub arity: u8,
    pub name: &'static str,
    pub function: NativeFn,
}

pub struct ClosureObj {
    pub function: ObjRef,
    /// `None` entries are upvalues not yet captured by the running
    /// `OP_CLOSURE` — see `Vm::op_closure` for why that is GC-safe.
    pub upvalues: Vec<Option<ObjRef>>,
}

#[derive(Clone, Copy)]
pub enum UpvalueLocation {
    /// Open: indexes into the VM's value stack. Using an index rather
    /// than a raw pointer into the stack sidesteps the address-stability
    /// requirement spec.md's design notes call out (§9) — a `Vec<Value>`
    /// is free to reallocate on growth, but indices stay valid.
    Stack(usize),
    Closed,
}

pub struct UpvalueObj {
    pub location: UpvalueLocation,
    pub closed: Value,
    /// Intrusive open-upvalue list, ordered by descending stack index.
    pub next: Option<ObjRef>,
}

pub struct ClassObj {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A non-owning, `Copy` handle to a heap object.
#[derive(Clone, Copy, Debug)]
pub struct ObjRef(NonNull<Obj>);

impl ObjRef {
    /// Only `Heap::link` may mint one of these, from a pointer it just
    /// allocated and is about to own.
    pub(crate) fn from_raw(ptr: NonNull<Obj>) -> Self {
        Self(ptr)
    }

    pub fn ptr(self) -> NonNull<Obj> {
        self.0
    }

    pub fn marked(self) -> bool {
        unsafe { self.0.as_ref().marked.get() }
    }

    pub fn set_marked(self, value: bool) {
        unsafe { self.0.as_ref().marked.set(value) }
    }

    pub fn next(self) -> Option<ObjRef> {
        unsafe { self.0.as_ref().next }
    }

    pub fn kind(&self) -> &ObjKind {
        unsafe { &self.0.as_ref().kind }
    }

    pub fn kind_mut(&mut self) -> &mut ObjKind {
        unsafe { &mut self.0.as_mut().kind }
    }

    pub fn as_string(self) -> &'static StringObj {
        match unsafe { &self.0.as_ref().kind } {
            ObjKind::String(s) => unsafe { std::mem::transmute::<&StringObj, &'static StringObj>(s) },
            _ => unreachable!("as_string called on non-string object"),
        }
    }

    pub fn as_function(self) -> &'static FunctionObj {
        match unsafe { &self.0.as_ref().kind } {
            ObjKind::Function(f) => unsafe {
                std::mem::transmute::<&FunctionObj, &'static FunctionObj>(f)
            },
            _ => unreachable!("as_function called on non-function object"),
        }
    }

    pub fn as_function_mut(mut self) -> &'static mut FunctionObj {
        match unsafe { &mut self.0.as_mut().kind } {
            ObjKind::Function(f) => unsafe {
                std::mem::transmute::<&mut FunctionObj, &'static mut FunctionObj>(f)
            },
            _ => unreachable!("as_function_mut called on non-function object"),
        }
    }

    pub fn as_native(self) -> &'static NativeObj {
        match unsafe { &self.0.as_ref().kind } {
            ObjKind::Native(n) => unsafe { std::mem::transmute::<&NativeObj, &'static NativeObj>(n) },
            _ => unreachable!("as_native called on non-native object"),
        }
    }

    pub fn as_closure(self) -> &'static ClosureObj {
        match unsafe { &self.0.as_ref().kind } {
            ObjKind::Closure(c) => unsafe {
                std::mem::transmute::<&ClosureObj, &'static ClosureObj>(c)
            },
            _ => unreachable!("as_closure called on non-closure object"),
        }
    }

    pub fn as_closure_mut(mut self) -> &'static mut ClosureObj {
        match unsafe { &mut self.0.as_mut().kind } {
            ObjKind::Closure(c) => unsafe {
                std::mem::transmute::<&mut ClosureObj, &'static mut ClosureObj>(c)
            },
            _ => unreachable!("as_closure_mut called on non-closure object"),
        }
    }

    pub fn as_upvalue(self) -> &'static UpvalueObj {
        match unsafe { &self.0.as_ref().kind } {
            ObjKind::Upvalue(u) => unsafe {
                std::mem::transmute::<&UpvalueObj, &'static UpvalueObj>(u)
            },
            _ => unreachable!("as_upvalue called on non-upvalue object"),
        }
    }

    pub fn as_upvalue_mut(mut self) -> &'static mut UpvalueObj {
        match unsafe { &mut self.0.as_mut().kind } {
            ObjKind::Upvalue(u) => unsafe {
                std::mem::transmute::<&mut UpvalueObj, &'static mut UpvalueObj>(u)
            },
            _ => unreachable!("as_upvalue_mut called on non-upvalue object"),
        }
    }

    pub fn as_class(self) -> &'static ClassObj {
        match unsafe { &self.0.as_ref().kind } {
            ObjKind::Class(c) => unsafe { std::mem::transmute::<&ClassObj, &'static ClassObj>(c) },
            _ => unreachable!("as_class called on non-class object"),
        }
    }

    pub fn as_class_mut(mut self) -> &'static mut ClassObj {
        match unsafe { &mut self.0.as_mut().kind } {
            ObjKind::Class(c) => unsafe {
                std::mem::transmute::<&mut ClassObj, &'static mut ClassObj>(c)
            },
            _ => unreachable!("as_class_mut called on non-class object"),
        }
    }

    pub fn as_instance(self) -> &'static InstanceObj {
        match unsafe { &self.0.as_ref().kind } {
            ObjKind::Instance(i) => unsafe {
                std::mem::transmute::<&InstanceObj, &'static InstanceObj>(i)
            },
            _ => unreachable!("as_instance called on non-instance object"),
        }
    }

    pub fn as_instance_mut(mut self) -> &'static mut InstanceObj {
        match unsafe { &mut self.0.as_mut().kind } {
            ObjKind::Instance(i) => unsafe {
                std::mem::transmute::<&mut InstanceObj, &'static mut InstanceObj>(i)
            },
            _ => unreachable!("as_instance_mut called on non-instance object"),
        }
    }

    pub fn as_bound_method(self) -> &'static BoundMethodObj {
        match unsafe { &self.0.as_ref().kind } {
            ObjKind::BoundMethod(b) => unsafe {
                std::mem::transmute::<&BoundMethodObj, &'static BoundMethodObj>(b)
            },
            _ => unreachable!("as_bound_method called on non-bound-method object"),
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self.kind(), ObjKind::String(_))
    }

    pub fn is_instance(&self) -> bool {
        matches!(self.kind(), ObjKind::Instance(_))
    }

    /// Human-readable type tag, used in several runtime error messages.
    pub fn type_name(&self) -> &'static str {
        match self.kind() {
            ObjKind::String(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Native(_) => "native function",
            ObjKind::Closure(_) => "function",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
        }
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ObjRef {}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ObjKind::String(s) => write!(f, "{}", s.as_str()),
            ObjKind::Function(func) => match func.name {
                Some(name) => write!(f, "<fn {}>", name.as_string().as_str()),
                None => write!(f, "<script>"),
            },
            ObjKind::Native(_) => write!(f, "<native fn>"),
            ObjKind::Closure(c) => write!(f, "{}", c.function),
            ObjKind::Upvalue(_) => write!(f, "<upvalue>"),
            ObjKind::Class(c) => write!(f, "{}", c.name.as_string().as_str()),
            ObjKind::Instance(i) => write!(f, "{} instance", i.class.as_class().name.as_string().as_str()),
            ObjKind::BoundMethod(b) => write!(f, "{}", b.method),
        }
    }
}
