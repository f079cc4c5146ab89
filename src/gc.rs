//! §4.4 Garbage collector — the heap allocator and the tri-color
//! mark-sweep collector that runs over it.
//!
//! Collection is triggered *before* a new object is constructed (mirroring
//! the original `reallocate`, which checks the threshold ahead of the
//! `realloc` call it wraps) so a collection never has to reason about an
//! object that doesn't exist yet. Every allocation path that builds up a
//! multi-field object incrementally (`OP_CLOSURE`, `capture_upvalue`)
//! roots its result before recursing into further allocations — see
//! `vm.rs` for where that discipline lives. The function a `Compiler` is
//! currently building is itself allocated on this heap (not assembled as
//! a detached Rust value and linked in only once finished), so it can be
//! kept in `compiler_roots` as an ordinary `ObjRef` for its whole
//! lifetime instead of needing a separate unrooted window around the
//! allocation that finalizes it.

use std::cell::Cell;
use std::mem::size_of_val;
use std::ptr::NonNull;

use super::object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeObj, Obj, ObjKind,
    ObjRef, StringObj, UpvalueObj,
};
use super::table::Table;
use super::value::{fnv1a_hash, Value};
use super::vm::CallFrame;

const INITIAL_NEXT_GC: usize = 1024 * 1024;
const HEAP_GROWTH_FACTOR: usize = 2;

pub struct Heap {
    objects: Option<ObjRef>,
    pub strings: Table,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    gray_stack: Vec<ObjRef>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            gray_stack: Vec::new(),
        }
    }

    fn link(&mut self, kind: ObjKind, size: usize) -> ObjRef {
        let obj = Box::new(Obj {
            marked: Cell::new(false),
            next: self.objects,
            kind,
        });
        let raw = NonNull::from(Box::leak(obj));
        let obj_ref = ObjRef::from_raw(raw);
        self.objects = Some(obj_ref);
        self.bytes_allocated += size;
        obj_ref
    }

    pub fn alloc_string_raw(&mut self, bytes: Box<[u8]>, hash: u32) -> ObjRef {
        let size = bytes.len() + size_of_val(&bytes);
        self.link(ObjKind::String(StringObj { bytes, hash }), size)
    }

    pub fn alloc_function(&mut self, function: FunctionObj) -> ObjRef {
        let size = size_of_val(&function);
        self.link(ObjKind::Function(function), size)
    }

    pub fn alloc_native(&mut self, native: NativeObj) -> ObjRef {
        let size = size_of_val(&native);
        self.link(ObjKind::Native(native), size)
    }

    pub fn alloc_closure(&mut self, closure: ClosureObj) -> ObjRef {
        let size = size_of_val(&closure);
        self.link(ObjKind::Closure(closure), size)
    }

    pub fn alloc_upvalue(&mut self, upvalue: UpvalueObj) -> ObjRef {
        let size = size_of_val(&upvalue);
        self.link(ObjKind::Upvalue(upvalue), size)
    }

    pub fn alloc_class(&mut self, class: ClassObj) -> ObjRef {
        let size = size_of_val(&class);
        self.link(ObjKind::Class(class), size)
    }

    pub fn alloc_instance(&mut self, instance: InstanceObj) -> ObjRef {
        let size = size_of_val(&instance);
        self.link(ObjKind::Instance(instance), size)
    }

    pub fn alloc_bound_method(&mut self, bound: BoundMethodObj) -> ObjRef {
        let size = size_of_val(&bound);
        self.link(ObjKind::BoundMethod(bound), size)
    }

    /// §5 `free_vm`: walk the same intrusive list the sweep uses and free
    /// every remaining object.
    pub fn free_all(&mut self) {
        let mut current = self.objects.take();
        while let Some(obj_ref) = current {
            current = obj_ref.next();
            unsafe {
                drop(Box::from_raw(obj_ref.ptr().as_ptr()));
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.free_all();
    }
}

/// Everything the collector needs to find roots, borrowed read-only —
/// marking never needs to mutate the stack/frames/globals themselves,
/// only the `marked` cells inside the objects they point at.
pub struct Roots<'a> {
    pub stack: &'a [Value],
    pub frames: &'a [CallFrame],
    pub open_upvalues: Option<ObjRef>,
    pub globals: &'a Table,
    /// The `FunctionObj` heap object owned by every `Compiler` frame
    /// currently on the native call stack (§4.4 "every compiler in the
    /// enclosing chain"), already linked into this same heap. Each is
    /// pushed the moment that frame's function is allocated and popped
    /// only once it has been embedded as a constant in its enclosing
    /// chunk (or, for the top-level script, handed back to the caller) —
    /// see `Vm::push_compiler_root`.
    pub compiler_roots: &'a [ObjRef],
}

pub fn maybe_collect(heap: &mut Heap, roots: Roots) {
    if cfg!(feature = "stress_gc") || heap.bytes_allocated > heap.next_gc {
        collect_garbage(heap, roots);
    }
}

pub fn collect_garbage(heap: &mut Heap, roots: Roots) {
    mark_roots(heap, &roots);
    trace_references(heap);
    heap.strings.remove_unmarked_keys();
    sweep(heap);
    heap.next_gc = heap.bytes_allocated * HEAP_GROWTH_FACTOR;
}

fn mark_roots(heap: &mut Heap, roots: &Roots) {
    for value in roots.stack {
        mark_value(heap, *value);
    }
    for frame in roots.frames {
        mark_object(heap, frame.closure);
    }
    let mut upvalue = roots.open_upvalues;
    while let Some(u) = upvalue {
        mark_object(heap, u);
        upvalue = u.as_upvalue().next;
    }
    for (key, value) in roots.globals.iter() {
        mark_object(heap, key);
        mark_value(heap, value);
    }
    for &function in roots.compiler_roots {
        mark_object(heap, function);
    }
}

pub fn mark_value(heap: &mut Heap, value: Value) {
    if let Value::Obj(obj) = value {
        mark_object(heap, obj);
    }
}

pub fn mark_object(heap: &mut Heap, obj: ObjRef) {
    if obj.marked() {
        return;
    }
    obj.set_marked(true);
    heap.gray_stack.push(obj);
}

fn trace_references(heap: &mut Heap) {
    while let Some(obj) = heap.gray_stack.pop() {
        blacken(heap, obj);
    }
}

fn blacken(heap: &mut Heap, obj: ObjRef) {
    match obj.kind() {
        ObjKind::String(_) | ObjKind::Native(_) => {}
        ObjKind::Function(f) => {
            if let Some(name) = f.name {
                mark_object(heap, name);
            }
            for constant in f.chunk.constants() {
                mark_value(heap, *constant);
            }
        }
        ObjKind::Closure(c) => {
            mark_object(heap, c.function);
            for up in c.upvalues.iter().flatten() {
                mark_object(heap, *up);
            }
        }
        ObjKind::Upvalue(u) => mark_value(heap, u.closed),
        ObjKind::Class(c) => {
            mark_object(heap, c.name);
            for (key, value) in c.methods.iter() {
                mark_object(heap, key);
                mark_value(heap, value);
            }
        }
        ObjKind::Instance(i) => {
            mark_object(heap, i.class);
            for (key, value) in i.fields.iter() {
                mark_object(heap, key);
                mark_value(heap, value);
            }
        }
        ObjKind::BoundMethod(b) => {
            mark_value(heap, b.receiver);
            mark_object(heap, b.method);
        }
    }
}

fn sweep(heap: &mut Heap) {
    let mut previous: Option<ObjRef> = None;
    let mut current = heap.objects;
    while let Some(obj) = current {
        let next = obj.next();
        if obj.marked() {
            obj.set_marked(false);
            previous = Some(obj);
            current = next;
        } else {
            match previous {
                Some(p) => unsafe {
                    (*p.ptr().as_ptr()).next = next;
                },
                None => heap.objects = next,
            }
            let size = object_size(obj);
            heap.bytes_allocated = heap.bytes_allocated.saturating_sub(size);
            unsafe {
                drop(Box::from_raw(obj.ptr().as_ptr()));
            }
            current = next;
        }
    }
}

fn object_size(obj: ObjRef) -> usize {
    match obj.kind() {
        ObjKind::String(s) => s.bytes.len() + size_of_val(s),
        ObjKind::Function(f) => size_of_val(f),
        ObjKind::Native(n) => size_of_val(n),
        ObjKind::Closure(c) => size_of_val(c),
        ObjKind::Upvalue(u) => size_of_val(u),
        ObjKind::Class(c) => size_of_val(c),
        ObjKind::Instance(i) => size_of_val(i),
        ObjKind::BoundMethod(b) => size_of_val(b),
    }
}

/// Shared by every call site that needs a canonical interned string: a
/// hit in `heap.strings` returns the existing object, a miss allocates
/// one and interns it. Allocating strings never goes through
/// `maybe_collect` directly here — callers that can trigger a collection
/// (i.e. on a miss) go through `Vm::intern_string`, which has access to
/// the full root set; this free function only touches the heap.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    fnv1a_hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_count(heap: &Heap) -> usize {
        let mut count = 0;
        let mut current = heap.objects;
        while let Some(obj) = current {
            count += 1;
            current = obj.next();
        }
        count
    }

    #[test]
    fn sweep_frees_unreachable_objects_and_keeps_rooted_ones() {
        let mut heap = Heap::new();
        let kept_hash = hash_bytes(b"kept");
        let kept = heap.alloc_string_raw(b"kept".to_vec().into_boxed_slice(), kept_hash);
        heap.alloc_string_raw(b"dropped".to_vec().into_boxed_slice(), hash_bytes(b"dropped"));
        assert_eq!(object_count(&heap), 2);

        let stack = vec![Value::Obj(kept)];
        let frames: Vec<CallFrame> = Vec::new();
        let globals = Table::new();
        let roots = Roots {
            stack: &stack,
            frames: &frames,
            open_upvalues: None,
            globals: &globals,
            compiler_roots: &[],
        };
        collect_garbage(&mut heap, roots);

        assert_eq!(object_count(&heap), 1);
        assert!(!kept.marked());
    }

    /// §4.4 "String weak-ref fixup": an interned string with no other
    /// reachable reference is dropped from the intern table, not just the
    /// object list.
    #[test]
    fn unreferenced_interned_strings_are_evicted_from_the_string_table() {
        let mut heap = Heap::new();
        let hash = hash_bytes(b"temp");
        let interned = heap.alloc_string_raw(b"temp".to_vec().into_boxed_slice(), hash);
        heap.strings.set(interned, Value::Nil);
        assert!(heap.strings.find_string(b"temp", hash).is_some());

        let stack: Vec<Value> = Vec::new();
        let frames: Vec<CallFrame> = Vec::new();
        let globals = Table::new();
        let roots = Roots {
            stack: &stack,
            frames: &frames,
            open_upvalues: None,
            globals: &globals,
            compiler_roots: &[],
        };
        collect_garbage(&mut heap, roots);

        assert!(heap.strings.find_string(b"temp", hash).is_none());
        assert_eq!(object_count(&heap), 0);
    }
}
