// The memory manager: allocation funnel plus a precise, non-moving,
// stop-the-world mark-sweep collector (spec §4.4).
//
// Grounded on the same shape `other_examples`' `rlox` reference uses (a
// VM-owned list of heap objects, a weak string intern table swept before
// objects are freed, `bytesAllocated`/`nextGC` bookkeeping) but expressed
// with an intrusive linked list of raw, non-moving allocations — the
// `next`-pointer chain spec §3 calls for — instead of a `Vec<Box<dyn
// Trace>>`. Every `GcRef` handed out stays valid for as long as it is
// reachable from a root; the collector never moves an object.

use std::collections::HashMap;
use std::ptr::NonNull;

use ahash::RandomState;

use crate::value::{fnv1a_hash, GcRef, Obj, ObjKind, ObjString, Value};

/// Growth factor applied to `next_gc` after each collection (spec §4.4).
const GC_GROWTH_FACTOR: usize = 2;
/// Collections are not worth running until the heap has grown past this
/// floor, so a freshly started VM doesn't collect after its first few
/// allocations.
const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

pub struct Heap {
    objects: Option<GcRef>,
    /// Weak references for deduplication: a string's owning `Obj` lives in
    /// `objects`, this table only maps content to the matching `GcRef`.
    strings: HashMap<Box<str>, GcRef, RandomState>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect on every allocation point, regardless of threshold (spec
    /// §4.4 "when stress mode is enabled always").
    pub stress: bool,
    pub log_gc: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: None,
            strings: HashMap::with_hasher(RandomState::new()),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            stress: false,
            log_gc: false,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    fn link(&mut self, obj: Box<Obj>, size: usize) -> GcRef {
        self.bytes_allocated += size;
        let ptr = NonNull::new(Box::into_raw(obj)).expect("Box::into_raw is never null");
        let gc_ref = GcRef::new(ptr);
        gc_ref.get().next.set(self.objects);
        self.objects = Some(gc_ref);
        gc_ref
    }

    pub fn allocate(&mut self, kind: ObjKind) -> GcRef {
        let size = std::mem::size_of::<Obj>();
        let obj = Box::new(Obj {
            marked: std::cell::Cell::new(false),
            next: std::cell::Cell::new(None),
            kind,
        });
        self.link(obj, size)
    }

    /// Interns `bytes`: repeated calls with equal content return the same
    /// `GcRef` (spec's string-interning invariant and testable property).
    pub fn intern(&mut self, bytes: &str) -> GcRef {
        if let Some(existing) = self.strings.get(bytes) {
            return *existing;
        }
        let hash = fnv1a_hash(bytes.as_bytes());
        let gc_ref = self.allocate(ObjKind::String(ObjString {
            bytes: bytes.into(),
            hash,
        }));
        self.strings.insert(bytes.into(), gc_ref);
        gc_ref
    }

    /// Runs one full mark-sweep cycle. `roots` marks every live value
    /// reachable from the VM and (if compiling) the active compiler chain;
    /// tracing and sweeping are entirely the heap's responsibility.
    pub fn collect_garbage(&mut self, mark_roots: impl FnOnce(&mut Vec<GcRef>)) {
        let before = self.bytes_allocated;
        if self.log_gc {
            eprintln!("-- gc begin");
        }

        let mut gray_stack: Vec<GcRef> = Vec::new();
        mark_roots(&mut gray_stack);
        for r in &gray_stack {
            r.get().marked.set(true);
        }

        // Trace references: pop each gray object and blacken it by marking
        // its referents, pushing any newly-marked object back onto the
        // worklist. `gray_stack` is a plain `Vec`, never itself subject to
        // collection mid-trace (spec §9: "allocation during allocation").
        while let Some(gc_ref) = gray_stack.pop() {
            self.blacken(gc_ref, &mut gray_stack);
        }

        self.sweep_strings();
        self.sweep_objects();

        self.next_gc = (self.bytes_allocated * GC_GROWTH_FACTOR).max(GC_INITIAL_THRESHOLD);
        if self.log_gc {
            eprintln!(
                "-- gc end: collected {} bytes (from {} to {}), next at {}",
                before.saturating_sub(self.bytes_allocated),
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    fn mark_value(value: &Value, gray_stack: &mut Vec<GcRef>) {
        if let Value::Obj(r) = value {
            Self::mark_object(*r, gray_stack);
        }
    }

    pub fn mark_object(gc_ref: GcRef, gray_stack: &mut Vec<GcRef>) {
        let obj = gc_ref.get();
        if obj.marked.get() {
            return;
        }
        obj.marked.set(true);
        gray_stack.push(gc_ref);
    }

    fn blacken(&self, gc_ref: GcRef, gray_stack: &mut Vec<GcRef>) {
        let obj = gc_ref.get();
        match &obj.kind {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    Self::mark_object(name, gray_stack);
                }
                for constant in &f.chunk.constants {
                    Self::mark_value(constant, gray_stack);
                }
            }
            ObjKind::Closure(c) => {
                Self::mark_object(c.function, gray_stack);
                for uv in &c.upvalues {
                    Self::mark_object(*uv, gray_stack);
                }
            }
            ObjKind::Upvalue(uv) => {
                if let crate::value::ObjUpvalue::Closed(v) = &*uv.borrow() {
                    Self::mark_value(v, gray_stack);
                }
            }
            ObjKind::Class(class) => {
                let class = class.borrow();
                Self::mark_object(class.name, gray_stack);
                for (&name, method) in class.methods.iter() {
                    Self::mark_object(name, gray_stack);
                    Self::mark_value(method, gray_stack);
                }
            }
            ObjKind::Instance(inst) => {
                let inst = inst.borrow();
                Self::mark_object(inst.class, gray_stack);
                for (&name, value) in inst.fields.iter() {
                    Self::mark_object(name, gray_stack);
                    Self::mark_value(value, gray_stack);
                }
            }
            ObjKind::BoundMethod(bound) => {
                Self::mark_value(&bound.receiver, gray_stack);
                Self::mark_object(bound.method, gray_stack);
            }
        }
    }

    /// Weak references: drop any interned string that didn't get marked
    /// this cycle *before* the sweep below frees it, or the intern table
    /// would keep a dangling key (spec §4.4 step 3 / §9).
    fn sweep_strings(&mut self) {
        self.strings.retain(|_, gc_ref| gc_ref.get().marked.get());
    }

    fn sweep_objects(&mut self) {
        let mut previous: Option<GcRef> = None;
        let mut current = self.objects;
        while let Some(gc_ref) = current {
            let obj = gc_ref.get();
            let next = obj.next.get();
            if obj.marked.get() {
                obj.marked.set(false);
                previous = Some(gc_ref);
                current = next;
            } else {
                current = next;
                match previous {
                    Some(prev) => prev.get().next.set(next),
                    None => self.objects = next,
                }
                self.free(gc_ref);
            }
        }
    }

    fn free(&mut self, gc_ref: GcRef) {
        let size = std::mem::size_of::<Obj>();
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        // SAFETY: `gc_ref` was produced by `Box::into_raw` in `link` and has
        // just been unlinked from `objects`, so this is the only remaining
        // reference to it; nothing else in the heap can reach a freed
        // object because the mark phase above ran to a fixed point first.
        unsafe {
            drop(Box::from_raw(gc_ref.as_ptr()));
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects;
        while let Some(gc_ref) = current {
            let next = gc_ref.get().next.get();
            unsafe {
                drop(Box::from_raw(gc_ref.as_ptr()));
            }
            current = next;
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_identical_reference_for_equal_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn unreachable_object_is_collected() {
        let mut heap = Heap::new();
        let _kept = heap.intern("kept");
        heap.intern("dropped");
        assert_eq!(heap.strings.len(), 2);

        heap.collect_garbage(|gray| {
            // Only mark "kept"; "dropped" has no root and should be swept.
            gray.push(_kept);
        });

        assert_eq!(heap.strings.len(), 1);
        assert!(heap.strings.contains_key("kept"));
    }

    #[test]
    fn collecting_twice_with_no_mutation_is_idempotent() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        heap.collect_garbage(|gray| gray.push(kept));
        let bytes_after_first = heap.bytes_allocated();
        heap.collect_garbage(|gray| gray.push(kept));
        assert_eq!(heap.bytes_allocated(), bytes_after_first);
        assert_eq!(heap.strings.len(), 1);
    }
}
