// File: src/memory.rs
//
// Heap and garbage collector for the Cinder VM.
// Objects live in a slot table and point at each other through `ObjRef`
// handles. An intrusive next-link chains every live object so the sweeper
// visits each exactly once; swept slots go on a free list for reuse.
//
// Collection is precise stop-the-world mark-sweep with a tri-color gray
// worklist. The VM owns the roots, so a cycle looks like: the VM marks its
// roots, then calls `collect` to trace, purge unmarked interned strings,
// sweep, and rescale the trigger threshold.

use std::env;

use crate::object::{hash_string, NativeFn, Obj, ObjClosure, ObjFunction, ObjKind, ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueState};
use crate::table::Table;
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    /// Head of the all-objects list, threaded through `Obj::next`.
    head: Option<ObjRef>,
    /// Intern set: every live string, keyed by content hash, value nil.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    /// Gray worklist. Lives outside the byte accounting.
    gray: Vec<ObjRef>,
    stress: bool,
    log: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
            stress: env::var("CINDER_GC_STRESS").is_ok(),
            log: env::var("CINDER_GC_LOG").is_ok(),
        }
    }

    /// Stress mode collects before every runtime allocation. Exposed so
    /// tests can flip it without going through the environment.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// True when the next runtime allocation should collect first.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    // === Allocation ===

    fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        let size = obj_size(&kind);
        let obj = Obj { kind, marked: false, next: self.head, size };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                index
            }
            None => {
                self.slots.push(Some(obj));
                (self.slots.len() - 1) as u32
            }
        };

        self.bytes_allocated += size;
        let r = ObjRef(index);
        self.head = Some(r);
        if self.log {
            eprintln!("-- gc: allocate {:?} ({} bytes)", r, size);
        }
        r
    }

    /// Interns `chars`, allocating only when no string with the same
    /// contents exists. Calling this twice with equal contents returns the
    /// same handle.
    pub fn copy_string(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self.find_string(chars, hash) {
            return existing;
        }
        self.intern_new(chars.into(), hash)
    }

    /// Interning variant that assumes ownership of an already-built string,
    /// dropping it when an equal string is interned already. Semantically
    /// identical to `copy_string`.
    pub fn take_string(&mut self, chars: String) -> ObjRef {
        let hash = hash_string(&chars);
        if let Some(existing) = self.find_string(&chars, hash) {
            return existing;
        }
        self.intern_new(chars.into_boxed_str(), hash)
    }

    fn intern_new(&mut self, chars: Box<str>, hash: u32) -> ObjRef {
        let r = self.allocate(ObjKind::String(ObjString { chars, hash }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// Content probe of the intern set by (hash, length, bytes).
    fn find_string(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        let slots = &self.slots;
        self.strings.find_key(hash, |key| {
            match &slots[key.0 as usize] {
                Some(Obj { kind: ObjKind::String(s), .. }) => &*s.chars == chars,
                _ => false,
            }
        })
    }

    pub fn new_function(&mut self, function: ObjFunction) -> ObjRef {
        self.allocate(ObjKind::Function(function))
    }

    pub fn new_native(&mut self, function: NativeFn) -> ObjRef {
        self.allocate(ObjKind::Native(ObjNative { function }))
    }

    /// The upvalue array starts empty; the caller fills it while the closure
    /// is reachable from the stack.
    pub fn new_closure(&mut self, function: ObjRef) -> ObjRef {
        let upvalue_count = self.as_function(function).upvalue_count;
        self.allocate(ObjKind::Closure(ObjClosure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }))
    }

    pub fn new_upvalue(&mut self, slot: usize, next: Option<ObjRef>) -> ObjRef {
        self.allocate(ObjKind::Upvalue(ObjUpvalue { state: UpvalueState::Open(slot), next }))
    }

    // === Accessors ===
    //
    // Handles are only created by this heap and never outlive the objects
    // they denote (the collector frees exactly the unreachable), so lookup
    // failures and kind mismatches are interpreter bugs, not user errors.

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.0 as usize].as_ref().expect("use of freed object")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.0 as usize].as_mut().expect("use of freed object")
    }

    pub fn as_string(&self, r: ObjRef) -> &ObjString {
        match &self.get(r).kind {
            ObjKind::String(s) => s,
            _ => panic!("object is not a string"),
        }
    }

    /// The characters of a string object.
    pub fn string(&self, r: ObjRef) -> &str {
        &self.as_string(r).chars
    }

    pub fn as_function(&self, r: ObjRef) -> &ObjFunction {
        match &self.get(r).kind {
            ObjKind::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn as_closure(&self, r: ObjRef) -> &ObjClosure {
        match &self.get(r).kind {
            ObjKind::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn as_closure_mut(&mut self, r: ObjRef) -> &mut ObjClosure {
        match &mut self.get_mut(r).kind {
            ObjKind::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn as_upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match &self.get(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn as_upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match &mut self.get_mut(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    // === Collection ===

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let obj = self.get_mut(r);
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(r);
    }

    /// Traces from the already-marked roots, purges dead interned strings,
    /// sweeps the object list, and rescales the trigger threshold. The VM
    /// marks its roots before calling this.
    pub fn collect(&mut self) {
        let before = self.bytes_allocated;
        if self.log {
            eprintln!("-- gc begin");
        }

        self.trace_references();

        // Interned strings are weak references: drop entries whose string
        // died this cycle so the table never holds a freed handle.
        let slots = &self.slots;
        self.strings.remove_unmarked(|key| {
            slots[key.0 as usize].as_ref().map(|o| o.marked).unwrap_or(false)
        });

        self.sweep();
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;

        if self.log {
            eprintln!(
                "-- gc end: collected {} bytes ({} -> {}), next at {}",
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        // Gather the children first; marking mutates the slot table.
        let mut children: Vec<Value> = Vec::new();
        match &self.get(r).kind {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Upvalue(u) => {
                if let UpvalueState::Closed(value) = u.state {
                    children.push(value);
                }
            }
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend_from_slice(&f.chunk.constants);
            }
            ObjKind::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
        }
        for child in children {
            self.mark_value(child);
        }
    }

    /// Walks the all-objects list, freeing everything unmarked and clearing
    /// the mark bit on survivors.
    fn sweep(&mut self) {
        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.head;

        while let Some(r) = cursor {
            let obj = self.get(r);
            let next = obj.next;
            if obj.marked {
                self.get_mut(r).marked = false;
                prev = Some(r);
            } else {
                match prev {
                    Some(p) => self.get_mut(p).next = next,
                    None => self.head = next,
                }
                self.free_object(r);
            }
            cursor = next;
        }
    }

    fn free_object(&mut self, r: ObjRef) {
        let obj = self.slots[r.0 as usize].take().expect("double free");
        self.bytes_allocated -= obj.size;
        self.free.push(r.0);
        if self.log {
            eprintln!("-- gc: free {:?} ({} bytes)", r, obj.size);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

/// Approximate byte cost charged when an object is allocated. Payload sizes
/// are estimated up front so the credit on free always matches the charge.
fn obj_size(kind: &ObjKind) -> usize {
    let base = std::mem::size_of::<Obj>();
    base + match kind {
        ObjKind::String(s) => s.chars.len(),
        ObjKind::Function(f) => {
            f.chunk.code.len()
                + f.chunk.lines.len() * std::mem::size_of::<usize>()
                + f.chunk.constants.len() * std::mem::size_of::<Value>()
        }
        ObjKind::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
        ObjKind::Native(_) | ObjKind::Upvalue(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_string_interns() {
        let mut heap = Heap::new();
        let a = heap.copy_string("foo");
        let b = heap.copy_string("foo");
        let c = heap.copy_string("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn take_string_deduplicates_against_copies() {
        let mut heap = Heap::new();
        let a = heap.copy_string("shared");
        let b = heap.take_string(String::from("shared"));
        assert_eq!(a, b);

        let fresh = heap.take_string(String::from("fresh"));
        assert_eq!(heap.string(fresh), "fresh");
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let live = heap.copy_string("live");
        let _dead = heap.copy_string("dead");
        let before = heap.bytes_allocated();

        heap.mark_object(live);
        heap.collect();

        assert!(heap.bytes_allocated() < before);
        assert_eq!(heap.string(live), "live");
        // The dead string left the intern set too, so re-copying it
        // allocates a fresh object rather than resurrecting the old handle.
        let reborn = heap.copy_string("dead");
        assert_eq!(heap.string(reborn), "dead");
    }

    #[test]
    fn collect_traces_closure_graphs() {
        let mut heap = Heap::new();
        let name = heap.copy_string("f");
        let function = heap.new_function(ObjFunction {
            arity: 0,
            upvalue_count: 1,
            chunk: crate::bytecode::Chunk::new(),
            name: Some(name),
        });
        let closure = heap.new_closure(function);
        let upvalue = heap.new_upvalue(0, None);
        heap.as_closure_mut(closure).upvalues.push(upvalue);

        heap.mark_object(closure);
        heap.collect();

        // Everything reachable from the closure survived.
        assert_eq!(heap.as_closure(closure).function, function);
        assert_eq!(heap.as_function(function).name, Some(name));
        assert!(heap.as_upvalue(upvalue).open_slot().is_some());
    }

    #[test]
    fn swept_slots_are_recycled() {
        let mut heap = Heap::new();
        let dead = heap.copy_string("gone");
        heap.collect();
        let reused = heap.copy_string("new");
        // Slot indices are recycled once their object is freed.
        assert_eq!(dead.0, reused.0);
    }
}
