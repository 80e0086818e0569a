/// Object graph and collector
///
/// Every heap object lives in a slot of the object table with a standard
/// header: class back-pointer, reference count, white/grey list links and
/// the container-lock owner.  Reference counting reclaims acyclic garbage
/// eagerly; a stop-the-world mark-sweep pass reclaims cycles.  The two
/// doubly-linked lists swap roles at the start of a pass and every
/// reachable object migrates back to the white list with a fresh count.
///
/// The whole structure, thread value stacks included, sits behind the
/// global object lock; nothing in here blocks or calls back into method
/// dispatch.

use std::sync::Arc;
use std::thread::ThreadId;

use crate::core::value::{Builtin, Cell, ObjRef, Value, BUILTIN_COUNT};
use crate::errors::Fatal;
use crate::mem::{Arena, BufRef};

/// A collection is forced after this many allocations.
const COLLECT_ALLOC_LIMIT: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ClassShape {
    pub name: Option<ObjRef>,
    pub parent: Option<ObjRef>,
    pub ns: Option<ObjRef>,
    pub vars: Option<ObjRef>,
    pub cl_methods: Option<ObjRef>,
    pub inst_methods: Option<ObjRef>,
}

impl ClassShape {
    pub fn empty() -> ClassShape {
        ClassShape {
            name: None,
            parent: None,
            ns: None,
            vars: None,
            cl_methods: None,
            inst_methods: None,
        }
    }
}

#[derive(Debug)]
pub struct NsCore {
    pub name: Option<ObjRef>,
    pub parent: Option<ObjRef>,
    pub dict: Option<ObjRef>,
}

/// A loaded native library.  Dropping the last holder runs the optional
/// fini entry and releases the library.
pub struct ModuleLib {
    pub name: String,
    pub lib: libloading::Library,
}

impl Drop for ModuleLib {
    fn drop(&mut self) {
        let sym = format!("__{}_fini__\0", self.name);
        unsafe {
            if let Ok(fini) = self.lib.get::<unsafe extern "C" fn()>(sym.as_bytes()) {
                fini();
            }
        }
    }
}

impl std::fmt::Debug for ModuleLib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModuleLib({})", self.name)
    }
}

#[derive(Debug)]
pub struct ModuleShape {
    pub ns: NsCore,
    pub filename: Option<ObjRef>,
    pub sha1: Option<ObjRef>,
    pub lib: Option<Arc<ModuleLib>>,
}

#[derive(Debug)]
pub enum FileHandle {
    File(std::fs::File),
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub struct FileShape {
    pub filename: Option<ObjRef>,
    pub mode: Option<ObjRef>,
    pub handle: FileHandle,
    pub eof: bool,
    pub pushback: Option<u8>,
}

#[derive(Debug)]
pub struct SetShape {
    /// Bucket heads; each bucket is a chain of List objects.  The table
    /// size is always a power of two.
    pub table: Box<[Option<ObjRef>]>,
    pub count: u32,
}

#[derive(Debug)]
pub enum Shape {
    /// String payload in the arena, NUL-terminated.
    Str(BufRef),
    /// Byte-array payload in the arena, no terminator.
    Barray(BufRef),
    Pair(Cell, Cell),
    List { item: Cell, next: Option<ObjRef> },
    Array(Box<[Cell]>),
    Slice { underlying: ObjRef, ofs: usize, len: usize },
    Set(SetShape),
    Class(Box<ClassShape>),
    Ns(Box<NsCore>),
    Module(Box<ModuleShape>),
    File(Box<FileShape>),
}

// ---------------------------------------------------------------------------
// Object header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    White,
    Grey,
}

#[derive(Debug)]
struct Obj {
    class: Option<ObjRef>,
    ref_cnt: u32,
    prev: Option<u32>,
    next: Option<u32>,
    list: ListId,
    /// Container-lock owner; re-entry by the owner is a descent loop.
    lock_owner: Option<ThreadId>,
    shape: Shape,
}

#[derive(Debug, Default)]
struct GcList {
    head: Option<u32>,
    tail: Option<u32>,
}

// ---------------------------------------------------------------------------
// Thread value stacks
// ---------------------------------------------------------------------------

/// A thread's value stack.  Registered here so the collector can scan
/// every live cell as a root; the owning thread is the only mutator.
#[derive(Debug)]
struct VStack {
    cells: Vec<Cell>,
    limit: usize,
}

/// Position of a bucket edge inside a set or a `next` edge inside a list
/// node; the unit of splicing for hash-table updates.
#[derive(Debug, Clone, Copy)]
pub enum Edge {
    Bucket(ObjRef, usize),
    Next(ObjRef),
}

pub enum LockTry {
    Acquired,
    OwnedBySelf,
    Busy,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub collections: u64,
    pub swept: u64,
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

pub struct Heap {
    arena: Arena,
    slots: Vec<Option<Obj>>,
    free_slots: Vec<u32>,
    white: GcList,
    grey: GcList,
    consts: [Option<ObjRef>; BUILTIN_COUNT],
    main_ns: Option<ObjRef>,
    stacks: Vec<Option<VStack>>,
    collecting: bool,
    collect_again: bool,
    alloc_cnt: u64,
    pub stats: GcStats,
}

impl Heap {
    pub fn new(page_size: usize) -> Heap {
        Heap {
            arena: Arena::new(page_size),
            slots: Vec::new(),
            free_slots: Vec::new(),
            white: GcList::default(),
            grey: GcList::default(),
            consts: [None; BUILTIN_COUNT],
            main_ns: None,
            stacks: Vec::new(),
            collecting: false,
            collect_again: false,
            alloc_cnt: 0,
            stats: GcStats::default(),
        }
    }

    // -- constants table and root namespace ---------------------------------

    pub fn builtin(&self, b: Builtin) -> ObjRef {
        self.consts[b.index()].expect("builtin class not bootstrapped")
    }

    pub fn builtin_opt(&self, b: Builtin) -> Option<ObjRef> {
        self.consts[b.index()]
    }

    /// Store a bootstrapped class in the constants table; the table entry
    /// holds one reference.
    pub fn set_builtin(&mut self, b: Builtin, r: ObjRef) {
        debug_assert!(self.consts[b.index()].is_none());
        self.retain(Some(r));
        self.consts[b.index()] = Some(r);
    }

    pub fn main_ns(&self) -> ObjRef {
        self.main_ns.expect("main namespace not bootstrapped")
    }

    pub fn set_main_ns(&mut self, r: ObjRef) {
        self.retain(Some(r));
        self.main_ns = Some(r);
    }

    /// True when `r` is one of the built-in class objects.
    pub fn builtin_of(&self, r: ObjRef) -> Option<Builtin> {
        Builtin::ALL.into_iter().find(|b| self.consts[b.index()] == Some(r))
    }

    // -- object access ------------------------------------------------------

    #[inline]
    fn obj(&self, r: ObjRef) -> &Obj {
        self.slots[r.idx()].as_ref().expect("dangling object reference")
    }

    #[inline]
    fn obj_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.idx()].as_mut().expect("dangling object reference")
    }

    #[inline]
    pub fn shape(&self, r: ObjRef) -> &Shape {
        &self.obj(r).shape
    }

    /// Raw class of an object; does not consult `__instanceof__`.
    pub fn class_of_raw(&self, r: ObjRef) -> ObjRef {
        self.obj(r).class.expect("object without class")
    }

    /// Raw class of a cell value.
    pub fn class_of_value_raw(&self, v: &Value) -> ObjRef {
        match v {
            Value::Obj(Some(r))  => self.class_of_raw(*r),
            Value::Obj(None)     => self.builtin(Builtin::Object),
            Value::Bool(_)       => self.builtin(Builtin::Boolean),
            Value::Int(_)        => self.builtin(Builtin::Integer),
            Value::Float(_)      => self.builtin(Builtin::Float),
            Value::Method(_)     => self.builtin(Builtin::Method),
            Value::Codemethod(_) => self.builtin(Builtin::Codemethod),
        }
    }

    /// Walk the parent chain: is `cl` equal to or below `ancestor`?
    pub fn is_subclass_of(&self, cl: ObjRef, ancestor: ObjRef) -> bool {
        let mut cur = Some(cl);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.class_shape(c).parent;
        }
        false
    }

    pub fn is_instance_of(&self, v: &Value, b: Builtin) -> bool {
        match v {
            Value::Obj(Some(r)) => self.class_of_raw(*r) == self.builtin(b),
            _ => false,
        }
    }

    pub fn value_is_kind_of(&self, v: &Value, b: Builtin) -> bool {
        self.is_subclass_of(self.class_of_value_raw(v), self.builtin(b))
    }

    // -- reference counting -------------------------------------------------

    pub fn retain(&mut self, r: Option<ObjRef>) {
        if let Some(r) = r {
            let o = self.obj_mut(r);
            o.ref_cnt += 1;
            debug_assert!(o.ref_cnt != 0);
        }
    }

    pub fn retain_cell(&mut self, c: &Cell) {
        self.retain(c.as_obj());
    }

    pub fn release(&mut self, r: Option<ObjRef>) {
        let Some(r) = r else { return };
        let o = self.obj_mut(r);
        debug_assert!(o.ref_cnt != 0);
        o.ref_cnt -= 1;
        if o.ref_cnt == 0 {
            self.finalize(r);
        }
    }

    pub fn release_cell(&mut self, c: &Cell) {
        self.release(c.as_obj());
    }

    /// Reclaim an object whose count fell to zero, plus everything that
    /// transitively drains with it.  Deferred when a collection is in
    /// progress; the pass then repeats.
    fn finalize(&mut self, r: ObjRef) {
        if self.collecting {
            self.collect_again = true;
            return;
        }
        let mut queue = vec![r];
        while let Some(r) = queue.pop() {
            self.list_unlink(r);
            let obj = self.slots[r.idx()].take().expect("finalize of dead object");
            self.free_slots.push(r.0);
            let mut drop_ref = |h: &mut Heap, c: Option<ObjRef>| {
                if let Some(c) = c {
                    let o = h.obj_mut(c);
                    debug_assert!(o.ref_cnt != 0);
                    o.ref_cnt -= 1;
                    if o.ref_cnt == 0 {
                        queue.push(c);
                    }
                }
            };
            drop_ref(self, obj.class);
            let mut children = Vec::new();
            shape_children(&obj.shape, &mut children);
            for c in children {
                drop_ref(self, Some(c));
            }
            self.destroy_shape(obj.shape);
        }
    }

    /// Release the out-of-band resources of a shape (arena payloads; file
    /// and library handles go with the drop).
    fn destroy_shape(&mut self, shape: Shape) {
        match shape {
            Shape::Str(buf) | Shape::Barray(buf) => self.arena.free(buf),
            _ => {}
        }
    }

    // -- cell assignment ----------------------------------------------------

    /// Place `src` into an already-released slot and return the retained
    /// clone.  Callers pair this with a release of the old cell.
    fn counted(&mut self, src: &Cell) -> Cell {
        self.retain_cell(src);
        src.clone()
    }

    // -- allocation ---------------------------------------------------------

    /// Bump the allocation counter and run the periodic collection.
    fn bump_alloc(&mut self) {
        self.alloc_cnt += 1;
        if self.alloc_cnt >= COLLECT_ALLOC_LIMIT && !self.collecting {
            self.alloc_cnt = 0;
            self.collect();
        }
    }

    /// Arena allocation with the collect-and-retry contract: a failed
    /// mapping triggers one collection; a second failure is fatal to the
    /// process.
    fn alloc_buf(&mut self, data: &[u8]) -> BufRef {
        self.bump_alloc();
        if let Some(buf) = self.arena.alloc_copy(data) {
            return buf;
        }
        self.collect();
        match self.arena.alloc_copy(data) {
            Some(buf) => buf,
            None => {
                eprintln!("opal: out of memory");
                std::process::exit(1);
            }
        }
    }

    /// Insert a fresh object on the white list with a zero count.  The
    /// caller must root it immediately (store it into a counted location).
    fn insert_obj(&mut self, class: Option<ObjRef>, shape: Shape) -> ObjRef {
        self.retain(class);
        let obj = Obj {
            class,
            ref_cnt: 0,
            prev: None,
            next: None,
            list: ListId::White,
            lock_owner: None,
            shape,
        };
        let r = match self.free_slots.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(obj);
                ObjRef(i)
            }
            None => {
                self.slots.push(Some(obj));
                ObjRef((self.slots.len() - 1) as u32)
            }
        };
        self.list_push_tail(ListId::White, r);
        r
    }

    /// Allocate an object and assign it to a stack cell, which holds the
    /// first reference.
    pub fn alloc_into(
        &mut self,
        tid: usize,
        dst: usize,
        class: Option<ObjRef>,
        shape: Shape,
    ) -> Result<ObjRef, Fatal> {
        self.bump_alloc();
        let r = self.insert_obj(class, shape);
        self.stack_set_value(tid, dst, Value::Obj(Some(r)))?;
        Ok(r)
    }

    // -- GC lists -----------------------------------------------------------

    fn list_mut(&mut self, id: ListId) -> &mut GcList {
        match id {
            ListId::White => &mut self.white,
            ListId::Grey  => &mut self.grey,
        }
    }

    fn list_push_tail(&mut self, id: ListId, r: ObjRef) {
        let old_tail = self.list_mut(id).tail;
        {
            let o = self.obj_mut(r);
            o.list = id;
            o.prev = old_tail;
            o.next = None;
        }
        match old_tail {
            Some(t) => self.obj_mut(ObjRef(t)).next = Some(r.0),
            None    => self.list_mut(id).head = Some(r.0),
        }
        self.list_mut(id).tail = Some(r.0);
    }

    fn list_unlink(&mut self, r: ObjRef) {
        let (id, prev, next) = {
            let o = self.obj(r);
            (o.list, o.prev, o.next)
        };
        match prev {
            Some(p) => self.obj_mut(ObjRef(p)).next = next,
            None    => self.list_mut(id).head = next,
        }
        match next {
            Some(n) => self.obj_mut(ObjRef(n)).prev = prev,
            None    => self.list_mut(id).tail = prev,
        }
    }

    // -- mark and sweep -----------------------------------------------------

    /// Mark one root edge: bump the count and, on first contact, migrate
    /// the object back to the white list and trace its children.
    pub fn mark(&mut self, r: Option<ObjRef>) {
        let mut work = Vec::new();
        self.mark_edge(r, &mut work);
        while let Some(r) = work.pop() {
            let class = self.obj(r).class;
            self.mark_edge(class, &mut work);
            let mut children = Vec::new();
            shape_children(&self.obj(r).shape, &mut children);
            for c in children {
                self.mark_edge(Some(c), &mut work);
            }
        }
    }

    fn mark_edge(&mut self, r: Option<ObjRef>, work: &mut Vec<ObjRef>) {
        let Some(r) = r else { return };
        let o = self.obj_mut(r);
        o.ref_cnt += 1;
        if o.ref_cnt == 1 {
            self.list_unlink(r);
            self.list_push_tail(ListId::White, r);
            work.push(r);
        }
    }

    pub fn mark_cell(&mut self, c: &Cell) {
        self.mark(c.as_obj());
    }

    /// Stop-the-world collection.  Swap the lists, reset every count, mark
    /// from the roots, then destroy whatever is left on the grey list.
    /// Repeats while a deferred release fired during the sweep.
    pub fn collect(&mut self) {
        if self.collecting {
            return;
        }
        self.collecting = true;
        self.stats.collections += 1;
        let mut swept = 0u64;
        loop {
            self.collect_again = false;

            std::mem::swap(&mut self.white, &mut self.grey);
            let mut cur = self.grey.head;
            while let Some(i) = cur {
                let o = self.obj_mut(ObjRef(i));
                o.list = ListId::Grey;
                o.ref_cnt = 0;
                cur = o.next;
            }

            for i in 0..BUILTIN_COUNT {
                self.mark(self.consts[i]);
            }
            self.mark(self.main_ns);
            for t in 0..self.stacks.len() {
                let len = match &self.stacks[t] {
                    Some(s) => s.cells.len(),
                    None    => continue,
                };
                for i in 0..len {
                    let c = self.stacks[t].as_ref().unwrap().cells[i].clone();
                    self.mark_cell(&c);
                }
            }

            while let Some(i) = self.grey.head {
                let r = ObjRef(i);
                self.list_unlink(r);
                let obj = self.slots[r.idx()].take().expect("sweep of dead object");
                self.free_slots.push(r.0);
                self.destroy_shape(obj.shape);
                swept += 1;
            }

            if !self.collect_again {
                break;
            }
        }
        self.stats.swept += swept;
        self.collecting = false;
        log::debug!("collect: {} objects swept, {} slots live", swept, self.live_count());
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // -- container lock -----------------------------------------------------

    pub fn obj_try_lock(&mut self, r: ObjRef, me: ThreadId) -> LockTry {
        let o = self.obj_mut(r);
        match o.lock_owner {
            None => {
                o.lock_owner = Some(me);
                LockTry::Acquired
            }
            Some(owner) if owner == me => LockTry::OwnedBySelf,
            Some(_) => LockTry::Busy,
        }
    }

    pub fn obj_unlock(&mut self, r: ObjRef) {
        let o = self.obj_mut(r);
        debug_assert!(o.lock_owner.is_some());
        o.lock_owner = None;
    }

    // -- thread stacks ------------------------------------------------------

    pub fn register_stack(&mut self, limit: usize) -> usize {
        let s = VStack { cells: Vec::new(), limit };
        for (i, slot) in self.stacks.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(s);
                return i;
            }
        }
        self.stacks.push(Some(s));
        self.stacks.len() - 1
    }

    pub fn unregister_stack(&mut self, tid: usize) {
        if let Some(s) = self.stacks[tid].take() {
            for c in &s.cells {
                self.release_cell(c);
            }
        }
    }

    #[inline]
    fn vstack(&self, tid: usize) -> &VStack {
        self.stacks[tid].as_ref().expect("dead thread stack")
    }

    #[inline]
    fn vstack_mut(&mut self, tid: usize) -> &mut VStack {
        self.stacks[tid].as_mut().expect("dead thread stack")
    }

    pub fn stack_len(&self, tid: usize) -> usize {
        self.vstack(tid).cells.len()
    }

    pub fn stack_cell(&self, tid: usize, idx: usize) -> Result<&Cell, Fatal> {
        self.vstack(tid).cells.get(idx).ok_or(Fatal::StackRange)
    }

    pub fn stack_get(&self, tid: usize, idx: usize) -> Result<Cell, Fatal> {
        self.stack_cell(tid, idx).map(Clone::clone)
    }

    /// Allocate `n` nil cells; returns the index of the first.
    pub fn stack_alloc(&mut self, tid: usize, n: usize) -> Result<usize, Fatal> {
        let s = self.vstack_mut(tid);
        if s.cells.len() + n > s.limit {
            return Err(Fatal::StackOverflow);
        }
        let base = s.cells.len();
        s.cells.resize_with(base + n, Cell::nil);
        Ok(base)
    }

    pub fn stack_push(&mut self, tid: usize, c: &Cell) -> Result<usize, Fatal> {
        if self.vstack(tid).cells.len() + 1 > self.vstack(tid).limit {
            return Err(Fatal::StackOverflow);
        }
        let counted = self.counted(c);
        let s = self.vstack_mut(tid);
        s.cells.push(counted);
        Ok(s.cells.len() - 1)
    }

    pub fn stack_free(&mut self, tid: usize, n: usize) -> Result<(), Fatal> {
        let len = self.stack_len(tid);
        if n > len {
            return Err(Fatal::StackUnderflow);
        }
        self.stack_unwind(tid, len - n)
    }

    /// Pop back to absolute height `to`, releasing everything above it.
    pub fn stack_unwind(&mut self, tid: usize, to: usize) -> Result<(), Fatal> {
        let len = self.stack_len(tid);
        if to > len {
            return Err(Fatal::StackUnderflow);
        }
        for i in to..len {
            let c = self.vstack(tid).cells[i].clone();
            self.release_cell(&c);
        }
        self.vstack_mut(tid).cells.truncate(to);
        Ok(())
    }

    /// Assign a counted cell into a stack slot.
    pub fn stack_set(&mut self, tid: usize, idx: usize, src: &Cell) -> Result<(), Fatal> {
        if idx >= self.stack_len(tid) {
            return Err(Fatal::StackRange);
        }
        let counted = self.counted(src);
        let old = std::mem::replace(&mut self.vstack_mut(tid).cells[idx], counted);
        self.release_cell(&old);
        Ok(())
    }

    pub fn stack_set_value(&mut self, tid: usize, idx: usize, v: Value) -> Result<(), Fatal> {
        let c = Cell::new(v);
        self.stack_set(tid, idx, &c)
    }

    /// Copy between two slots of the same stack.
    pub fn stack_copy(&mut self, tid: usize, dst: usize, src: usize) -> Result<(), Fatal> {
        let c = self.stack_get(tid, src)?;
        self.stack_set(tid, dst, &c)
    }

    // -- string and byte-array objects --------------------------------------

    /// Bytes of a string, terminator excluded.
    pub fn str_bytes(&self, r: ObjRef) -> &[u8] {
        match self.shape(r) {
            Shape::Str(buf) => {
                let b = self.arena.bytes(buf);
                &b[..b.len() - 1]
            }
            _ => panic!("not a string"),
        }
    }

    pub fn str_lossy(&self, r: ObjRef) -> String {
        String::from_utf8_lossy(self.str_bytes(r)).into_owned()
    }

    pub fn barray_bytes(&self, r: ObjRef) -> &[u8] {
        match self.shape(r) {
            Shape::Barray(buf) => self.arena.bytes(buf),
            _ => panic!("not a byte array"),
        }
    }

    pub fn barray_bytes_mut(&mut self, r: ObjRef) -> &mut [u8] {
        let buf = match self.shape(r) {
            Shape::Barray(buf) => *buf,
            _ => panic!("not a byte array"),
        };
        self.arena.bytes_mut(&buf)
    }

    fn str_shape(&mut self, data: &[u8]) -> Shape {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.extend_from_slice(data);
        payload.push(0);
        Shape::Str(self.alloc_buf(&payload))
    }

    pub fn str_new(&mut self, tid: usize, dst: usize, data: &[u8]) -> Result<ObjRef, Fatal> {
        let cl = self.builtin(Builtin::String);
        let shape = self.str_shape(data);
        self.alloc_into(tid, dst, Some(cl), shape)
    }

    /// String constructor that also seeds the destination cell's hash.
    pub fn str_new_hashed(
        &mut self,
        tid: usize,
        dst: usize,
        data: &[u8],
        hash: u32,
    ) -> Result<ObjRef, Fatal> {
        let r = self.str_new(tid, dst, data)?;
        self.vstack_mut(tid).cells[dst].hash = Some(hash);
        Ok(r)
    }

    pub fn barray_new(
        &mut self,
        tid: usize,
        dst: usize,
        class: Builtin,
        data: &[u8],
    ) -> Result<ObjRef, Fatal> {
        let cl = self.builtin(class);
        let buf = self.alloc_buf(data);
        self.alloc_into(tid, dst, Some(cl), Shape::Barray(buf))
    }

    /// Internal string object, rooted only through whatever the caller
    /// links it into.  Used by the bucket plumbing below.
    fn str_obj_unrooted(&mut self, data: &[u8]) -> ObjRef {
        let cl = self.builtin(Builtin::String);
        let shape = self.str_shape(data);
        self.insert_obj(Some(cl), shape)
    }

    // -- structured constructors --------------------------------------------

    pub fn pair_new(
        &mut self,
        tid: usize,
        dst: usize,
        first: &Cell,
        second: &Cell,
    ) -> Result<ObjRef, Fatal> {
        self.bump_alloc();
        let cl = self.builtin(Builtin::Pair);
        let first = self.counted(first);
        let second = self.counted(second);
        let r = self.insert_obj(Some(cl), Shape::Pair(first, second));
        self.stack_set_value(tid, dst, Value::Obj(Some(r)))?;
        Ok(r)
    }

    pub fn list_new(
        &mut self,
        tid: usize,
        dst: usize,
        item: &Cell,
        next: Option<ObjRef>,
    ) -> Result<ObjRef, Fatal> {
        self.bump_alloc();
        let cl = self.builtin(Builtin::List);
        let item = self.counted(item);
        self.retain(next);
        let r = self.insert_obj(Some(cl), Shape::List { item, next });
        self.stack_set_value(tid, dst, Value::Obj(Some(r)))?;
        Ok(r)
    }

    pub fn array_new(
        &mut self,
        tid: usize,
        dst: usize,
        class: Builtin,
        size: usize,
    ) -> Result<ObjRef, Fatal> {
        let cl = self.builtin(class);
        let cells = vec![Cell::nil(); size].into_boxed_slice();
        self.alloc_into(tid, dst, Some(cl), Shape::Array(cells))
    }

    pub fn set_new(
        &mut self,
        tid: usize,
        dst: usize,
        class: Builtin,
        size: usize,
    ) -> Result<ObjRef, Fatal> {
        let cl = self.builtin(class);
        self.set_new_with_class(tid, dst, cl, size)
    }

    pub fn set_new_with_class(
        &mut self,
        tid: usize,
        dst: usize,
        cl: ObjRef,
        size: usize,
    ) -> Result<ObjRef, Fatal> {
        let size = size.max(1).next_power_of_two();
        let table = vec![None; size].into_boxed_slice();
        self.alloc_into(tid, dst, Some(cl), Shape::Set(SetShape { table, count: 0 }))
    }

    pub fn slice_new(
        &mut self,
        tid: usize,
        dst: usize,
        class: Builtin,
        underlying: ObjRef,
        ofs: usize,
        len: usize,
    ) -> Result<ObjRef, Fatal> {
        self.bump_alloc();
        let cl = self.builtin(class);
        self.retain(Some(underlying));
        let r = self.insert_obj(Some(cl), Shape::Slice { underlying, ofs, len });
        self.stack_set_value(tid, dst, Value::Obj(Some(r)))?;
        Ok(r)
    }

    /// Late class assignment, for the metaclass's self-instantiation
    /// during bootstrap.
    pub fn obj_set_class(&mut self, r: ObjRef, cl: ObjRef) {
        self.retain(Some(cl));
        let old = std::mem::replace(&mut self.obj_mut(r).class, Some(cl));
        self.release(old);
    }

    /// Allocate a raw class object; `class` is the metaclass, or None for
    /// the metaclass itself during bootstrap.
    pub fn class_alloc(
        &mut self,
        tid: usize,
        dst: usize,
        class: Option<ObjRef>,
    ) -> Result<ObjRef, Fatal> {
        self.alloc_into(tid, dst, class, Shape::Class(Box::new(ClassShape::empty())))
    }

    pub fn ns_new(
        &mut self,
        tid: usize,
        dst: usize,
        name: Option<ObjRef>,
        parent: Option<ObjRef>,
        dict: ObjRef,
    ) -> Result<ObjRef, Fatal> {
        self.bump_alloc();
        let cl = self.builtin(Builtin::Namespace);
        self.retain(name);
        self.retain(parent);
        self.retain(Some(dict));
        let r = self.insert_obj(
            Some(cl),
            Shape::Ns(Box::new(NsCore { name, parent, dict: Some(dict) })),
        );
        self.stack_set_value(tid, dst, Value::Obj(Some(r)))?;
        Ok(r)
    }

    pub fn module_new(
        &mut self,
        tid: usize,
        dst: usize,
        name: ObjRef,
        parent: Option<ObjRef>,
        dict: ObjRef,
        filename: ObjRef,
        sha1: ObjRef,
        lib: Option<Arc<ModuleLib>>,
    ) -> Result<ObjRef, Fatal> {
        self.bump_alloc();
        let cl = self.builtin(Builtin::Module);
        self.retain(Some(name));
        self.retain(parent);
        self.retain(Some(dict));
        self.retain(Some(filename));
        self.retain(Some(sha1));
        let r = self.insert_obj(
            Some(cl),
            Shape::Module(Box::new(ModuleShape {
                ns: NsCore { name: Some(name), parent, dict: Some(dict) },
                filename: Some(filename),
                sha1: Some(sha1),
                lib,
            })),
        );
        self.stack_set_value(tid, dst, Value::Obj(Some(r)))?;
        Ok(r)
    }

    pub fn file_new(
        &mut self,
        tid: usize,
        dst: usize,
        filename: ObjRef,
        mode: ObjRef,
        handle: FileHandle,
    ) -> Result<ObjRef, Fatal> {
        self.bump_alloc();
        let cl = self.builtin(Builtin::File);
        self.retain(Some(filename));
        self.retain(Some(mode));
        let r = self.insert_obj(
            Some(cl),
            Shape::File(Box::new(FileShape {
                filename: Some(filename),
                mode: Some(mode),
                handle,
                eof: false,
                pushback: None,
            })),
        );
        self.stack_set_value(tid, dst, Value::Obj(Some(r)))?;
        Ok(r)
    }

    // -- field accessors ----------------------------------------------------

    pub fn class_shape(&self, r: ObjRef) -> &ClassShape {
        match self.shape(r) {
            Shape::Class(c) => c,
            _ => panic!("not a class"),
        }
    }

    pub fn is_class(&self, r: ObjRef) -> bool {
        matches!(self.shape(r), Shape::Class(_))
    }

    /// Assign one class field, with counting.  Used by the bootstrap and
    /// by user class creation.
    pub fn class_set_field(&mut self, r: ObjRef, field: ClassField, v: Option<ObjRef>) {
        self.retain(v);
        let old = {
            let sh = match &mut self.obj_mut(r).shape {
                Shape::Class(c) => c,
                _ => panic!("not a class"),
            };
            let slot = match field {
                ClassField::Name        => &mut sh.name,
                ClassField::Parent      => &mut sh.parent,
                ClassField::Ns          => &mut sh.ns,
                ClassField::Vars        => &mut sh.vars,
                ClassField::ClMethods   => &mut sh.cl_methods,
                ClassField::InstMethods => &mut sh.inst_methods,
            };
            std::mem::replace(slot, v)
        };
        self.release(old);
    }

    /// Namespace core of a Namespace or Module object.
    pub fn ns_core(&self, r: ObjRef) -> &NsCore {
        match self.shape(r) {
            Shape::Ns(ns)    => ns,
            Shape::Module(m) => &m.ns,
            _ => panic!("not a namespace"),
        }
    }

    pub fn is_ns(&self, r: ObjRef) -> bool {
        matches!(self.shape(r), Shape::Ns(_) | Shape::Module(_))
    }

    pub fn module_shape(&self, r: ObjRef) -> &ModuleShape {
        match self.shape(r) {
            Shape::Module(m) => m,
            _ => panic!("not a module"),
        }
    }

    pub fn file_mut(&mut self, r: ObjRef) -> &mut FileShape {
        match &mut self.obj_mut(r).shape {
            Shape::File(f) => f,
            _ => panic!("not a file"),
        }
    }

    pub fn file_shape(&self, r: ObjRef) -> &FileShape {
        match self.shape(r) {
            Shape::File(f) => f,
            _ => panic!("not a file"),
        }
    }

    pub fn pair_parts(&self, r: ObjRef) -> (Cell, Cell) {
        match self.shape(r) {
            Shape::Pair(a, b) => (a.clone(), b.clone()),
            _ => panic!("not a pair"),
        }
    }

    pub fn list_item(&self, r: ObjRef) -> Cell {
        match self.shape(r) {
            Shape::List { item, .. } => item.clone(),
            _ => panic!("not a list"),
        }
    }

    pub fn list_next(&self, r: ObjRef) -> Option<ObjRef> {
        match self.shape(r) {
            Shape::List { next, .. } => *next,
            _ => panic!("not a list"),
        }
    }

    pub fn list_len(&self, mut r: Option<ObjRef>) -> usize {
        let mut n = 0;
        while let Some(node) = r {
            n += 1;
            r = self.list_next(node);
        }
        n
    }

    pub fn array_len(&self, r: ObjRef) -> usize {
        match self.shape(r) {
            Shape::Array(cells) => cells.len(),
            _ => panic!("not an array"),
        }
    }

    pub fn array_get(&self, r: ObjRef, i: usize) -> Cell {
        match self.shape(r) {
            Shape::Array(cells) => cells[i].clone(),
            _ => panic!("not an array"),
        }
    }

    pub fn array_set(&mut self, r: ObjRef, i: usize, src: &Cell) {
        let counted = self.counted(src);
        let old = match &mut self.obj_mut(r).shape {
            Shape::Array(cells) => std::mem::replace(&mut cells[i], counted),
            _ => panic!("not an array"),
        };
        self.release_cell(&old);
    }

    pub fn slice_parts(&self, r: ObjRef) -> (ObjRef, usize, usize) {
        match self.shape(r) {
            Shape::Slice { underlying, ofs, len } => (*underlying, *ofs, *len),
            _ => panic!("not a slice"),
        }
    }

    pub fn set_shape(&self, r: ObjRef) -> &SetShape {
        match self.shape(r) {
            Shape::Set(s) => s,
            _ => panic!("not a set"),
        }
    }

    pub fn is_set_shaped(&self, r: ObjRef) -> bool {
        matches!(self.shape(r), Shape::Set(_))
    }

    fn set_count_add(&mut self, r: ObjRef, delta: i32) {
        match &mut self.obj_mut(r).shape {
            Shape::Set(s) => s.count = (s.count as i64 + delta as i64) as u32,
            _ => panic!("not a set"),
        }
    }

    // -- bucket edges -------------------------------------------------------

    pub fn edge_get(&self, e: &Edge) -> Option<ObjRef> {
        match e {
            Edge::Bucket(s, i) => self.set_shape(*s).table[*i],
            Edge::Next(node)   => self.list_next(*node),
        }
    }

    /// Splice an edge, with counting on both ends.
    pub fn edge_set(&mut self, e: &Edge, v: Option<ObjRef>) {
        self.retain(v);
        let old = match e {
            Edge::Bucket(s, i) => {
                match &mut self.obj_mut(*s).shape {
                    Shape::Set(sh) => std::mem::replace(&mut sh.table[*i], v),
                    _ => panic!("not a set"),
                }
            }
            Edge::Next(node) => {
                match &mut self.obj_mut(*node).shape {
                    Shape::List { next, .. } => std::mem::replace(next, v),
                    _ => panic!("not a list"),
                }
            }
        };
        self.release(old);
    }

    // -- string-keyed dictionary plumbing -----------------------------------

    /// Find a string key in a dictionary-shaped set.  Returns the edge
    /// leading to the matching node, plus the node and its pair.
    pub fn dict_finds(
        &self,
        s: ObjRef,
        key: &[u8],
        hash: u32,
    ) -> (usize, Option<(Edge, ObjRef, ObjRef)>) {
        let bucket = hash as usize & (self.set_shape(s).table.len() - 1);
        let mut edge = Edge::Bucket(s, bucket);
        while let Some(node) = self.edge_get(&edge) {
            let item = self.list_item(node);
            if let Some(pr) = item.as_obj() {
                let (k, _) = self.pair_parts(pr);
                if let Some(kr) = k.as_obj() {
                    if matches!(self.shape(kr), Shape::Str(_)) && self.str_bytes(kr) == key {
                        return (bucket, Some((edge, node, pr)));
                    }
                }
            }
            edge = Edge::Next(node);
        }
        (bucket, None)
    }

    /// Fetch the pair stored under a string key.
    pub fn dict_ats(&self, s: ObjRef, key: &[u8], hash: u32) -> Option<ObjRef> {
        self.dict_finds(s, key, hash).1.map(|(_, _, pr)| pr)
    }

    /// Store under a string key.  A fresh pair replaces the bucket entry
    /// so prior references to the old pair keep their value.  Fails when
    /// the existing key is constant-named.
    pub fn dict_puts(
        &mut self,
        s: ObjRef,
        key: &[u8],
        hash: u32,
        val: &Cell,
    ) -> Result<(), ()> {
        self.bump_alloc();
        let (bucket, hit) = self.dict_finds(s, key, hash);
        let key_cell = match hit {
            Some((edge, node, old_pair)) => {
                if key.len() > 2 && key[0] == b'#' {
                    return Err(());
                }
                let (k, _) = self.pair_parts(old_pair);
                let k = self.counted(&k);
                let next = self.list_next(node);
                self.edge_set(&edge, next);
                k
            }
            None => {
                self.set_count_add(s, 1);
                let kr = self.str_obj_unrooted(key);
                let mut c = Cell::obj(kr);
                c.hash = Some(hash);
                self.retain(Some(kr));
                c
            }
        };
        // The working retains on key_cell and val become the new pair's
        // counts; the pair's count becomes the node's.
        let val = self.counted(val);
        let pair_cl = self.builtin(Builtin::Pair);
        let pr = self.insert_obj(Some(pair_cl), Shape::Pair(key_cell, val));
        self.retain(Some(pr));
        let head = self.set_shape(s).table[bucket];
        self.retain(head);
        let list_cl = self.builtin(Builtin::List);
        let node = self.insert_obj(
            Some(list_cl),
            Shape::List { item: Cell::obj(pr), next: head },
        );
        self.edge_set(&Edge::Bucket(s, bucket), Some(node));
        Ok(())
    }

    /// Prepend an element to a bucket chain.
    pub fn bucket_prepend(&mut self, s: ObjRef, bucket: usize, item: &Cell) {
        self.bump_alloc();
        let item = self.counted(item);
        let head = self.set_shape(s).table[bucket];
        self.retain(head);
        let list_cl = self.builtin(Builtin::List);
        let node = self.insert_obj(Some(list_cl), Shape::List { item, next: head });
        self.edge_set(&Edge::Bucket(s, bucket), Some(node));
    }

    /// Prepend a fresh (key, value) pair to a bucket chain.  A fresh pair
    /// is always allocated so holders of the old pair see the old value.
    pub fn bucket_prepend_pair(&mut self, s: ObjRef, bucket: usize, key: &Cell, val: &Cell) {
        self.bump_alloc();
        let key = self.counted(key);
        let val = self.counted(val);
        let pair_cl = self.builtin(Builtin::Pair);
        let pr = self.insert_obj(Some(pair_cl), Shape::Pair(key, val));
        let mut item = Cell::obj(pr);
        item.hash = None;
        self.retain(Some(pr));
        let head = self.set_shape(s).table[bucket];
        self.retain(head);
        let list_cl = self.builtin(Builtin::List);
        let node = self.insert_obj(Some(list_cl), Shape::List { item, next: head });
        self.edge_set(&Edge::Bucket(s, bucket), Some(node));
    }

    /// Splice one node out of a bucket chain.
    pub fn bucket_remove(&mut self, edge: &Edge, node: ObjRef) {
        let next = self.list_next(node);
        self.edge_set(edge, next);
    }

    pub fn set_count_bump(&mut self, s: ObjRef, delta: i32) {
        self.set_count_add(s, delta);
    }

    /// Clear every bucket.
    pub fn set_clear(&mut self, s: ObjRef) {
        let size = self.set_shape(s).table.len();
        for i in 0..size {
            self.edge_set(&Edge::Bucket(s, i), None);
        }
        match &mut self.obj_mut(s).shape {
            Shape::Set(sh) => sh.count = 0,
            _ => panic!("not a set"),
        }
    }

    /// Update the cached hash of a stack cell in place.
    pub fn stack_set_hash(&mut self, tid: usize, idx: usize, hash: u32) {
        if let Some(c) = self.vstack_mut(tid).cells.get_mut(idx) {
            c.hash = Some(hash);
        }
    }

    /// Delete a string key.
    pub fn dict_dels(&mut self, s: ObjRef, key: &[u8], hash: u32) {
        if let (_, Some((edge, node, _))) = self.dict_finds(s, key, hash) {
            let next = self.list_next(node);
            self.edge_set(&edge, next);
            self.set_count_add(s, -1);
        }
    }

    // -- namespace and class variable helpers -------------------------------

    pub fn ns_ats(&self, ns: ObjRef, key: &[u8], hash: u32) -> Option<ObjRef> {
        let dict = self.ns_core(ns).dict.expect("namespace without dictionary");
        self.dict_ats(dict, key, hash)
    }

    pub fn ns_puts(&mut self, ns: ObjRef, key: &[u8], hash: u32, val: &Cell) -> Result<(), ()> {
        let dict = self.ns_core(ns).dict.expect("namespace without dictionary");
        self.dict_puts(dict, key, hash, val)
    }

    /// Class variable lookup; resolves through the pair to the value.
    pub fn class_ats(&self, cl: ObjRef, key: &[u8], hash: u32) -> Option<Cell> {
        let vars = self.class_shape(cl).vars?;
        let pr = self.dict_ats(vars, key, hash)?;
        Some(self.pair_parts(pr).1)
    }

    pub fn class_puts(&mut self, cl: ObjRef, key: &[u8], hash: u32, val: &Cell) -> Result<(), ()> {
        let vars = self.class_shape(cl).vars.expect("class without variables");
        self.dict_puts(vars, key, hash, val)
    }
}

/// Every outgoing object reference of a shape, class back-pointer
/// excluded.
fn shape_children(shape: &Shape, out: &mut Vec<ObjRef>) {
    let mut cell = |c: &Cell| {
        if let Some(r) = c.as_obj() {
            out.push(r);
        }
    };
    match shape {
        Shape::Str(_) | Shape::Barray(_) => {}
        Shape::Pair(a, b) => {
            cell(a);
            cell(b);
        }
        Shape::List { item, next } => {
            cell(item);
            out.extend(*next);
        }
        Shape::Array(cells) => {
            for c in cells.iter() {
                cell(c);
            }
        }
        Shape::Slice { underlying, .. } => out.push(*underlying),
        Shape::Set(s) => {
            out.extend(s.table.iter().flatten());
        }
        Shape::Class(c) => {
            out.extend(
                [c.name, c.parent, c.ns, c.vars, c.cl_methods, c.inst_methods]
                    .into_iter()
                    .flatten(),
            );
        }
        Shape::Ns(ns) => {
            out.extend([ns.name, ns.parent, ns.dict].into_iter().flatten());
        }
        Shape::Module(m) => {
            out.extend(
                [m.ns.name, m.ns.parent, m.ns.dict, m.filename, m.sha1]
                    .into_iter()
                    .flatten(),
            );
        }
        Shape::File(f) => {
            out.extend([f.filename, f.mode].into_iter().flatten());
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ClassField {
    Name,
    Parent,
    Ns,
    Vars,
    ClMethods,
    InstMethods,
}
