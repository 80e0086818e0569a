/// Classes and method dispatch
///
/// Selector dispatch is the only call convention: resolve the receiver's
/// class, look the selector up in the right method dictionary walking the
/// parent chain, and run what was found.  Private selectors (one leading
/// underscore, longer than two bytes) dispatch only from methods of the
/// resolved class itself.
///
/// The equal-probing container operations live here too, since sets and
/// dictionaries find their elements by calling the key's own `equal`
/// method.

use crate::core::value::{mem_hash, Builtin, Cell, ObjRef, Value};
use crate::errors::VmResult;
use crate::except;
use crate::gc::{Edge, Heap};
use crate::thread::Thread;

/// Result of a successful selector resolution.
pub struct Found {
    pub method: Cell,
    pub cl: ObjRef,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MethodDict {
    Class,
    Instance,
}

// ---------------------------------------------------------------------------
// Class resolution
// ---------------------------------------------------------------------------

/// Resolved class of a value: the raw class, except that instances of the
/// user-instance class answer with their `__instanceof__` entry.
pub fn class_of_resolved(h: &Heap, v: &Value) -> ObjRef {
    let raw = h.class_of_value_raw(v);
    if raw != h.builtin(Builtin::User) {
        return raw;
    }
    let r = v.as_obj().expect("user instance is an object");
    let pr = h
        .dict_ats(r, b"__instanceof__", mem_hash(b"__instanceof__"))
        .expect("user instance without __instanceof__");
    h.pair_parts(pr).1.as_obj().expect("__instanceof__ is a class")
}

/// Walk one method dictionary chain.  Only method and code-method slot
/// values count; anything else in the slot is ignored.
pub fn method_find_in(
    h: &Heap,
    mut cl: Option<ObjRef>,
    dict: MethodDict,
    sel: &[u8],
    hash: u32,
) -> Option<Found> {
    while let Some(c) = cl {
        let sh = h.class_shape(c);
        let d = match dict {
            MethodDict::Class    => sh.cl_methods,
            MethodDict::Instance => sh.inst_methods,
        };
        if let Some(d) = d {
            if let Some(pr) = h.dict_ats(d, sel, hash) {
                let (_, val) = h.pair_parts(pr);
                if val.is_callable() {
                    return Some(Found { method: val, cl: c });
                }
            }
        }
        cl = h.class_shape(c).parent;
    }
    None
}

/// Selector is private: one leading underscore, not two, longer than two
/// bytes.
#[inline]
fn sel_is_private(sel: &[u8]) -> bool {
    sel.len() > 2 && sel[0] == b'_' && sel[1] != b'_'
}

/// Full selector resolution for a receiver.
pub fn method_find(th: &Thread, recvr: &Cell, sel: &[u8], hash: u32) -> Option<Found> {
    let h = th.vm.heap.lock();
    let cl = class_of_resolved(&h, &recvr.value);
    if sel_is_private(sel) && th.frames.class_up(0) != Some(cl) {
        return None;
    }
    if cl == h.builtin(Builtin::Metaclass) {
        // The receiver is itself a class: class methods first, walking the
        // receiver's own parent chain, then the metaclass instance methods.
        let as_class = recvr.as_obj();
        if let Some(found) = method_find_in(&h, as_class, MethodDict::Class, sel, hash) {
            return Some(found);
        }
    }
    method_find_in(&h, Some(cl), MethodDict::Instance, sel, hash)
}

// ---------------------------------------------------------------------------
// Method execution
// ---------------------------------------------------------------------------

/// Run a method: push the call frame (and the class's home namespace
/// frame), execute native code or byte-code, pop both on normal return.
/// A raise has already unwound the frames when this returns an Err.
pub fn method_run(
    th: &mut Thread,
    dst: usize,
    ns: Option<ObjRef>,
    cl: Option<ObjRef>,
    method: &Cell,
    argc: usize,
    ap: usize,
) -> VmResult {
    let bp = th.sp();
    let mark = {
        let r = th.frames.push_call(cl, method.clone(), dst, bp, argc, ap);
        th.lift(r)?
    };
    let ns = match cl {
        Some(c) => th.vm.heap.lock().class_shape(c).ns,
        None    => ns,
    };
    if let Some(ns) = ns {
        let r = th.frames.push_ns(ns);
        th.lift(r)?;
    }
    let result = match method.value.clone() {
        Value::Codemethod(cm) => (cm.f)(th, dst, argc, ap),
        Value::Method(m)      => crate::vm::interp(th, &m),
        _                     => panic!("dispatch resolved to a non-method"),
    };
    match result {
        Ok(()) => {
            while th.frames.len() > mark {
                th.frame_pop1()?;
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Dispatch on the receiver at the top `argc` stack cells (receiver
/// first) and run the method.
pub fn call_sel_hashed(
    th: &mut Thread,
    dst: usize,
    sel: &[u8],
    hash: u32,
    argc: usize,
) -> VmResult {
    let sp = th.sp();
    debug_assert!(argc >= 1 && argc <= sp);
    let ap = sp - argc;
    let recvr = th.get(ap)?;
    match method_find(th, &recvr, sel, hash) {
        Some(Found { method, cl }) => method_run(th, dst, None, Some(cl), &method, argc, ap),
        None => Err(except::no_method(th, ap, sel)),
    }
}

pub fn call_by_selector(th: &mut Thread, dst: usize, sel: &str, argc: usize) -> VmResult {
    call_sel_hashed(th, dst, sel.as_bytes(), mem_hash(sel.as_bytes()), argc)
}

/// Re-dispatch under another selector with a fresh copy of the argument
/// cells.
pub fn method_redirect(
    th: &mut Thread,
    dst: usize,
    sel: &str,
    argc: usize,
    ap: usize,
) -> VmResult {
    let mark = th.sp();
    for i in 0..argc {
        let c = th.get(ap + i)?;
        th.push(&c)?;
    }
    call_by_selector(th, dst, sel, argc)?;
    th.unwind(mark)
}

// ---------------------------------------------------------------------------
// Cell hashing
// ---------------------------------------------------------------------------

/// Hash of a string cell, computed directly and cached.
pub fn str_cell_hash(th: &mut Thread, idx: usize) -> VmResult<u32> {
    let cached = th.get(idx)?.hash;
    if let Some(hv) = cached {
        return Ok(hv);
    }
    let hv = {
        let h = th.vm.heap.lock();
        let r = h.stack_cell(th.tid, idx).ok().and_then(|c| c.as_obj());
        match r {
            Some(r) => mem_hash(h.str_bytes(r)),
            None    => mem_hash(b""),
        }
    };
    th.vm.heap.lock().stack_set_hash(th.tid, idx, hv);
    Ok(hv)
}

/// Hash of any cell, via its `hash` method, cached in the cell.
pub fn cell_hash(th: &mut Thread, idx: usize) -> VmResult<u32> {
    if let Some(hv) = th.get(idx)?.hash {
        return Ok(hv);
    }
    let mark = th.sp();
    let w = th.alloc(1)?;
    let c = th.get(idx)?;
    th.push(&c)?;
    call_by_selector(th, w, "hash", 1)?;
    let hv = match th.get(w)?.value {
        Value::Int(i) => i as u32,
        _ => return Err(except::inv_value(th, w)),
    };
    th.unwind(mark)?;
    th.vm.heap.lock().stack_set_hash(th.tid, idx, hv);
    Ok(hv)
}

// ---------------------------------------------------------------------------
// Equal-probing set and dictionary operations
// ---------------------------------------------------------------------------

/// Position of a located element.
pub struct SetHit {
    pub edge: Edge,
    pub node: ObjRef,
    /// The element cell: the member itself for sets, the pair for
    /// dictionaries.
    pub item: Cell,
    pub bucket: usize,
}

/// Probe a bucket chain for a key, comparing with the key's own `equal`
/// method.  `keyed` selects dictionary probing (compare against each
/// pair's first) over set probing (compare against the element).
///
/// The container lock must be held by the caller.
fn probe(th: &mut Thread, s: ObjRef, key_idx: usize, keyed: bool) -> VmResult<Option<SetHit>> {
    let hash = cell_hash(th, key_idx)?;
    let bucket = {
        let h = th.vm.heap.lock();
        hash as usize & (h.set_shape(s).table.len() - 1)
    };

    // Resolve the key's equal method once; every candidate runs it.
    let key = th.get(key_idx)?;
    let equal = method_find(th, &key, b"equal", mem_hash(b"equal"));
    let Some(Found { method, cl }) = equal else {
        return Err(except::no_method(th, key_idx, b"equal"));
    };

    let mut edge = Edge::Bucket(s, bucket);
    loop {
        let (node, item, candidate) = {
            let h = th.vm.heap.lock();
            match h.edge_get(&edge) {
                None => return Ok(None),
                Some(node) => {
                    let item = h.list_item(node);
                    let candidate = if keyed {
                        let pr = item.as_obj().expect("dictionary bucket holds pairs");
                        h.pair_parts(pr).0
                    } else {
                        item.clone()
                    };
                    (node, item, candidate)
                }
            }
        };
        let mark = th.sp();
        let a = th.alloc(2)?;
        let k = th.get(key_idx)?;
        th.set(a, &k)?;
        th.set(a + 1, &candidate)?;
        method_run(th, a + 1, None, Some(cl), &method, 2, a)?;
        let eq = match th.get(a + 1)?.value {
            Value::Bool(b) => b,
            _ => {
                th.unwind(mark)?;
                return Err(except::inv_value(th, key_idx));
            }
        };
        th.unwind(mark)?;
        if eq {
            return Ok(Some(SetHit { edge, node, item, bucket }));
        }
        edge = Edge::Next(node);
    }
}

fn with_locked<T>(
    th: &mut Thread,
    s: ObjRef,
    f: impl FnOnce(&mut Thread) -> VmResult<T>,
) -> VmResult<T> {
    th.obj_lock(s)?;
    let r = f(th);
    th.obj_unlock(s);
    r
}

/// Set membership.
pub fn set_at(th: &mut Thread, s: ObjRef, key_idx: usize) -> VmResult<bool> {
    with_locked(th, s, |th| Ok(probe(th, s, key_idx, false)?.is_some()))
}

/// Set insertion: prepend when no bucket entry matches.
pub fn set_put(th: &mut Thread, s: ObjRef, key_idx: usize) -> VmResult {
    with_locked(th, s, |th| {
        match probe(th, s, key_idx, false)? {
            Some(_) => Ok(()),
            None => {
                let hash = cell_hash(th, key_idx)?;
                let key = th.get(key_idx)?;
                let mut h = th.vm.heap.lock();
                let bucket = hash as usize & (h.set_shape(s).table.len() - 1);
                h.bucket_prepend(s, bucket, &key);
                h.set_count_bump(s, 1);
                Ok(())
            }
        }
    })
}

pub fn set_del(th: &mut Thread, s: ObjRef, key_idx: usize) -> VmResult {
    with_locked(th, s, |th| {
        if let Some(hit) = probe(th, s, key_idx, false)? {
            let mut h = th.vm.heap.lock();
            h.bucket_remove(&hit.edge, hit.node);
            h.set_count_bump(s, -1);
        }
        Ok(())
    })
}

/// Dictionary lookup; assigns the located pair into `dst`.
pub fn dict_at(th: &mut Thread, dst: usize, s: ObjRef, key_idx: usize) -> VmResult<bool> {
    with_locked(th, s, |th| {
        match probe(th, s, key_idx, true)? {
            Some(hit) => {
                th.set(dst, &hit.item)?;
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

/// Dictionary store.  Reassignment under a constant-named key raises
/// `system.modify-constant`; otherwise the matching entry is replaced by
/// a freshly allocated pair.
pub fn dict_at_put(th: &mut Thread, s: ObjRef, key_idx: usize, val_idx: usize) -> VmResult {
    with_locked(th, s, |th| {
        let hit = probe(th, s, key_idx, true)?;
        let fresh = hit.is_none();
        if let Some(hit) = hit {
            let constant = {
                let h = th.vm.heap.lock();
                match h.stack_cell(th.tid, key_idx).ok().and_then(|c| c.as_obj()) {
                    Some(kr) if matches!(h.shape(kr), crate::gc::Shape::Str(_)) => {
                        let b = h.str_bytes(kr);
                        b.len() > 2 && b[0] == b'#'
                    }
                    _ => false,
                }
            };
            if constant {
                return Err(except::modify_const(th, s, key_idx));
            }
            let mut h = th.vm.heap.lock();
            h.bucket_remove(&hit.edge, hit.node);
        }
        let hash = cell_hash(th, key_idx)?;
        let key = th.get(key_idx)?;
        let val = th.get(val_idx)?;
        let mut h = th.vm.heap.lock();
        let bucket = hash as usize & (h.set_shape(s).table.len() - 1);
        h.bucket_prepend_pair(s, bucket, &key, &val);
        if fresh {
            h.set_count_bump(s, 1);
        }
        Ok(())
    })
}

pub fn dict_del(th: &mut Thread, s: ObjRef, key_idx: usize) -> VmResult {
    with_locked(th, s, |th| {
        if let Some(hit) = probe(th, s, key_idx, true)? {
            let mut h = th.vm.heap.lock();
            h.bucket_remove(&hit.edge, hit.node);
            h.set_count_bump(s, -1);
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// User instances and classes
// ---------------------------------------------------------------------------

/// Allocate a user instance: a dictionary-shaped object of the
/// user-instance class whose reserved `__instanceof__` entry names the
/// user class.
pub fn user_new(th: &mut Thread, dst: usize, cl: ObjRef) -> VmResult<ObjRef> {
    let r = {
        let mut h = th.vm.heap.lock();
        let r = h.set_new(th.tid, dst, Builtin::User, 16);
        match r {
            Ok(r) => {
                let c = Cell::obj(cl);
                h.dict_puts(r, b"__instanceof__", mem_hash(b"__instanceof__"), &c)
                    .expect("fresh instance dictionary");
                Ok(r)
            }
            Err(f) => Err(f),
        }
    };
    th.lift(r)
}

/// Constructor size hint: the class's `default-size` variable when it is
/// a positive integer.
pub fn class_default_size(th: &mut Thread, cl: ObjRef, default: usize) -> usize {
    let h = th.vm.heap.lock();
    match h.class_ats(cl, b"default-size", mem_hash(b"default-size")) {
        Some(Cell { value: Value::Int(n), .. }) if n > 0 => n as usize,
        _ => default,
    }
}

/// Innermost module on the namespace parent chain.
pub fn module_cur(h: &Heap, mut ns: Option<ObjRef>) -> Option<ObjRef> {
    while let Some(r) = ns {
        if matches!(h.shape(r), crate::gc::Shape::Module(_)) {
            return Some(r);
        }
        ns = h.ns_core(r).parent;
    }
    None
}

/// Environment resolution: innermost namespace frame, then the containing
/// module's namespace, then the root namespace.  Returns the binding
/// pair.
pub fn environ_find(th: &mut Thread, name_idx: usize) -> VmResult<Option<ObjRef>> {
    let hash = str_cell_hash(th, name_idx)?;
    let h = th.vm.heap.lock();
    let name_r = match h.stack_cell(th.tid, name_idx).ok().and_then(|c| c.as_obj()) {
        Some(r) => r,
        None => return Ok(None),
    };
    let name: Vec<u8> = h.str_bytes(name_r).to_vec();
    let ns = match th.frames.ns_up(1) {
        Ok(ns) => ns,
        Err(_) => h.main_ns(),
    };
    if let Some(pr) = h.ns_ats(ns, &name, hash) {
        return Ok(Some(pr));
    }
    if let Some(module) = module_cur(&h, Some(ns)) {
        if module != ns {
            if let Some(pr) = h.ns_ats(module, &name, hash) {
                return Ok(Some(pr));
            }
        }
    }
    let main = h.main_ns();
    if main != ns {
        if let Some(pr) = h.ns_ats(main, &name, hash) {
            return Ok(Some(pr));
        }
    }
    Ok(None)
}

/// Environment fetch; raises `system.no-variable` when absent.
pub fn environ_at(th: &mut Thread, dst: usize, name: &[u8], hash: u32) -> VmResult {
    let mark = th.sp();
    let n = th.alloc(1)?;
    th.str_new_hashed(n, name, hash)?;
    match environ_find(th, n)? {
        Some(pr) => {
            let val = th.vm.heap.lock().pair_parts(pr).1;
            th.set(dst, &val)?;
            th.unwind(mark)
        }
        None => Err(except::no_variable(th, n)),
    }
}

/// Environment fetch onto the stack top.
pub fn environ_at_push(th: &mut Thread, name: &[u8], hash: u32) -> VmResult {
    let dst = th.alloc(1)?;
    let n = th.alloc(1)?;
    th.str_new_hashed(n, name, hash)?;
    match environ_find(th, n)? {
        Some(pr) => {
            let val = th.vm.heap.lock().pair_parts(pr).1;
            th.set(dst, &val)?;
            th.unwind(n)
        }
        None => Err(except::no_variable(th, n)),
    }
}

/// Environment store into the current namespace.
pub fn environ_at_put(th: &mut Thread, name: &[u8], hash: u32, val_idx: usize) -> VmResult {
    let ns = {
        let r = th.frames.ns_up(1);
        th.lift(r)?
    };
    let val = th.get(val_idx)?;
    let r = th.vm.heap.lock().ns_puts(ns, name, hash, &val);
    match r {
        Ok(()) => Ok(()),
        Err(()) => {
            let n = th.alloc(1)?;
            th.str_new_hashed(n, name, hash)?;
            Err(except::modify_const(th, ns, n))
        }
    }
}

// ---------------------------------------------------------------------------
// Method installation
// ---------------------------------------------------------------------------

/// Install a native method on a class; extension modules and embedders
/// populate their classes through this.
pub fn method_add(
    th: &mut Thread,
    cl: ObjRef,
    dict: MethodDict,
    sel: &str,
    name: &'static str,
    f: crate::core::value::CodeFn,
) {
    let cm = Cell::new(Value::Codemethod(crate::core::value::Codemethod { name, f }));
    let mut h = th.vm.heap.lock();
    let d = match dict {
        MethodDict::Class    => h.class_shape(cl).cl_methods,
        MethodDict::Instance => h.class_shape(cl).inst_methods,
    }
    .expect("class without method dictionaries");
    let _ = h.dict_puts(d, sel.as_bytes(), mem_hash(sel.as_bytes()), &cm);
}

/// Remove a method binding from a class.
pub fn method_del(th: &mut Thread, cl: ObjRef, dict: MethodDict, sel: &str) {
    let mut h = th.vm.heap.lock();
    let d = match dict {
        MethodDict::Class    => h.class_shape(cl).cl_methods,
        MethodDict::Instance => h.class_shape(cl).inst_methods,
    };
    if let Some(d) = d {
        h.dict_dels(d, sel.as_bytes(), mem_hash(sel.as_bytes()));
    }
}

// ---------------------------------------------------------------------------
// List building
// ---------------------------------------------------------------------------

/// Build a list of the stack cells [base, base+n), preserving order.  The
/// destination cell roots each partial spine; returns the head.
pub fn list_from_stack(
    th: &mut Thread,
    dst: usize,
    base: usize,
    n: usize,
) -> VmResult<Option<ObjRef>> {
    th.set_nil(dst)?;
    let mut tail: Option<ObjRef> = None;
    for i in (0..n).rev() {
        let item = th.get(base + i)?;
        tail = Some(th.list_new(dst, &item, tail)?);
    }
    Ok(tail)
}

// ---------------------------------------------------------------------------
// Argument count checks
// ---------------------------------------------------------------------------

pub fn argc_chk_exact(th: &mut Thread, argc: usize, expected: usize) -> VmResult {
    if argc != expected {
        return Err(except::num_args(th, expected));
    }
    Ok(())
}

pub fn argc_chk_min(th: &mut Thread, argc: usize, min: usize) -> VmResult {
    if argc < min {
        return Err(except::num_args_min(th, min));
    }
    Ok(())
}

pub fn argc_chk_range(th: &mut Thread, argc: usize, min: usize, max: usize) -> VmResult {
    if argc < min || argc > max {
        return Err(except::num_args_range(th, min, max));
    }
    Ok(())
}

/// Collect the arguments past `num_fixed` into an Array pushed on the
/// stack.
pub fn method_array_arg_push(th: &mut Thread, num_fixed: usize) -> VmResult<ObjRef> {
    let (_, argc, ap, _) = th.cur_call_info()?;
    if argc < num_fixed {
        return Err(except::num_args_min(th, num_fixed));
    }
    let dst = th.alloc(1)?;
    let n = argc - num_fixed;
    let r = {
        let r = th.vm.heap.lock().array_new(th.tid, dst, Builtin::Array, n);
        th.lift(r)?
    };
    for i in 0..n {
        let c = th.get(ap + num_fixed + i)?;
        th.vm.heap.lock().array_set(r, i, &c);
    }
    Ok(r)
}
