/// Namespace class methods
///
/// Namespaces are named dictionaries chained through their parents; the
/// root namespace `main` is elided from written paths.

use crate::core::oop::{self, str_cell_hash};
use crate::core::value::{Builtin, Cell, ObjRef};
use crate::errors::VmResult;
use crate::except;
use crate::gc::Heap;
use crate::intrinsics::{ns_arg, ret_str, str_arg};
use crate::thread::Thread;

/// Dotted path of a namespace, root excluded; the root itself answers
/// its own name.
pub fn ns_path(h: &Heap, ns: ObjRef) -> String {
    let main = h.main_ns();
    if ns == main {
        return h
            .ns_core(ns)
            .name
            .map(|n| h.str_lossy(n))
            .unwrap_or_else(|| "main".into());
    }
    let mut parts = Vec::new();
    let mut cur = Some(ns);
    while let Some(r) = cur {
        if r == main {
            break;
        }
        parts.push(
            h.ns_core(r)
                .name
                .map(|n| h.str_lossy(n))
                .unwrap_or_else(|| "?".into()),
        );
        cur = h.ns_core(r).parent;
    }
    parts.reverse();
    parts.join(".")
}

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let name_r = str_arg(th, ap + 1)?;
    let name = th.vm.heap.lock().str_bytes(name_r).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let parent = ns_arg(th, ap + 2)?;
    let mark = th.sp();
    let dict_slot = th.alloc(1)?;
    let dict = {
        let r = th.vm.heap.lock().set_new(th.tid, dict_slot, Builtin::Dictionary, 32);
        th.lift(r)?
    };
    let ns = {
        let r = th.vm.heap.lock().ns_new(th.tid, dst, Some(name_r), Some(parent), dict);
        th.lift(r)?
    };
    let bound = {
        let mut h = th.vm.heap.lock();
        let cell = Cell::obj(ns);
        h.ns_puts(parent, &name, hash, &cell)
    };
    if bound.is_err() {
        return Err(except::modify_const(th, parent, ap + 1));
    }
    th.unwind(mark)
}

/// Binding pair under a string key, nil when absent.
pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let ns = ns_arg(th, ap)?;
    let key_r = str_arg(th, ap + 1)?;
    let key = th.vm.heap.lock().str_bytes(key_r).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let pr = th.vm.heap.lock().ns_ats(ns, &key, hash);
    match pr {
        Some(pr) => th.set(dst, &Cell::obj(pr)),
        None     => th.set_nil(dst),
    }
}

pub fn ate(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let ns = ns_arg(th, ap)?;
    let key_r = str_arg(th, ap + 1)?;
    let key = th.vm.heap.lock().str_bytes(key_r).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let val = {
        let h = th.vm.heap.lock();
        h.ns_ats(ns, &key, hash).map(|pr| h.pair_parts(pr).1)
    };
    match val {
        Some(v) => th.set(dst, &v),
        None    => Err(except::no_variable(th, ap + 1)),
    }
}

pub fn atput(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let ns = ns_arg(th, ap)?;
    let key_r = str_arg(th, ap + 1)?;
    let key = th.vm.heap.lock().str_bytes(key_r).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let val = th.get(ap + 2)?;
    let stored = th.vm.heap.lock().ns_puts(ns, &key, hash, &val);
    if stored.is_err() {
        return Err(except::modify_const(th, ns, ap + 1));
    }
    th.copy(dst, ap + 2)
}

/// The caller's current namespace.
pub fn current(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let _ = ap;
    let ns = {
        let r = th.frames.ns_up(1);
        th.lift(r)?
    };
    th.set_obj(dst, Some(ns))
}

pub fn name(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let ns = ns_arg(th, ap)?;
    let n = th.vm.heap.lock().ns_core(ns).name;
    th.set_obj(dst, n)
}

pub fn parent(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let ns = ns_arg(th, ap)?;
    let p = th.vm.heap.lock().ns_core(ns).parent;
    th.set_obj(dst, p)
}

pub fn dictionary(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let ns = ns_arg(th, ap)?;
    let d = th.vm.heap.lock().ns_core(ns).dict;
    th.set_obj(dst, d)
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let ns = ns_arg(th, ap)?;
    let path = ns_path(&th.vm.heap.lock(), ns);
    ret_str(th, dst, path.as_bytes())
}
