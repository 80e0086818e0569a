/// Environment pseudo-class
///
/// Class methods reading and writing the active namespace chain: the
/// innermost namespace frame, then the containing module's namespace,
/// then the root.  Stores always land in the innermost namespace.

use crate::core::oop::{self, environ_find, str_cell_hash};
use crate::core::value::Cell;
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::str_arg;
use crate::thread::Thread;

/// Binding pair for a name, nil when unbound.
pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    match environ_find(th, ap + 1)? {
        Some(pr) => th.set(dst, &Cell::obj(pr)),
        None     => th.set_nil(dst),
    }
}

pub fn ate(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    match environ_find(th, ap + 1)? {
        Some(pr) => {
            let v = th.vm.heap.lock().pair_parts(pr).1;
            th.set(dst, &v)
        }
        None => Err(except::no_variable(th, ap + 1)),
    }
}

pub fn atput(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let key_r = str_arg(th, ap + 1)?;
    let key = th.vm.heap.lock().str_bytes(key_r).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let ns = {
        let r = th.frames.ns_up(1);
        th.lift(r)?
    };
    let val = th.get(ap + 2)?;
    let stored = th.vm.heap.lock().ns_puts(ns, &key, hash, &val);
    if stored.is_err() {
        return Err(except::modify_const(th, ns, ap + 1));
    }
    th.copy(dst, ap + 2)
}
