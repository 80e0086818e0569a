/// Set and Cset class methods
///
/// Sets are power-of-two hash tables whose buckets are list chains;
/// membership probes call the key's own `equal` method.

use crate::core::oop::{self, class_default_size, list_from_stack, method_redirect, set_at,
    set_del, set_put};
use crate::core::value::{Builtin, Cell, ObjRef, Value};
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::{object::collect_items, ret_str, set_arg, write_of};
use crate::thread::Thread;

/// Copy a set-shaped object, bucket structure preserved.  `cl` overrides
/// the result class; deep copies send `copydeep` to every element.
pub fn clone_set(
    th: &mut Thread,
    dst: usize,
    src: ObjRef,
    cl: Option<ObjRef>,
    deep: bool,
) -> VmResult {
    th.obj_lock(src)?;
    let result = (|th: &mut Thread| -> VmResult {
        let (target, size) = {
            let h = th.vm.heap.lock();
            (cl.unwrap_or_else(|| h.class_of_raw(src)), h.set_shape(src).table.len())
        };
        let out = {
            let res = th.vm.heap.lock().set_new_with_class(th.tid, dst, target, size);
            th.lift(res)?
        };
        let buckets: Vec<(usize, Vec<Cell>)> = {
            let h = th.vm.heap.lock();
            (0..size)
                .map(|i| {
                    let mut items = Vec::new();
                    let mut node = h.set_shape(src).table[i];
                    while let Some(n) = node {
                        items.push(h.list_item(n));
                        node = h.list_next(n);
                    }
                    (i, items)
                })
                .collect()
        };
        let mark = th.sp();
        let w = th.alloc(1)?;
        for (i, items) in buckets {
            // Rebuild the chain back to front so the order survives.
            for item in items.into_iter().rev() {
                let cell = if deep {
                    th.push(&item)?;
                    crate::core::oop::call_by_selector(th, w, "copydeep", 1)?;
                    th.free(1)?;
                    th.get(w)?
                } else {
                    item
                };
                th.vm.heap.lock().bucket_prepend(out, i, &cell);
            }
        }
        let count = th.vm.heap.lock().set_shape(src).count;
        th.vm.heap.lock().set_count_bump(out, count as i32);
        th.unwind(mark)
    })(th);
    th.obj_unlock(src);
    result
}

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    match argc {
        1 => {
            let cl = th.vm.heap.lock().builtin(Builtin::Set);
            let size = class_default_size(th, cl, 16);
            let r = th.vm.heap.lock().set_new(th.tid, dst, Builtin::Set, size);
            th.lift(r)?;
            Ok(())
        }
        2 => {
            let arg = th.get(ap + 1)?;
            match arg.value {
                Value::Int(n) => {
                    if n < 1 {
                        return Err(except::inv_value(th, ap + 1));
                    }
                    let r = th.vm.heap.lock().set_new(th.tid, dst, Builtin::Set, n as usize);
                    th.lift(r)?;
                    Ok(())
                }
                _ => {
                    let is_set = {
                        let h = th.vm.heap.lock();
                        matches!(arg.as_obj(),
                                 Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Set))
                    };
                    if is_set {
                        let src = set_arg(th, ap + 1)?;
                        let cl = th.vm.heap.lock().builtin(Builtin::Set);
                        clone_set(th, dst, src, Some(cl), false)
                    } else {
                        method_redirect(th, dst, "Set", 1, ap + 1)
                    }
                }
            }
        }
        _ => Err(except::num_args_range(th, 1, 2)),
    }
}

pub fn boolean(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = set_arg(th, ap)?;
    let cnt = th.vm.heap.lock().set_shape(s).count;
    th.set_value(dst, Value::Bool(cnt > 0))
}

pub fn list(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = set_arg(th, ap)?;
    let items = collect_items(th, s)?;
    let base = th.sp();
    for c in &items {
        th.push(c)?;
    }
    list_from_stack(th, dst, base, items.len())?;
    th.unwind(base)
}

fn to_array_common(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let s = set_arg(th, ap)?;
    let items = collect_items(th, s)?;
    let r = {
        let res = th.vm.heap.lock().array_new(th.tid, dst, cl, items.len());
        th.lift(res)?
    };
    for (i, c) in items.iter().enumerate() {
        th.vm.heap.lock().array_set(r, i, c);
    }
    Ok(())
}

pub fn array(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_array_common(th, dst, ap, Builtin::Array)
}

pub fn carray(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_array_common(th, dst, ap, Builtin::Carray)
}

pub fn to_set(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    set_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn to_cset(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = set_arg(th, ap)?;
    let cl = th.vm.heap.lock().builtin(Builtin::Cset);
    clone_set(th, dst, s, Some(cl), false)
}

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = set_arg(th, ap)?;
    clone_set(th, dst, s, None, false)
}

pub fn copydeep(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = set_arg(th, ap)?;
    clone_set(th, dst, s, None, true)
}

pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let s = set_arg(th, ap)?;
    let found = set_at(th, s, ap + 1)?;
    th.set_value(dst, Value::Bool(found))
}

pub fn del(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let s = mutable_set(th, ap)?;
    set_del(th, s, ap + 1)?;
    th.copy(dst, ap + 1)
}

pub fn delall(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = mutable_set(th, ap)?;
    th.vm.heap.lock().set_clear(s);
    th.copy(dst, ap)
}

pub fn put(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let s = mutable_set(th, ap)?;
    set_put(th, s, ap + 1)?;
    th.copy(dst, ap + 1)
}

/// The mutating methods accept only the mutable variant's raw class.
fn mutable_set(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    let r = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, idx).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Set) => Some(r),
            _ => None,
        }
    };
    match r {
        Some(r) => Ok(r),
        None    => Err(except::inv_value(th, idx)),
    }
}

pub fn size(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = set_arg(th, ap)?;
    let cnt = th.vm.heap.lock().set_shape(s).count;
    th.set_value(dst, Value::Int(cnt as i64))
}

pub fn tablesize(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = set_arg(th, ap)?;
    let n = th.vm.heap.lock().set_shape(s).table.len();
    th.set_value(dst, Value::Int(n as i64))
}

pub fn write_common(
    th: &mut Thread,
    dst: usize,
    ap: usize,
    ldr: &str,
    trlr: &str,
) -> VmResult {
    let s = set_arg(th, ap)?;
    th.obj_lock(s)?;
    let result = (|th: &mut Thread| -> VmResult<String> {
        let items = collect_items(th, s)?;
        let mut parts = Vec::new();
        for c in items {
            let mark = th.sp();
            let w = th.push(&c)?;
            parts.push(write_of(th, w)?);
            th.unwind(mark)?;
        }
        Ok(format!("{}{}{}", ldr, parts.join(", "), trlr))
    })(th);
    th.obj_unlock(s);
    let text = result?;
    ret_str(th, dst, text.as_bytes())
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    write_common(th, dst, ap, "{", "}")
}

// -- Cset -------------------------------------------------------------------

pub fn cset_new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    method_redirect(th, dst, "Cset", 1, ap + 1)
}

pub fn cset_copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    set_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn cset_to_set(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = set_arg(th, ap)?;
    let cl = th.vm.heap.lock().builtin(Builtin::Set);
    clone_set(th, dst, s, Some(cl), false)
}

pub fn cset_write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    write_common(th, dst, ap, "#Cset((", "))")
}
