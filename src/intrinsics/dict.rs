/// Dictionary and Cdictionary class methods
///
/// A dictionary is a set whose elements are (key, value) pairs; `at`
/// answers the binding pair so callers can hold a stable snapshot, `ate`
/// resolves to the value.  Keys whose string form starts with `#` and is
/// longer than two characters are constant.

use crate::core::oop::{
    self, class_default_size, dict_at, dict_at_put, dict_del, list_from_stack, method_redirect,
};
use crate::core::value::{Builtin, ObjRef, Value};
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::{dict_arg, object::collect_items, pair_arg, ret_str, set::clone_set, write_of};
use crate::thread::Thread;

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    match argc {
        1 => {
            let cl = th.vm.heap.lock().builtin(Builtin::Dictionary);
            let size = class_default_size(th, cl, 16);
            let r = th.vm.heap.lock().set_new(th.tid, dst, Builtin::Dictionary, size);
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
                    let r = th.vm.heap.lock().set_new(th.tid, dst, Builtin::Dictionary, n as usize);
                    th.lift(r)?;
                    Ok(())
                }
                _ => {
                    let is_dict = {
                        let h = th.vm.heap.lock();
                        matches!(arg.as_obj(),
                                 Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Dictionary))
                    };
                    if is_dict {
                        let src = dict_arg(th, ap + 1)?;
                        let cl = th.vm.heap.lock().builtin(Builtin::Dictionary);
                        clone_set(th, dst, src, Some(cl), false)
                    } else {
                        method_redirect(th, dst, "Dictionary", 1, ap + 1)
                    }
                }
            }
        }
        _ => Err(except::num_args_range(th, 1, 2)),
    }
}

pub fn boolean(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = dict_arg(th, ap)?;
    let cnt = th.vm.heap.lock().set_shape(d).count;
    th.set_value(dst, Value::Bool(cnt > 0))
}

pub fn list(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = dict_arg(th, ap)?;
    let items = collect_items(th, d)?;
    let base = th.sp();
    for c in &items {
        th.push(c)?;
    }
    list_from_stack(th, dst, base, items.len())?;
    th.unwind(base)
}

fn to_array_common(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let d = dict_arg(th, ap)?;
    let items = collect_items(th, d)?;
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

pub fn to_dict(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    dict_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn to_cdict(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = dict_arg(th, ap)?;
    let cl = th.vm.heap.lock().builtin(Builtin::Cdictionary);
    clone_set(th, dst, d, Some(cl), false)
}

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = dict_arg(th, ap)?;
    clone_set(th, dst, d, None, false)
}

pub fn copydeep(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = dict_arg(th, ap)?;
    clone_set(th, dst, d, None, true)
}

/// `at` answers the binding pair, nil when absent.
pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let d = dict_arg(th, ap)?;
    if !dict_at(th, dst, d, ap + 1)? {
        th.set_nil(dst)?;
    }
    Ok(())
}

pub fn ate(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let d = dict_arg(th, ap)?;
    if dict_at(th, dst, d, ap + 1)? {
        let v = {
            let h = th.vm.heap.lock();
            let pr = h.stack_cell(th.tid, dst).ok().and_then(|c| c.as_obj());
            pr.map(|p| h.pair_parts(p).1)
        };
        if let Some(v) = v {
            return th.set(dst, &v);
        }
    }
    Err(except::key_not_found(th, ap, ap + 1))
}

pub fn atdefault(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let d = dict_arg(th, ap)?;
    if dict_at(th, dst, d, ap + 1)? {
        let v = {
            let h = th.vm.heap.lock();
            let pr = h.stack_cell(th.tid, dst).ok().and_then(|c| c.as_obj());
            pr.map(|p| h.pair_parts(p).1)
        };
        if let Some(v) = v {
            return th.set(dst, &v);
        }
    }
    th.copy(dst, ap + 2)
}

pub fn atput(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let d = dict_arg(th, ap)?;
    dict_at_put(th, d, ap + 1, ap + 2)?;
    th.copy(dst, ap + 2)
}

pub fn atputnew(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let d = dict_arg(th, ap)?;
    let mark = th.sp();
    let w = th.alloc(1)?;
    if !dict_at(th, w, d, ap + 1)? {
        dict_at_put(th, d, ap + 1, ap + 2)?;
    }
    th.unwind(mark)?;
    th.copy(dst, ap + 2)
}

fn mutable_dict(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    let r = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, idx).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Dictionary) => Some(r),
            _ => None,
        }
    };
    match r {
        Some(r) => Ok(r),
        None    => Err(except::inv_value(th, idx)),
    }
}

pub fn del(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let d = mutable_dict(th, ap)?;
    dict_del(th, d, ap + 1)?;
    th.copy(dst, ap + 1)
}

pub fn delall(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = mutable_dict(th, ap)?;
    th.vm.heap.lock().set_clear(d);
    th.copy(dst, ap)
}

/// Store a ready-made pair.
pub fn put(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let d = mutable_dict(th, ap)?;
    let pr = pair_arg(th, ap + 1)?;
    let (k, v) = th.vm.heap.lock().pair_parts(pr);
    let mark = th.sp();
    let kw = th.push(&k)?;
    let vw = th.push(&v)?;
    dict_at_put(th, d, kw, vw)?;
    th.unwind(mark)?;
    th.copy(dst, ap + 1)
}

pub fn size(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = dict_arg(th, ap)?;
    let cnt = th.vm.heap.lock().set_shape(d).count;
    th.set_value(dst, Value::Int(cnt as i64))
}

pub fn tablesize(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = dict_arg(th, ap)?;
    let n = th.vm.heap.lock().set_shape(d).table.len();
    th.set_value(dst, Value::Int(n as i64))
}

fn write_common(th: &mut Thread, dst: usize, ap: usize, ldr: &str, trlr: &str) -> VmResult {
    let d = dict_arg(th, ap)?;
    th.obj_lock(d)?;
    let result = (|th: &mut Thread| -> VmResult<String> {
        let items = collect_items(th, d)?;
        let mut parts = Vec::new();
        for c in items {
            let (k, v) = {
                let h = th.vm.heap.lock();
                match c.as_obj() {
                    Some(p) => h.pair_parts(p),
                    None    => continue,
                }
            };
            let mark = th.sp();
            let kw = th.push(&k)?;
            let ks = write_of(th, kw)?;
            th.set(kw, &v)?;
            let vs = write_of(th, kw)?;
            th.unwind(mark)?;
            parts.push(format!("{}: {}", ks, vs));
        }
        Ok(format!("{}{}{}", ldr, parts.join(", "), trlr))
    })(th);
    th.obj_unlock(d);
    let text = result?;
    ret_str(th, dst, text.as_bytes())
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    write_common(th, dst, ap, "{", "}")
}

// -- Cdictionary ------------------------------------------------------------

pub fn cdict_new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    method_redirect(th, dst, "Cdictionary", 1, ap + 1)
}

pub fn cdict_copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    dict_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn cdict_copydeep(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let d = dict_arg(th, ap)?;
    let cl = th.vm.heap.lock().builtin(Builtin::Cdictionary);
    clone_set(th, dst, d, Some(cl), true)
}

pub fn cdict_write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    write_common(th, dst, ap, "#Cdictionary.new({", "})")
}
