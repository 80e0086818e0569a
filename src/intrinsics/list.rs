/// List class methods
///
/// Lists are single-linked cons cells; nil is the empty list.  New
/// elements are prepended, reverse builds a new spine, and concat copies
/// the first operand while sharing the second.

use crate::core::oop::{self, call_by_selector, list_from_stack};
use crate::core::value::{Builtin, Cell, ObjRef, Value};
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::{index_norm, int_arg, list_arg, pair_arg, ret_str, slice_norm, write_of};
use crate::thread::Thread;

/// Snapshot the items of a list spine.
pub fn items_of(th: &Thread, mut node: Option<ObjRef>) -> Vec<Cell> {
    let h = th.vm.heap.lock();
    let mut out = Vec::new();
    while let Some(r) = node {
        out.push(h.list_item(r));
        node = h.list_next(r);
    }
    out
}

/// Push every item onto the stack; returns (base, count).
fn push_items(th: &mut Thread, node: Option<ObjRef>) -> VmResult<(usize, usize)> {
    let items = items_of(th, node);
    let base = th.sp();
    let n = items.len();
    for c in items {
        th.push(&c)?;
    }
    Ok((base, n))
}

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    match argc {
        2 => oop::method_redirect(th, dst, "List", 1, ap + 1),
        3 => {
            let tail = list_arg(th, ap + 2)?;
            let item = th.get(ap + 1)?;
            th.list_new(dst, &item, tail)?;
            Ok(())
        }
        _ => Err(except::num_args_range(th, 2, 3)),
    }
}

pub fn boolean(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let nil = th.get(ap)?.is_nil();
    th.set_value(dst, Value::Bool(!nil))
}

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    list_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn copydeep(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let Some(head) = list_arg(th, ap)? else {
        return th.set_nil(dst);
    };
    th.obj_lock(head)?;
    let result = (|th: &mut Thread| -> VmResult {
        let (base, n) = push_items(th, Some(head))?;
        let w = th.alloc(1)?;
        for i in 0..n {
            let c = th.get(base + i)?;
            th.push(&c)?;
            call_by_selector(th, w, "copydeep", 1)?;
            th.copy(base + i, w)?;
            th.free(1)?;
        }
        list_from_stack(th, dst, base, n)?;
        th.unwind(base)
    })(th);
    th.obj_unlock(head);
    result
}

/// Element at a normalized index.
pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let node = list_arg(th, ap)?;
    let idx = int_arg(th, ap + 1)?;
    let items = items_of(th, node);
    let Some(o) = index_norm(idx, items.len() as i64) else {
        return Err(except::idx_range(th, ap, ap + 1));
    };
    th.set(dst, &items[o])
}

pub fn car(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    match list_arg(th, ap)? {
        Some(r) => {
            let item = th.vm.heap.lock().list_item(r);
            th.set(dst, &item)
        }
        None => Err(except::inv_value(th, ap)),
    }
}

pub fn cdr(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    match list_arg(th, ap)? {
        Some(r) => {
            let next = th.vm.heap.lock().list_next(r);
            th.set_obj(dst, next)
        }
        None => Err(except::inv_value(th, ap)),
    }
}

/// Copy the first operand, share the second.
pub fn concat(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = list_arg(th, ap)?;
    let b = list_arg(th, ap + 1)?;
    if b.is_none() {
        return th.copy(dst, ap);
    }
    let (base, n) = push_items(th, a)?;
    th.set_nil(dst)?;
    let mut tail = b;
    for i in (0..n).rev() {
        let item = th.get(base + i)?;
        tail = Some(th.list_new(dst, &item, tail)?);
    }
    if n == 0 {
        th.set_obj(dst, b)?;
    }
    th.unwind(base)
}

pub fn cons(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let tail = list_arg(th, ap)?;
    let item = th.get(ap + 1)?;
    th.list_new(dst, &item, tail)?;
    Ok(())
}

pub fn equal(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = list_arg(th, ap)?;
    let b = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, ap + 1).ok().map(|c| c.value.clone()) {
            Some(Value::Obj(None)) => Some(None),
            Some(Value::Obj(Some(r))) if h.class_of_raw(r) == h.builtin(Builtin::List) => {
                Some(Some(r))
            }
            _ => None,
        }
    };
    let Some(b) = b else {
        return th.set_value(dst, Value::Bool(false));
    };
    let xs = items_of(th, a);
    let ys = items_of(th, b);
    if xs.len() != ys.len() {
        return th.set_value(dst, Value::Bool(false));
    }
    let mark = th.sp();
    let w = th.alloc(1)?;
    let mut all = true;
    for (x, y) in xs.iter().zip(ys.iter()) {
        th.push(x)?;
        th.push(y)?;
        call_by_selector(th, w, "equal", 2)?;
        let eq = matches!(th.get(w)?.value, Value::Bool(true));
        th.free(2)?;
        if !eq {
            all = false;
            break;
        }
    }
    th.unwind(mark)?;
    th.set_value(dst, Value::Bool(all))
}

/// Sum of element hashes, cached in the cell.
pub fn hash(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cached = th.get(ap)?.hash;
    let hv = match cached {
        Some(hv) => hv,
        None => {
            let node = list_arg(th, ap)?;
            let items = items_of(th, node);
            let mark = th.sp();
            let w = th.alloc(1)?;
            let mut sum = 0u32;
            for c in items {
                th.push(&c)?;
                call_by_selector(th, w, "hash", 1)?;
                match th.get(w)?.value {
                    Value::Int(i) => sum = sum.wrapping_add(i as u32),
                    _ => return Err(except::inv_value(th, w)),
                }
                th.free(1)?;
            }
            th.unwind(mark)?;
            th.vm.heap.lock().stack_set_hash(th.tid, ap, sum);
            sum
        }
    };
    th.set_value(dst, Value::Int(hv as i64))
}

/// Apply the callable to each element; `map1` wraps each element in a
/// one-item list first.
fn map_common(th: &mut Thread, dst: usize, ap: usize, wrap: bool) -> VmResult {
    let node = list_arg(th, ap)?;
    let items = items_of(th, node);
    let f = th.get(ap + 1)?;
    let base = th.sp();
    let n = items.len();
    for c in &items {
        let w = th.alloc(1)?;
        th.push(&f)?;
        if wrap {
            let wrapped = th.alloc(1)?;
            th.list_new(wrapped, c, None)?;
        } else {
            th.push(c)?;
        }
        call_by_selector(th, w, "call", 2)?;
        th.free(2)?;
    }
    list_from_stack(th, dst, base, n)?;
    th.unwind(base)
}

pub fn map(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    map_common(th, dst, ap, false)
}

pub fn map1(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    map_common(th, dst, ap, true)
}

/// Fold with the callable; the accumulator is consed onto each element
/// (which must itself be a list for `reduce`).
fn reduce_common(th: &mut Thread, dst: usize, ap: usize, wrap: bool) -> VmResult {
    let node = list_arg(th, ap)?;
    let items = items_of(th, node);
    let f = th.get(ap + 1)?;
    let mark = th.sp();
    let acc = th.alloc(1)?;
    th.copy(acc, ap + 2)?;
    for c in &items {
        th.push(&f)?;
        let args = th.alloc(1)?;
        if wrap {
            th.list_new(args, c, None)?;
        } else {
            let tail = {
                let h = th.vm.heap.lock();
                match c.as_obj() {
                    Some(r) if h.class_of_raw(r) == h.builtin(Builtin::List) => Some(r),
                    Some(_) => None,
                    None => None,
                }
            };
            if tail.is_none() && !c.is_nil() {
                let w = th.push(c)?;
                return Err(except::inv_value(th, w));
            }
            th.set_obj(args, tail)?;
        }
        let a = th.get(acc)?;
        let head = th.vm.heap.lock().stack_cell(th.tid, args).unwrap().as_obj();
        th.list_new(args, &a, head)?;
        call_by_selector(th, acc, "call", 2)?;
        th.free(2)?;
    }
    th.copy(dst, acc)?;
    th.unwind(mark)
}

pub fn reduce(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    reduce_common(th, dst, ap, false)
}

pub fn reduce1(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    reduce_common(th, dst, ap, true)
}

pub fn reverse(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let node = list_arg(th, ap)?;
    let items = items_of(th, node);
    th.set_nil(dst)?;
    let mut tail = None;
    for c in items {
        tail = Some(th.list_new(dst, &c, tail)?);
    }
    Ok(())
}

pub fn size(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let node = list_arg(th, ap)?;
    let n = th.vm.heap.lock().list_len(node);
    th.set_value(dst, Value::Int(n as i64))
}

pub fn slice(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let node = list_arg(th, ap)?;
    let items = items_of(th, node);
    let ofs = int_arg(th, ap + 1)?;
    let len = int_arg(th, ap + 2)?;
    let Some((o, l)) = slice_norm(ofs, len, items.len() as i64) else {
        return Err(except::idx_range(th, ap + 1, ap + 2));
    };
    let base = th.sp();
    for c in &items[o..o + l] {
        th.push(c)?;
    }
    list_from_stack(th, dst, base, l)?;
    th.unwind(base)
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let Some(head) = list_arg(th, ap)? else {
        return ret_str(th, dst, b"()");
    };
    th.obj_lock(head)?;
    let result = (|th: &mut Thread| -> VmResult<String> {
        let items = items_of(th, Some(head));
        let mut parts = Vec::new();
        for c in items {
            let mark = th.sp();
            let w = th.push(&c)?;
            parts.push(write_of(th, w)?);
            th.unwind(mark)?;
        }
        Ok(format!("({})", parts.join(", ")))
    })(th);
    th.obj_unlock(head);
    let text = result?;
    ret_str(th, dst, text.as_bytes())
}

// -- conversions ------------------------------------------------------------

fn to_array_common(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let node = list_arg(th, ap)?;
    let items = items_of(th, node);
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

fn to_set_common(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let node = list_arg(th, ap)?;
    let items = items_of(th, node);
    let clr = th.vm.heap.lock().builtin(cl);
    let size = oop::class_default_size(th, clr, 16);
    let s = {
        let res = th.vm.heap.lock().set_new(th.tid, dst, cl, size);
        th.lift(res)?
    };
    for c in items {
        let mark = th.sp();
        let w = th.push(&c)?;
        oop::set_put(th, s, w)?;
        th.unwind(mark)?;
    }
    Ok(())
}

pub fn set(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_set_common(th, dst, ap, Builtin::Set)
}

pub fn cset(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_set_common(th, dst, ap, Builtin::Cset)
}

fn to_dict_common(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let node = list_arg(th, ap)?;
    let items = items_of(th, node);
    let clr = th.vm.heap.lock().builtin(cl);
    let size = oop::class_default_size(th, clr, 16);
    let d = {
        let res = th.vm.heap.lock().set_new(th.tid, dst, cl, size);
        th.lift(res)?
    };
    for c in items {
        let mark = th.sp();
        let w = th.push(&c)?;
        let pr = pair_arg(th, w)?;
        let (k, v) = th.vm.heap.lock().pair_parts(pr);
        let kw = th.push(&k)?;
        let vw = th.push(&v)?;
        oop::dict_at_put(th, d, kw, vw)?;
        th.unwind(mark)?;
    }
    Ok(())
}

pub fn dictionary(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_dict_common(th, dst, ap, Builtin::Dictionary)
}

pub fn cdictionary(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_dict_common(th, dst, ap, Builtin::Cdictionary)
}
