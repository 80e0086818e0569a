/// Slice and Cslice class methods
///
/// A slice borrows its underlying indexable and delegates element access
/// through ordinary dispatch, so it works over arrays, byte arrays and
/// strings alike.

use crate::core::oop::{self, call_by_selector, list_from_stack};
use crate::core::value::{Builtin, Value};
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::{int_arg, ret_str, slice_arg, slice_norm};
use crate::thread::Thread;

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 4)?;
    slice_new_common(th, dst, ap, "Slice")
}

pub fn cslice_new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 4)?;
    slice_new_common(th, dst, ap, "Cslice")
}

/// Redirect to the underlying's own slice constructor.
fn slice_new_common(th: &mut Thread, dst: usize, ap: usize, sel: &str) -> VmResult {
    let mark = th.sp();
    for i in 1..4 {
        let c = th.get(ap + i)?;
        th.push(&c)?;
    }
    call_by_selector(th, dst, sel, 3)?;
    th.unwind(mark)
}

/// Delegated element read: underlying at (ofs + idx).
pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let sl = slice_arg(th, ap)?;
    let (u, ofs, len) = th.vm.heap.lock().slice_parts(sl);
    let idx = int_arg(th, ap + 1)?;
    let Some(o) = crate::intrinsics::index_norm(idx, len as i64) else {
        return Err(except::idx_range(th, ap, ap + 1));
    };
    let mark = th.sp();
    th.push_obj(Some(u))?;
    let w = th.alloc(1)?;
    th.set_value(w, Value::Int((ofs + o) as i64))?;
    call_by_selector(th, dst, "at", 2)?;
    th.unwind(mark)
}

pub fn atput(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let sl = slice_arg(th, ap)?;
    let (u, ofs, len) = th.vm.heap.lock().slice_parts(sl);
    let idx = int_arg(th, ap + 1)?;
    let Some(o) = crate::intrinsics::index_norm(idx, len as i64) else {
        return Err(except::idx_range(th, ap, ap + 1));
    };
    let mark = th.sp();
    th.push_obj(Some(u))?;
    let w = th.alloc(1)?;
    th.set_value(w, Value::Int((ofs + o) as i64))?;
    let v = th.get(ap + 2)?;
    th.push(&v)?;
    call_by_selector(th, dst, "atput", 3)?;
    th.unwind(mark)
}

/// Hash of the materialized content.
pub fn hash(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    slice_arg(th, ap)?;
    let mark = th.sp();
    let w = th.alloc(1)?;
    let recvr = th.get(ap)?;
    th.push(&recvr)?;
    call_by_selector(th, w, "slice", 1)?;
    let c = th.get(w)?;
    th.push(&c)?;
    call_by_selector(th, dst, "hash", 1)?;
    th.unwind(mark)
}

pub fn size(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let sl = slice_arg(th, ap)?;
    let (_, _, len) = th.vm.heap.lock().slice_parts(sl);
    th.set_value(dst, Value::Int(len as i64))
}

/// One-argument form: materialize by slicing the underlying with this
/// slice's window.
pub fn slice(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let sl = slice_arg(th, ap)?;
    let (u, ofs, len) = th.vm.heap.lock().slice_parts(sl);
    let mark = th.sp();
    th.push_obj(Some(u))?;
    let w = th.alloc(2)?;
    th.set_value(w, Value::Int(ofs as i64))?;
    th.set_value(w + 1, Value::Int(len as i64))?;
    call_by_selector(th, dst, "slice", 3)?;
    th.unwind(mark)
}

/// Three-argument form: a sub-window of the same underlying.
pub fn slice_of(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    sub_slice(th, dst, ap, Builtin::Slice)
}

pub fn cslice_of(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    sub_slice(th, dst, ap, Builtin::Cslice)
}

fn sub_slice(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let sl = slice_arg(th, ap)?;
    let (u, base, len) = th.vm.heap.lock().slice_parts(sl);
    let ofs = int_arg(th, ap + 1)?;
    let sub_len = int_arg(th, ap + 2)?;
    let Some((o, l)) = slice_norm(ofs, sub_len, len as i64) else {
        return Err(except::idx_range2(th, ap, ap + 1, ap + 2));
    };
    let r = th.vm.heap.lock().slice_new(th.tid, dst, cl, u, base + o, l);
    th.lift(r)?;
    Ok(())
}

pub fn list(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let sl = slice_arg(th, ap)?;
    let (_, _, len) = th.vm.heap.lock().slice_parts(sl);
    let mark = th.sp();
    let base = mark;
    for i in 0..len {
        let w = th.alloc(1)?;
        let recvr = th.get(ap)?;
        th.push(&recvr)?;
        let ii = th.alloc(1)?;
        th.set_value(ii, Value::Int(i as i64))?;
        call_by_selector(th, w, "at", 2)?;
        th.free(2)?;
    }
    list_from_stack(th, dst, base, len)?;
    th.unwind(mark)
}

pub fn array(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let sl = slice_arg(th, ap)?;
    let (_, _, len) = th.vm.heap.lock().slice_parts(sl);
    let arr = {
        let res = th.vm.heap.lock().array_new(th.tid, dst, Builtin::Array, len);
        th.lift(res)?
    };
    let mark = th.sp();
    let w = th.alloc(1)?;
    for i in 0..len {
        let recvr = th.get(ap)?;
        th.push(&recvr)?;
        let ii = th.alloc(1)?;
        th.set_value(ii, Value::Int(i as i64))?;
        call_by_selector(th, w, "at", 2)?;
        th.free(2)?;
        let c = th.get(w)?;
        th.vm.heap.lock().array_set(arr, i, &c);
    }
    th.unwind(mark)
}

fn write_common(th: &mut Thread, dst: usize, ap: usize, ldr: &str, trlr: &str) -> VmResult {
    let sl = slice_arg(th, ap)?;
    let (_, _, len) = th.vm.heap.lock().slice_parts(sl);
    let mut parts = Vec::new();
    for i in 0..len {
        let mark = th.sp();
        let w = th.alloc(1)?;
        let recvr = th.get(ap)?;
        th.push(&recvr)?;
        let ii = th.alloc(1)?;
        th.set_value(ii, Value::Int(i as i64))?;
        call_by_selector(th, w, "at", 2)?;
        let c = th.get(w)?;
        th.push(&c)?;
        call_by_selector(th, w, "write", 1)?;
        let text = {
            let h = th.vm.heap.lock();
            match h.stack_cell(th.tid, w).ok().and_then(|c| c.as_obj()) {
                Some(r) => h.str_lossy(r),
                None    => "#nil".into(),
            }
        };
        th.unwind(mark)?;
        parts.push(text);
    }
    ret_str(th, dst, format!("{}{}{}", ldr, parts.join(", "), trlr).as_bytes())
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    write_common(th, dst, ap, "#Slice([", "])")
}

pub fn cslice_write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    write_common(th, dst, ap, "#Cslice([", "])")
}
