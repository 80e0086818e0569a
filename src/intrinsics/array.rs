/// Array and Carray class methods
///
/// A Carray is an Array whose write methods were never installed; the
/// shape is shared and the class distinguishes the two.

use crate::core::oop::{self, call_by_selector, list_from_stack, method_redirect};
use crate::core::value::{Builtin, Cell, ObjRef, Value};
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::{
    array_arg, index_norm, int_arg, ret_str, slice_norm, write_of,
};
use crate::thread::Thread;

fn cells_of(th: &Thread, a: ObjRef) -> Vec<Cell> {
    let h = th.vm.heap.lock();
    (0..h.array_len(a)).map(|i| h.array_get(a, i)).collect()
}

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let arg = th.get(ap + 1)?;
    match arg.value {
        Value::Int(n) => {
            if n < 0 {
                return Err(except::inv_value(th, ap + 1));
            }
            let r = th.vm.heap.lock().array_new(th.tid, dst, Builtin::Array, n as usize);
            th.lift(r)?;
            Ok(())
        }
        _ => {
            let is_array = {
                let h = th.vm.heap.lock();
                matches!(arg.as_obj(), Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Array))
            };
            if is_array {
                copy_common(th, dst, ap + 1, Builtin::Array)
            } else {
                method_redirect(th, dst, "Array", 1, ap + 1)
            }
        }
    }
}

fn copy_common(th: &mut Thread, dst: usize, src_idx: usize, cl: Builtin) -> VmResult {
    let src = array_arg(th, src_idx)?;
    let cells = cells_of(th, src);
    let r = {
        let res = th.vm.heap.lock().array_new(th.tid, dst, cl, cells.len());
        th.lift(res)?
    };
    for (i, c) in cells.iter().enumerate() {
        th.vm.heap.lock().array_set(r, i, c);
    }
    Ok(())
}

pub fn boolean(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let a = array_arg(th, ap)?;
    let n = th.vm.heap.lock().array_len(a);
    th.set_value(dst, Value::Bool(n > 0))
}

pub fn list(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let a = array_arg(th, ap)?;
    let cells = cells_of(th, a);
    let base = th.sp();
    for c in &cells {
        th.push(c)?;
    }
    list_from_stack(th, dst, base, cells.len())?;
    th.unwind(base)
}

pub fn to_array(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    array_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn to_carray(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    copy_common(th, dst, ap, Builtin::Carray)
}

fn slice_obj_common(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let a = array_arg(th, ap)?;
    let size = th.vm.heap.lock().array_len(a) as i64;
    let ofs = int_arg(th, ap + 1)?;
    let len = int_arg(th, ap + 2)?;
    let Some((o, l)) = slice_norm(ofs, len, size) else {
        return Err(except::idx_range2(th, ap, ap + 1, ap + 2));
    };
    let r = th.vm.heap.lock().slice_new(th.tid, dst, cl, a, o, l);
    th.lift(r)?;
    Ok(())
}

pub fn slice_of(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    slice_obj_common(th, dst, ap, Builtin::Slice)
}

pub fn cslice_of(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    slice_obj_common(th, dst, ap, Builtin::Cslice)
}

/// Copy keeps the receiver's own class.
pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let src = array_arg(th, ap)?;
    let own = {
        let h = th.vm.heap.lock();
        h.builtin_of(h.class_of_raw(src))
    };
    copy_common(th, dst, ap, own.unwrap_or(Builtin::Array))
}

pub fn copydeep(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let src = array_arg(th, ap)?;
    let own = {
        let h = th.vm.heap.lock();
        h.builtin_of(h.class_of_raw(src)).unwrap_or(Builtin::Array)
    };
    th.obj_lock(src)?;
    let result = (|th: &mut Thread| -> VmResult {
        let cells = cells_of(th, src);
        let r = {
            let res = th.vm.heap.lock().array_new(th.tid, dst, own, cells.len());
            th.lift(res)?
        };
        let mark = th.sp();
        let w = th.alloc(1)?;
        for (i, c) in cells.iter().enumerate() {
            th.push(c)?;
            call_by_selector(th, w, "copydeep", 1)?;
            let v = th.get(w)?;
            th.vm.heap.lock().array_set(r, i, &v);
            th.free(1)?;
        }
        th.unwind(mark)
    })(th);
    th.obj_unlock(src);
    result
}

pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = array_arg(th, ap)?;
    let idx = int_arg(th, ap + 1)?;
    let size = th.vm.heap.lock().array_len(a) as i64;
    let Some(o) = index_norm(idx, size) else {
        return Err(except::idx_range(th, ap, ap + 1));
    };
    let c = th.vm.heap.lock().array_get(a, o);
    th.set(dst, &c)
}

/// Store; only the mutable variant carries this method, and the raw
/// class is checked so a Carray received through an Array-typed slot
/// still refuses.
pub fn atput(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let a = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, ap).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Array) => Some(r),
            _ => None,
        }
    };
    let Some(a) = a else {
        return Err(except::inv_value(th, ap));
    };
    let idx = int_arg(th, ap + 1)?;
    let size = th.vm.heap.lock().array_len(a) as i64;
    let Some(o) = index_norm(idx, size) else {
        return Err(except::idx_range(th, ap, ap + 1));
    };
    let v = th.get(ap + 2)?;
    th.vm.heap.lock().array_set(a, o, &v);
    th.copy(dst, ap + 2)
}

/// Size and element-wise `equal`.
pub fn equal(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = array_arg(th, ap)?;
    let b = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, ap + 1).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.is_subclass_of(h.class_of_raw(r), h.builtin(Builtin::Array)) => Some(r),
            _ => None,
        }
    };
    let Some(b) = b else {
        return th.set_value(dst, Value::Bool(false));
    };
    let xs = cells_of(th, a);
    let ys = cells_of(th, b);
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

pub fn size(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let a = array_arg(th, ap)?;
    let n = th.vm.heap.lock().array_len(a);
    th.set_value(dst, Value::Int(n as i64))
}

/// Materialized slice keeping the receiver's class.
pub fn slice(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let a = array_arg(th, ap)?;
    let own = {
        let h = th.vm.heap.lock();
        h.builtin_of(h.class_of_raw(a)).unwrap_or(Builtin::Array)
    };
    let size = th.vm.heap.lock().array_len(a) as i64;
    let ofs = int_arg(th, ap + 1)?;
    let len = int_arg(th, ap + 2)?;
    let Some((o, l)) = slice_norm(ofs, len, size) else {
        return Err(except::idx_range2(th, ap, ap + 1, ap + 2));
    };
    let cells = cells_of(th, a);
    let r = {
        let res = th.vm.heap.lock().array_new(th.tid, dst, own, l);
        th.lift(res)?
    };
    for (i, c) in cells[o..o + l].iter().enumerate() {
        th.vm.heap.lock().array_set(r, i, c);
    }
    Ok(())
}

fn write_common(th: &mut Thread, dst: usize, ap: usize, ldr: &str, trlr: &str) -> VmResult {
    let a = array_arg(th, ap)?;
    th.obj_lock(a)?;
    let result = (|th: &mut Thread| -> VmResult<String> {
        let cells = cells_of(th, a);
        let mut parts = Vec::new();
        for c in &cells {
            let mark = th.sp();
            let w = th.push(c)?;
            parts.push(write_of(th, w)?);
            th.unwind(mark)?;
        }
        Ok(format!("{}{}{}", ldr, parts.join(", "), trlr))
    })(th);
    th.obj_unlock(a);
    let text = result?;
    ret_str(th, dst, text.as_bytes())
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    write_common(th, dst, ap, "[", "]")
}

// -- Carray -----------------------------------------------------------------

pub fn carray_new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    method_redirect(th, dst, "Carray", 1, ap + 1)
}

pub fn carray_copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    array_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn carray_to_array(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    copy_common(th, dst, ap, Builtin::Array)
}

/// Element hashes summed; constant arrays can cache in the cell.
pub fn carray_hash(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cached = th.get(ap)?.hash;
    let hv = match cached {
        Some(hv) => hv,
        None => {
            let a = array_arg(th, ap)?;
            th.obj_lock(a)?;
            let result = (|th: &mut Thread| -> VmResult<u32> {
                let cells = cells_of(th, a);
                let mark = th.sp();
                let w = th.alloc(1)?;
                let mut sum = 0u32;
                for c in &cells {
                    th.push(c)?;
                    call_by_selector(th, w, "hash", 1)?;
                    match th.get(w)?.value {
                        Value::Int(i) => sum = sum.wrapping_add(i as u32),
                        _ => return Err(except::inv_value(th, w)),
                    }
                    th.free(1)?;
                }
                th.unwind(mark)?;
                Ok(sum)
            })(th);
            th.obj_unlock(a);
            let hv = result?;
            th.vm.heap.lock().stack_set_hash(th.tid, ap, hv);
            hv
        }
    };
    th.set_value(dst, Value::Int(hv as i64))
}

pub fn carray_write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    write_common(th, dst, ap, "#Carray.new([", "])")
}
