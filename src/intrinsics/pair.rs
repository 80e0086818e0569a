/// Pair class methods
///
/// Pair contents are immutable after creation, so copy is identity and
/// only copydeep allocates.

use crate::core::oop::{self, call_by_selector, method_redirect};
use crate::core::value::Value;
use crate::errors::VmResult;
use crate::intrinsics::{pair_arg, ret_str, write_of};
use crate::thread::Thread;

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    match argc {
        2 => method_redirect(th, dst, "Pair", 1, ap + 1),
        3 => {
            let first = th.get(ap + 1)?;
            let second = th.get(ap + 2)?;
            th.pair_new(dst, &first, &second)?;
            Ok(())
        }
        _ => Err(crate::except::num_args_range(th, 2, 3)),
    }
}

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    pair_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn copydeep(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let pr = pair_arg(th, ap)?;
    th.obj_lock(pr)?;
    let result = (|th: &mut Thread| -> VmResult {
        let (first, second) = th.vm.heap.lock().pair_parts(pr);
        let mark = th.sp();
        let w = th.alloc(2)?;
        th.push(&first)?;
        call_by_selector(th, w, "copydeep", 1)?;
        th.push(&second)?;
        call_by_selector(th, w + 1, "copydeep", 1)?;
        let a = th.get(w)?;
        let b = th.get(w + 1)?;
        th.pair_new(dst, &a, &b)?;
        th.unwind(mark)
    })(th);
    th.obj_unlock(pr);
    result
}

pub fn list(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let pr = pair_arg(th, ap)?;
    let (first, second) = th.vm.heap.lock().pair_parts(pr);
    let mark = th.sp();
    let w = th.alloc(1)?;
    let tail = th.list_new(w, &second, None)?;
    th.list_new(dst, &first, Some(tail))?;
    th.unwind(mark)
}

pub fn equal(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let pr = pair_arg(th, ap)?;
    let other = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, ap + 1).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.class_of_raw(r) == h.class_of_raw(pr) => Some(r),
            _ => None,
        }
    };
    let mut result = false;
    if let Some(other) = other {
        let (a1, a2) = th.vm.heap.lock().pair_parts(pr);
        let (b1, b2) = th.vm.heap.lock().pair_parts(other);
        let mark = th.sp();
        let w = th.alloc(1)?;
        th.push(&a1)?;
        th.push(&b1)?;
        call_by_selector(th, w, "equal", 2)?;
        let first_eq = matches!(th.get(w)?.value, Value::Bool(true));
        th.unwind(w + 1)?;
        if first_eq {
            th.push(&a2)?;
            th.push(&b2)?;
            call_by_selector(th, w, "equal", 2)?;
            result = matches!(th.get(w)?.value, Value::Bool(true));
        }
        th.unwind(mark)?;
    }
    th.set_value(dst, Value::Bool(result))
}

pub fn first(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let pr = pair_arg(th, ap)?;
    let (first, _) = th.vm.heap.lock().pair_parts(pr);
    th.set(dst, &first)
}

pub fn second(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let pr = pair_arg(th, ap)?;
    let (_, second) = th.vm.heap.lock().pair_parts(pr);
    th.set(dst, &second)
}

/// Sum of the halves' hashes, cached in the cell.
pub fn hash(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cached = th.get(ap)?.hash;
    let hv = match cached {
        Some(hv) => hv,
        None => {
            let pr = pair_arg(th, ap)?;
            let (first, second) = th.vm.heap.lock().pair_parts(pr);
            let mark = th.sp();
            let w = th.alloc(1)?;
            th.push(&first)?;
            call_by_selector(th, w, "hash", 1)?;
            let h1 = match th.get(w)?.value {
                Value::Int(i) => i as u32,
                _ => return Err(crate::except::inv_value(th, w)),
            };
            th.free(1)?;
            th.push(&second)?;
            call_by_selector(th, w, "hash", 1)?;
            let h2 = match th.get(w)?.value {
                Value::Int(i) => i as u32,
                _ => return Err(crate::except::inv_value(th, w)),
            };
            th.unwind(mark)?;
            let hv = h1.wrapping_add(h2);
            th.vm.heap.lock().stack_set_hash(th.tid, ap, hv);
            hv
        }
    };
    th.set_value(dst, Value::Int(hv as i64))
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let pr = pair_arg(th, ap)?;
    th.obj_lock(pr)?;
    let result = (|th: &mut Thread| -> VmResult<String> {
        let (first, second) = th.vm.heap.lock().pair_parts(pr);
        let mark = th.sp();
        let a = th.push(&first)?;
        let s1 = write_of(th, a)?;
        th.set(a, &second)?;
        let s2 = write_of(th, a)?;
        th.unwind(mark)?;
        Ok(format!("<{}, {}>", s1, s2))
    })(th);
    th.obj_unlock(pr);
    let text = result?;
    ret_str(th, dst, text.as_bytes())
}
