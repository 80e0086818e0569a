/// Bytearray and Cbytearray class methods

use crate::core::oop::{self, list_from_stack, method_redirect};
use crate::core::value::{Builtin, Cell, Value};
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::{barray_arg, index_norm, int_arg, ret_str, slice_norm};
use crate::thread::Thread;

/// Escape a byte for the quoted external form.
pub fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        if b == b'"' {
            out.extend_from_slice(b"\\\"");
        } else if b.is_ascii_graphic() || b == b' ' {
            out.push(b);
        } else {
            out.extend_from_slice(format!("\\x{:02x}", b).as_bytes());
        }
    }
}

pub fn needs_quotes(data: &[u8]) -> bool {
    data.iter()
        .any(|&b| !b.is_ascii_graphic() || b.is_ascii_whitespace() || b == b'"')
}

fn bytes_of(th: &mut Thread, idx: usize) -> VmResult<Vec<u8>> {
    let r = barray_arg(th, idx)?;
    Ok(th.vm.heap.lock().barray_bytes(r).to_vec())
}

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let arg = th.get(ap + 1)?;
    match arg.value {
        Value::Int(n) => {
            if n < 0 {
                return Err(except::inv_value(th, ap + 1));
            }
            let zeros = vec![0u8; n as usize];
            let r = th.vm.heap.lock().barray_new(th.tid, dst, Builtin::Bytearray, &zeros);
            th.lift(r)?;
            Ok(())
        }
        _ => {
            let is_barray = {
                let h = th.vm.heap.lock();
                matches!(arg.as_obj(), Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Bytearray))
            };
            if is_barray {
                let data = bytes_of(th, ap + 1)?;
                let r = th.vm.heap.lock().barray_new(th.tid, dst, Builtin::Bytearray, &data);
                th.lift(r)?;
                Ok(())
            } else {
                method_redirect(th, dst, "Bytearray", 1, ap + 1)
            }
        }
    }
}

pub fn boolean(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let data = bytes_of(th, ap)?;
    th.set_value(dst, Value::Bool(!data.is_empty()))
}

/// Quoted only when the content needs it.
pub fn string(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let data = bytes_of(th, ap)?;
    let mut out = Vec::new();
    let quote = needs_quotes(&data);
    if quote {
        out.push(b'"');
    }
    escape_into(&mut out, &data);
    if quote {
        out.push(b'"');
    }
    ret_str(th, dst, &out)
}

pub fn list(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let data = bytes_of(th, ap)?;
    let base = th.sp();
    for b in &data {
        th.push(&Cell::int(*b as i64))?;
    }
    list_from_stack(th, dst, base, data.len())?;
    th.unwind(base)
}

fn to_int_array(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let data = bytes_of(th, ap)?;
    let r = {
        let res = th.vm.heap.lock().array_new(th.tid, dst, cl, data.len());
        th.lift(res)?
    };
    for (i, b) in data.iter().enumerate() {
        th.vm.heap.lock().array_set(r, i, &Cell::int(*b as i64));
    }
    Ok(())
}

pub fn array(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_int_array(th, dst, ap, Builtin::Array)
}

pub fn carray(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_int_array(th, dst, ap, Builtin::Carray)
}

fn slice_obj_common(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let b = barray_arg(th, ap)?;
    let size = th.vm.heap.lock().barray_bytes(b).len() as i64;
    let ofs = int_arg(th, ap + 1)?;
    let len = int_arg(th, ap + 2)?;
    let Some((o, l)) = slice_norm(ofs, len, size) else {
        return Err(except::idx_range2(th, ap, ap + 1, ap + 2));
    };
    let r = th.vm.heap.lock().slice_new(th.tid, dst, cl, b, o, l);
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

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let b = barray_arg(th, ap)?;
    let (own, data) = {
        let h = th.vm.heap.lock();
        (
            h.builtin_of(h.class_of_raw(b)).unwrap_or(Builtin::Bytearray),
            h.barray_bytes(b).to_vec(),
        )
    };
    let r = th.vm.heap.lock().barray_new(th.tid, dst, own, &data);
    th.lift(r)?;
    Ok(())
}

pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let data = bytes_of(th, ap)?;
    let idx = int_arg(th, ap + 1)?;
    let Some(o) = index_norm(idx, data.len() as i64) else {
        return Err(except::idx_range(th, ap, ap + 1));
    };
    th.set_value(dst, Value::Int(data[o] as i64))
}

pub fn atput(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let b = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, ap).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Bytearray) => Some(r),
            _ => None,
        }
    };
    let Some(b) = b else {
        return Err(except::inv_value(th, ap));
    };
    let idx = int_arg(th, ap + 1)?;
    let byte = int_arg(th, ap + 2)?;
    let size = th.vm.heap.lock().barray_bytes(b).len() as i64;
    let Some(o) = index_norm(idx, size) else {
        return Err(except::idx_range(th, ap, ap + 1));
    };
    if !(0..=255).contains(&byte) {
        return Err(except::inv_value(th, ap + 2));
    }
    th.vm.heap.lock().barray_bytes_mut(b)[o] = byte as u8;
    th.copy(dst, ap + 2)
}

pub fn cmp(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = bytes_of(th, ap)?;
    let b = bytes_of(th, ap + 1)?;
    let c = match a.cmp(&b) {
        std::cmp::Ordering::Less    => -1,
        std::cmp::Ordering::Equal   => 0,
        std::cmp::Ordering::Greater => 1,
    };
    th.set_value(dst, Value::Int(c))
}

pub fn equal(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = bytes_of(th, ap)?;
    let eq = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, ap + 1).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.is_subclass_of(h.class_of_raw(r), h.builtin(Builtin::Bytearray)) => {
                h.barray_bytes(r) == a
            }
            _ => false,
        }
    };
    th.set_value(dst, Value::Bool(eq))
}

pub fn size(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let data = bytes_of(th, ap)?;
    th.set_value(dst, Value::Int(data.len() as i64))
}

pub fn slice(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let b = barray_arg(th, ap)?;
    let (own, data) = {
        let h = th.vm.heap.lock();
        (
            h.builtin_of(h.class_of_raw(b)).unwrap_or(Builtin::Bytearray),
            h.barray_bytes(b).to_vec(),
        )
    };
    let ofs = int_arg(th, ap + 1)?;
    let len = int_arg(th, ap + 2)?;
    let Some((o, l)) = slice_norm(ofs, len, data.len() as i64) else {
        return Err(except::idx_range2(th, ap, ap + 1, ap + 2));
    };
    let r = th.vm.heap.lock().barray_new(th.tid, dst, own, &data[o..o + l]);
    th.lift(r)?;
    Ok(())
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let data = bytes_of(th, ap)?;
    let mut out = b"#Bytearray(\"".to_vec();
    escape_into(&mut out, &data);
    out.extend_from_slice(b"\")");
    ret_str(th, dst, &out)
}

// -- Cbytearray -------------------------------------------------------------

pub fn cbarray_new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    method_redirect(th, dst, "Cbytearray", 1, ap + 1)
}

pub fn cbarray_copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    barray_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn cbarray_write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let data = bytes_of(th, ap)?;
    let mut out = b"#Cbytearray(".to_vec();
    escape_into(&mut out, &data);
    out.push(b')');
    ret_str(th, dst, &out)
}
