/// String class methods
///
/// Strings are immutable byte buffers; every operation builds a new one.
/// Slicing and indexing follow the shared negative-offset normalization.

use crate::core::oop::{self, call_by_selector, call_sel_hashed, method_redirect, str_cell_hash};
use crate::core::value::{Builtin, Value};
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::{
    self, bytearray::escape_into, index_norm, int_arg, list_arg, ret_str, slice_norm,
    str_arg, str_arg_bytes,
};
use crate::parse;
use crate::thread::Thread;

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    method_redirect(th, dst, "String", 1, ap + 1)
}

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    str_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn boolean(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = str_arg_bytes(th, ap)?;
    match &s[..] {
        b"#true"  => th.set_value(dst, Value::Bool(true)),
        b"#false" => th.set_value(dst, Value::Bool(false)),
        _         => Err(except::inv_value(th, ap)),
    }
}

/// Integer conversion with base prefixes, or an explicit base 2..16.
pub fn integer(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_range(th, argc, 1, 2)?;
    let s = str_arg_bytes(th, ap)?;
    let parsed = if argc == 2 {
        let base = int_arg(th, ap + 1)?;
        if !(2..=16).contains(&base) {
            return Err(except::inv_value(th, ap + 1));
        }
        parse::int_base(&s, base, true)
    } else {
        parse::int(&s)
    };
    match parsed {
        Some(v) => th.set_value(dst, Value::Int(v)),
        None    => Err(except::inv_value(th, ap)),
    }
}

/// One-character strings per byte.
fn to_char_array(th: &mut Thread, dst: usize, ap: usize, cl: Builtin) -> VmResult {
    let s = str_arg_bytes(th, ap)?;
    let r = {
        let res = th.vm.heap.lock().array_new(th.tid, dst, cl, s.len());
        th.lift(res)?
    };
    let mark = th.sp();
    let w = th.alloc(1)?;
    for (i, b) in s.iter().enumerate() {
        th.str_new(w, &[*b])?;
        let c = th.get(w)?;
        th.vm.heap.lock().array_set(r, i, &c);
    }
    th.unwind(mark)
}

pub fn array(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_char_array(th, dst, ap, Builtin::Array)
}

pub fn carray(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    to_char_array(th, dst, ap, Builtin::Carray)
}

/// Unescape the text and build a byte array from it.
pub fn bytearray(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = str_arg_bytes(th, ap)?;
    match parse::string_body(&s) {
        Some(body) => {
            let r = th.vm.heap.lock().barray_new(th.tid, dst, Builtin::Bytearray, &body);
            th.lift(r)?;
            Ok(())
        }
        None => Err(except::inv_value(th, ap)),
    }
}

/// Raw bytes, no unescaping.
pub fn cbytearray(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = str_arg_bytes(th, ap)?;
    let r = th.vm.heap.lock().barray_new(th.tid, dst, Builtin::Cbytearray, &s);
    th.lift(r)?;
    Ok(())
}

/// A string slice is always constant.
pub fn slice_of(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let s = str_arg(th, ap)?;
    let size = th.vm.heap.lock().str_bytes(s).len() as i64;
    let ofs = int_arg(th, ap + 1)?;
    let len = int_arg(th, ap + 2)?;
    let Some((o, l)) = slice_norm(ofs, len, size) else {
        return Err(except::idx_range2(th, ap, ap + 1, ap + 2));
    };
    let r = th.vm.heap.lock().slice_new(th.tid, dst, Builtin::Cslice, s, o, l);
    th.lift(r)?;
    Ok(())
}

pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let s = str_arg_bytes(th, ap)?;
    let ofs = int_arg(th, ap + 1)?;
    let Some(o) = index_norm(ofs, s.len() as i64) else {
        return Err(except::idx_range(th, ap, ap + 1));
    };
    ret_str(th, dst, &s[o..o + 1])
}

/// Use the string as a selector: dispatch on the first element of the
/// argument list.
pub fn call(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let sel = str_arg_bytes(th, ap)?;
    let mut node = list_arg(th, ap + 1)?;
    if node.is_none() {
        return Err(except::inv_value(th, ap + 1));
    }
    let hash = str_cell_hash(th, ap)?;
    let base = th.sp();
    let mut n = 0;
    while let Some(r) = node {
        let item = {
            let h = th.vm.heap.lock();
            let it = h.list_item(r);
            node = h.list_next(r);
            it
        };
        th.push(&item)?;
        n += 1;
    }
    call_sel_hashed(th, dst, &sel, hash, n)?;
    th.unwind(base)
}

pub fn cmp(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = str_arg_bytes(th, ap)?;
    let b = str_arg_bytes(th, ap + 1)?;
    let c = match a.cmp(&b) {
        std::cmp::Ordering::Less    => -1,
        std::cmp::Ordering::Equal   => 0,
        std::cmp::Ordering::Greater => 1,
    };
    th.set_value(dst, Value::Int(c))
}

pub fn concat(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let mut a = str_arg_bytes(th, ap)?;
    let b = str_arg_bytes(th, ap + 1)?;
    a.extend_from_slice(&b);
    ret_str(th, dst, &a)
}

pub fn equal(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = str_arg_bytes(th, ap)?;
    let eq = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, ap + 1).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.class_of_raw(r) == h.builtin(Builtin::String) => h.str_bytes(r) == a,
            _ => false,
        }
    };
    th.set_value(dst, Value::Bool(eq))
}

/// Indexed substitution: `[n]` splices in the written String form of the
/// n-th variable argument.
pub fn format(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    let _ = argc;
    let arr = oop::method_array_arg_push(th, 1)?;
    let s = str_arg_bytes(th, ap)?;
    let mut out = Vec::new();
    let mut rest = &s[..];
    loop {
        match rest.iter().position(|&b| b == b'[') {
            None => {
                if rest.iter().any(|&b| b == b']') {
                    return Err(except::inv_value(th, ap));
                }
                out.extend_from_slice(rest);
                break;
            }
            Some(i) => {
                out.extend_from_slice(&rest[..i]);
                rest = &rest[i + 1..];
                let Some(j) = rest.iter().position(|&b| b == b']') else {
                    return Err(except::inv_value(th, ap));
                };
                if j == 0 {
                    return Err(except::inv_value(th, ap));
                }
                let Some(idx) = parse::int(&rest[..j]) else {
                    return Err(except::inv_value(th, ap));
                };
                let n = th.vm.heap.lock().array_len(arr);
                let Some(o) = index_norm(idx, n as i64) else {
                    let w = th.alloc(1)?;
                    th.set_value(w, Value::Int(idx))?;
                    return Err(except::idx_range(th, ap, w));
                };
                let item = th.vm.heap.lock().array_get(arr, o);
                let mark = th.sp();
                let w = th.alloc(1)?;
                th.push(&item)?;
                call_by_selector(th, w, "String", 1)?;
                let piece = {
                    let h = th.vm.heap.lock();
                    match h.stack_cell(th.tid, w).ok().and_then(|c| c.as_obj()) {
                        Some(r) => h.str_bytes(r).to_vec(),
                        None    => b"#nil".to_vec(),
                    }
                };
                th.unwind(mark)?;
                out.extend_from_slice(&piece);
                rest = &rest[j + 1..];
            }
        }
    }
    ret_str(th, dst, &out)
}

pub fn hash(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    str_arg(th, ap)?;
    let hv = str_cell_hash(th, ap)?;
    th.set_value(dst, Value::Int(hv as i64))
}

fn find_sub(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from);
    }
    if from > hay.len() || hay.len() - from < needle.len() {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

pub fn index(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_range(th, argc, 2, 3)?;
    let s = str_arg_bytes(th, ap)?;
    let sub = str_arg_bytes(th, ap + 1)?;
    let mut from = 0usize;
    if argc == 3 {
        let ofs = int_arg(th, ap + 2)?;
        let Some(o) = index_norm(ofs, s.len() as i64) else {
            return Err(except::idx_range(th, ap, ap + 2));
        };
        from = o;
    }
    match find_sub(&s, &sub, from) {
        Some(i) => th.set_value(dst, Value::Int(i as i64)),
        None    => th.set_nil(dst),
    }
}

pub fn rindex(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_range(th, argc, 2, 3)?;
    let s = str_arg_bytes(th, ap)?;
    let sub = str_arg_bytes(th, ap + 1)?;
    let mut end = s.len();
    if argc == 3 {
        let ofs = int_arg(th, ap + 2)?;
        let Some(o) = index_norm(ofs, s.len() as i64) else {
            return Err(except::idx_range(th, ap, ap + 2));
        };
        end = o;
    }
    let mut i = end;
    while i >= sub.len() {
        if &s[i - sub.len()..i] == &sub[..] {
            return th.set_value(dst, Value::Int((i - sub.len()) as i64));
        }
        if i == sub.len() {
            break;
        }
        i -= 1;
    }
    th.set_nil(dst)
}

/// Join a list of strings with the receiver as separator.
pub fn join(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let sep = str_arg_bytes(th, ap)?;
    join_nodes(th, dst, ap + 1, &sep, false)
}

/// Join in reverse order.
pub fn rjoin(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let sep = str_arg_bytes(th, ap)?;
    join_nodes(th, dst, ap + 1, &sep, true)
}

fn join_nodes(
    th: &mut Thread,
    dst: usize,
    list_idx: usize,
    sep: &[u8],
    rev: bool,
) -> VmResult {
    let mut node = list_arg(th, list_idx)?;
    let mut parts: Vec<Vec<u8>> = Vec::new();
    while let Some(r) = node {
        let item = {
            let h = th.vm.heap.lock();
            let it = h.list_item(r);
            node = h.list_next(r);
            it
        };
        let mark = th.sp();
        let w = th.push(&item)?;
        let bytes = {
            let s = intrinsics::str_arg(th, w)?;
            th.vm.heap.lock().str_bytes(s).to_vec()
        };
        th.unwind(mark)?;
        parts.push(bytes);
    }
    if rev {
        parts.reverse();
    }
    ret_str(th, dst, &parts.join(&sep[..]))
}

pub fn parse(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = str_arg_bytes(th, ap)?;
    if crate::parse::parse(th, dst, &s)? {
        return Ok(());
    }
    Err(except::inv_value(th, ap))
}

pub fn size(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = str_arg_bytes(th, ap)?;
    th.set_value(dst, Value::Int(s.len() as i64))
}

pub fn slice(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let s = str_arg_bytes(th, ap)?;
    let ofs = int_arg(th, ap + 1)?;
    let len = int_arg(th, ap + 2)?;
    let Some((o, l)) = slice_norm(ofs, len, s.len() as i64) else {
        return Err(except::idx_range(th, ap + 1, ap + 2));
    };
    ret_str(th, dst, &s[o..o + l])
}

pub fn split(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let s = str_arg_bytes(th, ap)?;
    let delim = str_arg_bytes(th, ap + 1)?;
    let mark = th.sp();
    let mut n = 0;
    let mut rest = &s[..];
    while !rest.is_empty() {
        match find_sub(rest, &delim, 0) {
            Some(k) if !delim.is_empty() => {
                let w = th.alloc(1)?;
                th.str_new(w, &rest[..k])?;
                rest = &rest[k + delim.len()..];
                n += 1;
            }
            _ => {
                let w = th.alloc(1)?;
                th.str_new(w, rest)?;
                n += 1;
                break;
            }
        }
    }
    oop::list_from_stack(th, dst, mark, n)?;
    th.unwind(mark)
}

/// Quoted, escaped form.
pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let s = str_arg_bytes(th, ap)?;
    let mut out = vec![b'"'];
    escape_into(&mut out, &s);
    out.push(b'"');
    ret_str(th, dst, &out)
}
