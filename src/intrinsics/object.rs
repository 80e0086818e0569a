/// Object class methods
///
/// The universal protocol: identity equality, copying, user-instance
/// attribute access with the privacy rule, the `new`/`__alloc__`/
/// `__init__` construction chain, and printing.  Method and Codemethod
/// call methods live here too since they share the redirect plumbing.

use crate::core::oop::{
    self, call_by_selector, class_of_resolved, dict_at_put, list_from_stack, method_find_in,
    str_cell_hash, MethodDict,
};
use crate::core::value::{mem_hash, Builtin, Cell, ObjRef, Value};
use crate::errors::VmResult;
use crate::except;
use crate::gc::Shape;
use crate::intrinsics::{self, user_arg, write_of};
use crate::thread::{method_symbol, Thread};

/// `__init__`: merge an optional dictionary of attributes into the fresh
/// instance.
pub fn init(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_range(th, argc, 1, 2)?;
    let recvr = user_arg(th, ap)?;
    if argc == 2 {
        let from = intrinsics::dict_arg(th, ap + 1)?;
        dict_merge(th, recvr, from)?;
    }
    th.copy(dst, ap)
}

/// Copy every (key, value) of `from` into `to` via the ordinary store
/// path.
pub fn dict_merge(th: &mut Thread, to: ObjRef, from: ObjRef) -> VmResult {
    let pairs = collect_items(th, from)?;
    for pr in pairs {
        let parts = {
            let h = th.vm.heap.lock();
            pr.as_obj().map(|p| h.pair_parts(p))
        };
        let Some((k, v)) = parts else { continue };
        let mark = th.sp();
        let w = th.alloc(2)?;
        th.set(w, &k)?;
        th.set(w + 1, &v)?;
        dict_at_put(th, to, w, w + 1)?;
        th.unwind(mark)?;
    }
    Ok(())
}

/// Snapshot of every bucket element of a set-shaped object.
pub fn collect_items(th: &mut Thread, s: ObjRef) -> VmResult<Vec<Cell>> {
    let h = th.vm.heap.lock();
    let mut out = Vec::new();
    let size = h.set_shape(s).table.len();
    for i in 0..size {
        let mut node = h.set_shape(s).table[i];
        while let Some(n) = node {
            out.push(h.list_item(n));
            node = h.list_next(n);
        }
    }
    Ok(out)
}

pub fn boolean(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let nil = th.get(ap)?.is_nil();
    th.set_value(dst, Value::Bool(!nil))
}

/// User instance to a list of its attribute pairs; the reserved class
/// entry is skipped.
pub fn list(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    if th.get(ap)?.is_nil() {
        return th.set_nil(dst);
    }
    let recvr = user_arg(th, ap)?;
    let items = collect_items(th, recvr)?;
    let mark = th.sp();
    let mut n = 0;
    for item in items {
        let skip = {
            let h = th.vm.heap.lock();
            match item.as_obj().map(|p| h.pair_parts(p).0) {
                Some(k) => match k.as_obj() {
                    Some(kr) if matches!(h.shape(kr), Shape::Str(_)) => {
                        h.str_bytes(kr) == b"__instanceof__"
                    }
                    _ => false,
                },
                None => false,
            }
        };
        if !skip {
            th.push(&item)?;
            n += 1;
        }
    }
    list_from_stack(th, dst, mark, n)?;
    th.unwind(mark)
}

/// `new`: `__alloc__` on the class, then `__init__` on the instance with
/// the remaining arguments.
pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_min(th, argc, 1)?;
    let mark = th.sp();
    let recvr = th.get(ap)?;
    th.push(&recvr)?;
    let inst = th.alloc(1)?;
    {
        // __alloc__ takes just the class.
        let c = th.get(mark)?;
        let save = th.sp();
        th.push(&c)?;
        call_by_selector(th, inst, "__alloc__", 1)?;
        th.unwind(save)?;
    }
    let i = th.get(inst)?;
    th.push(&i)?;
    for n in 1..argc {
        let a = th.get(ap + n)?;
        th.push(&a)?;
    }
    call_by_selector(th, dst, "__init__", argc)?;
    th.unwind(mark)
}

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    if th.get(ap)?.is_nil() {
        return th.copy(dst, ap);
    }
    let recvr = user_arg(th, ap)?;
    crate::intrinsics::set::clone_set(th, dst, recvr, None, false)
}

pub fn copydeep(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    if th.get(ap)?.is_nil() {
        return th.copy(dst, ap);
    }
    let recvr = user_arg(th, ap)?;
    crate::intrinsics::set::clone_set(th, dst, recvr, None, true)
}

/// Attribute probe shared by at/ate/atdefault: private attribute names
/// are visible only to methods of the instance's own class, one caller
/// frame up.  Returns the binding pair.
fn obj_at(th: &mut Thread, dst: usize, inst_idx: usize, key_idx: usize) -> VmResult<bool> {
    let key = intrinsics::str_arg(th, key_idx)?;
    let kb = th.vm.heap.lock().str_bytes(key).to_vec();
    if kb.len() > 2 && kb[0] == b'_' && kb[1] != b'_' {
        let resolved = {
            let c = th.get(inst_idx)?;
            let h = th.vm.heap.lock();
            class_of_resolved(&h, &c.value)
        };
        if th.frames.class_up(1) != Some(resolved) {
            return Ok(false);
        }
    }
    let hash = str_cell_hash(th, key_idx)?;
    let pr = {
        let h = th.vm.heap.lock();
        let inst = h.stack_cell(th.tid, inst_idx).ok().and_then(|c| c.as_obj());
        inst.and_then(|r| h.dict_ats(r, &kb, hash))
    };
    match pr {
        Some(pr) => {
            th.set(dst, &Cell::obj(pr))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    user_arg(th, ap)?;
    if !obj_at(th, dst, ap, ap + 1)? {
        th.set_nil(dst)?;
    }
    Ok(())
}

pub fn ate(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    user_arg(th, ap)?;
    if obj_at(th, dst, ap, ap + 1)? {
        let second = {
            let h = th.vm.heap.lock();
            let pr = h.stack_cell(th.tid, dst).ok().and_then(|c| c.as_obj());
            pr.map(|p| h.pair_parts(p).1)
        };
        if let Some(v) = second {
            return th.set(dst, &v);
        }
    }
    Err(except::no_attr(th, ap, ap + 1))
}

pub fn atdefault(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    user_arg(th, ap)?;
    if obj_at(th, dst, ap, ap + 1)? {
        let second = {
            let h = th.vm.heap.lock();
            let pr = h.stack_cell(th.tid, dst).ok().and_then(|c| c.as_obj());
            pr.map(|p| h.pair_parts(p).1)
        };
        if let Some(v) = second {
            return th.set(dst, &v);
        }
    }
    th.copy(dst, ap + 2)
}

pub fn atput(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let recvr = user_arg(th, ap)?;
    let key = intrinsics::str_arg(th, ap + 1)?;
    let kb = th.vm.heap.lock().str_bytes(key).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let val = th.get(ap + 2)?;
    let stored = th.vm.heap.lock().dict_puts(recvr, &kb, hash, &val);
    if stored.is_err() {
        return Err(except::modify_const(th, recvr, ap + 1));
    }
    th.copy(dst, ap + 2)
}

/// `cons` on nil starts a one-element list.
pub fn cons(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    if !th.get(ap)?.is_nil() {
        return Err(except::inv_value(th, ap));
    }
    let item = th.get(ap + 1)?;
    th.list_new(dst, &item, None)?;
    Ok(())
}

/// Pair each element of the receiver's List form with its index.
pub fn enumerate(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let mark = th.sp();
    let lst = th.alloc(1)?;
    let recvr = th.get(ap)?;
    th.push(&recvr)?;
    call_by_selector(th, lst, "List", 1)?;
    let mut node = intrinsics::list_arg(th, lst)?;
    let base = th.sp();
    let mut n = 0usize;
    while let Some(r) = node {
        let item = {
            let h = th.vm.heap.lock();
            let it = h.list_item(r);
            node = h.list_next(r);
            it
        };
        let w = th.alloc(1)?;
        th.push(&item)?;
        th.set_value(w, Value::Int(n as i64))?;
        let idx_cell = th.get(w)?;
        let item_cell = th.get(w + 1)?;
        th.pair_new(w, &idx_cell, &item_cell)?;
        th.free(1)?;
        n += 1;
    }
    list_from_stack(th, dst, base, n)?;
    th.unwind(mark)
}

/// Default equality: object identity.
pub fn equal(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = th.get(ap)?;
    let b = th.get(ap + 1)?;
    let eq = match (&a.value, &b.value) {
        (Value::Obj(x), Value::Obj(y)) => x == y,
        _ => false,
    };
    th.set_value(dst, Value::Bool(eq))
}

pub fn isnil(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let nil = th.get(ap)?.is_nil();
    th.set_value(dst, Value::Bool(nil))
}

pub fn instanceof(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cl = {
        let c = th.get(ap)?;
        let h = th.vm.heap.lock();
        class_of_resolved(&h, &c.value)
    };
    th.set_obj(dst, Some(cl))
}

/// Look an instance method up on the receiver's resolved class.
pub fn method(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let sel = intrinsics::str_arg_bytes(th, ap + 1)?;
    let hash = str_cell_hash(th, ap + 1)?;
    let found = {
        let c = th.get(ap)?;
        let h = th.vm.heap.lock();
        let cl = class_of_resolved(&h, &c.value);
        method_find_in(&h, Some(cl), MethodDict::Instance, &sel, hash)
    };
    match found {
        Some(f) => th.set(dst, &f.method),
        None    => th.set_nil(dst),
    }
}

/// The class-scoped stdout File, created on first use.
pub fn stdout_file(th: &mut Thread, dst: usize) -> VmResult {
    let cached = {
        let h = th.vm.heap.lock();
        h.class_ats(h.builtin(Builtin::File), b"stdout", mem_hash(b"stdout"))
    };
    match cached {
        Some(c) => th.set(dst, &c),
        None => {
            let mark = th.sp();
            let f = th.alloc(2)?;
            th.str_new(f, b"stdout")?;
            th.str_new(f + 1, b"w")?;
            let (name, mode) = {
                let h = th.vm.heap.lock();
                (
                    h.stack_cell(th.tid, f).unwrap().as_obj().unwrap(),
                    h.stack_cell(th.tid, f + 1).unwrap().as_obj().unwrap(),
                )
            };
            let r = th.vm.heap.lock().file_new(
                th.tid,
                dst,
                name,
                mode,
                crate::gc::FileHandle::Stdout,
            );
            th.lift(r)?;
            th.unwind(mark)
        }
    }
}

pub fn print(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    print_common(th, dst, argc, ap, "write")
}

pub fn println(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    print_common(th, dst, argc, ap, "writeln")
}

fn print_common(th: &mut Thread, dst: usize, argc: usize, ap: usize, how: &str) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let mark = th.sp();
    let s = th.alloc(1)?;
    let recvr = th.get(ap)?;
    th.push(&recvr)?;
    call_by_selector(th, s, "String", 1)?;
    let f = th.alloc(1)?;
    stdout_file(th, f)?;
    let w = th.alloc(1)?;
    let fc = th.get(f)?;
    th.push(&fc)?;
    let sc = th.get(s)?;
    th.push(&sc)?;
    call_by_selector(th, w, how, 2)?;
    if how == "write" {
        let fc = th.get(f)?;
        th.push(&fc)?;
        call_by_selector(th, w, "flush", 1)?;
    }
    th.unwind(mark)?;
    th.copy(dst, ap)
}

pub fn reverse(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    if !th.get(ap)?.is_nil() {
        return Err(except::inv_value(th, ap));
    }
    th.copy(dst, ap)
}

pub fn size(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    if !th.get(ap)?.is_nil() {
        return Err(except::inv_value(th, ap));
    }
    th.set_value(dst, Value::Int(0))
}

/// `ClassName@index`, plus the attribute dictionary for user instances.
pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let c = th.get(ap)?;
    let Value::Obj(obj) = c.value.clone() else {
        return Err(except::inv_value(th, ap));
    };
    let Some(obj) = obj else {
        return intrinsics::ret_str(th, dst, b"#nil");
    };
    let header = {
        let h = th.vm.heap.lock();
        let cl = class_of_resolved(&h, &c.value);
        let name = h
            .class_shape(cl)
            .name
            .map(|n| h.str_lossy(n))
            .unwrap_or_else(|| "?".into());
        format!("{}@{:#x}", name, obj.idx())
    };
    let is_user = {
        let h = th.vm.heap.lock();
        h.class_of_raw(obj) == h.builtin(Builtin::User)
    };
    if !is_user {
        return intrinsics::ret_str(th, dst, header.as_bytes());
    }
    th.obj_lock(obj)?;
    let body = (|th: &mut Thread| -> VmResult<String> {
        let items = collect_items(th, obj)?;
        let mut parts = Vec::new();
        for item in items {
            let (k, v, skip) = {
                let h = th.vm.heap.lock();
                match item.as_obj() {
                    Some(p) => {
                        let (k, v) = h.pair_parts(p);
                        let skip = match k.as_obj() {
                            Some(kr) if matches!(h.shape(kr), Shape::Str(_)) => {
                                h.str_bytes(kr) == b"__instanceof__"
                            }
                            _ => false,
                        };
                        let ks = match k.as_obj() {
                            Some(kr) if matches!(h.shape(kr), Shape::Str(_)) => h.str_lossy(kr),
                            _ => "?".into(),
                        };
                        (ks, v, skip)
                    }
                    None => continue,
                }
            };
            if skip {
                continue;
            }
            let mark = th.sp();
            th.push(&v)?;
            let text = write_of(th, th.sp() - 1)?;
            th.unwind(mark)?;
            parts.push(format!("\"{}\": {}", k, text));
        }
        Ok(format!("{{{}}}", parts.join(", ")))
    })(th);
    th.obj_unlock(obj);
    let body = body?;
    intrinsics::ret_str(th, dst, format!("{}{}", header, body).as_bytes())
}

// ---------------------------------------------------------------------------
// Method and Codemethod
// ---------------------------------------------------------------------------

/// `call`: run the method under the caller's namespace with the remaining
/// arguments.
pub fn method_call(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_min(th, argc, 1)?;
    let recvr = th.get(ap)?;
    if !recvr.is_callable() {
        return Err(except::inv_value(th, ap));
    }
    let ns = {
        let r = th.frames.ns_up(1);
        th.lift(r)?
    };
    oop::method_run(th, dst, Some(ns), None, &recvr, argc - 1, ap + 1)
}

/// `calla`: like `call` with the arguments as one list.
pub fn method_calla(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let recvr = th.get(ap)?;
    if !recvr.is_callable() {
        return Err(except::inv_value(th, ap));
    }
    let mut node = intrinsics::list_arg(th, ap + 1)?;
    if node.is_none() {
        return Err(except::inv_value(th, ap + 1));
    }
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
    let ns = {
        let r = th.frames.ns_up(1);
        th.lift(r)?
    };
    oop::method_run(th, dst, Some(ns), None, &recvr, n, base)?;
    th.unwind(base)
}

pub fn method_write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let recvr = th.get(ap)?;
    if !recvr.is_callable() {
        return Err(except::inv_value(th, ap));
    }
    intrinsics::ret_str(th, dst, method_symbol(&recvr).as_bytes())
}
