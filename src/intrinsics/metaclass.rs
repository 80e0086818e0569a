/// Metaclass methods
///
/// Classes are instances of the metaclass; their class methods live in
/// the receiver's own class-method dictionary and these instance methods
/// serve every class object.  `new` creates a user class whose instances
/// are user-instance dictionaries.

use crate::core::oop::{
    self, method_find_in, str_cell_hash, user_new, MethodDict,
};
use crate::core::value::{Builtin, Cell, Codemethod, ObjRef, Value};
use crate::errors::VmResult;
use crate::except;
use crate::gc::ClassField;
use crate::intrinsics::{class_arg, ns_arg, ret_str, str_arg};
use crate::thread::Thread;

pub const CL_VARS_DICT_SIZE: usize = 16;
pub const CL_METHOD_DICT_SIZE: usize = 128;

/// Create a class object: metaclass instance with fresh dictionaries,
/// bound under its name in the home namespace.
pub fn class_new(
    th: &mut Thread,
    dst: usize,
    ns: ObjRef,
    name: &[u8],
    name_hash: u32,
    parent: Option<ObjRef>,
) -> VmResult<ObjRef> {
    let mark = th.sp();
    let w = th.alloc(4)?;
    let cl = {
        let mut h = th.vm.heap.lock();
        let meta = h.builtin(Builtin::Metaclass);
        let r = h.class_alloc(th.tid, dst, Some(meta));
        drop(h);
        th.lift(r)?
    };
    th.str_new(w, name)?;
    {
        let mut h = th.vm.heap.lock();
        let name_r = h.stack_cell(th.tid, w).unwrap().as_obj();
        h.class_set_field(cl, ClassField::Name, name_r);
        h.class_set_field(cl, ClassField::Parent, parent);
        h.class_set_field(cl, ClassField::Ns, Some(ns));
    }
    for (i, (field, size)) in [
        (ClassField::Vars, CL_VARS_DICT_SIZE),
        (ClassField::ClMethods, CL_METHOD_DICT_SIZE),
        (ClassField::InstMethods, CL_METHOD_DICT_SIZE),
    ]
    .into_iter()
    .enumerate()
    {
        let mut h = th.vm.heap.lock();
        let r = h.set_new(th.tid, w + 1 + i, Builtin::Dictionary, size);
        let d = {
            drop(h);
            th.lift(r)?
        };
        th.vm.heap.lock().class_set_field(cl, field, Some(d));
    }
    let bound = {
        let mut h = th.vm.heap.lock();
        let cell = Cell::obj(cl);
        h.ns_puts(ns, name, name_hash, &cell)
    };
    if bound.is_err() {
        let n = th.alloc(1)?;
        th.str_new_hashed(n, name, name_hash)?;
        return Err(except::modify_const(th, ns, n));
    }
    th.unwind(mark)?;
    Ok(cl)
}

/// `__alloc__` installed on user classes: a fresh user instance of the
/// receiver.
pub fn user_alloc(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_min(th, argc, 1)?;
    let cl = class_arg(th, ap)?;
    user_new(th, dst, cl)?;
    Ok(())
}

/// User class creation: name, parent class, optional home namespace.
pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    if !(3..=4).contains(&argc) {
        return Err(except::num_args_range(th, 3, 4));
    }
    let name_r = str_arg(th, ap + 1)?;
    let name = th.vm.heap.lock().str_bytes(name_r).to_vec();
    let parent = class_arg(th, ap + 2)?;
    let ns = if argc == 4 {
        ns_arg(th, ap + 3)?
    } else {
        let r = th.frames.ns_up(1);
        th.lift(r)?
    };
    let hash = str_cell_hash(th, ap + 1)?;
    let cl = class_new(th, dst, ns, &name, hash, Some(parent))?;
    let alloc = Cell::new(Value::Codemethod(Codemethod {
        name: "main.Metaclass.__alloc__",
        f: user_alloc,
    }));
    let stored = {
        let mut h = th.vm.heap.lock();
        let dict = h.class_shape(cl).cl_methods.expect("fresh class");
        h.dict_puts(dict, b"__alloc__", crate::core::value::mem_hash(b"__alloc__"), &alloc)
    };
    debug_assert!(stored.is_ok());
    Ok(())
}

/// Class variable lookup; answers the binding pair, nil when absent.
pub fn at(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let cl = class_arg(th, ap)?;
    let key = str_arg(th, ap + 1)?;
    let kb = th.vm.heap.lock().str_bytes(key).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let pr = {
        let h = th.vm.heap.lock();
        h.class_shape(cl).vars.and_then(|d| h.dict_ats(d, &kb, hash))
    };
    match pr {
        Some(pr) => th.set(dst, &Cell::obj(pr)),
        None     => th.set_nil(dst),
    }
}

pub fn ate(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let cl = class_arg(th, ap)?;
    let key = str_arg(th, ap + 1)?;
    let kb = th.vm.heap.lock().str_bytes(key).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let val = th.vm.heap.lock().class_ats(cl, &kb, hash);
    match val {
        Some(v) => th.set(dst, &v),
        None    => Err(except::no_attr(th, ap, ap + 1)),
    }
}

pub fn atput(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let cl = class_arg(th, ap)?;
    let key = str_arg(th, ap + 1)?;
    let kb = th.vm.heap.lock().str_bytes(key).to_vec();
    let hash = str_cell_hash(th, ap + 1)?;
    let val = th.get(ap + 2)?;
    let stored = th.vm.heap.lock().class_puts(cl, &kb, hash, &val);
    if stored.is_err() {
        return Err(except::modify_const(th, cl, ap + 1));
    }
    th.copy(dst, ap + 2)
}

pub fn name(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cl = class_arg(th, ap)?;
    let n = th.vm.heap.lock().class_shape(cl).name;
    th.set_obj(dst, n)
}

pub fn parent(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cl = class_arg(th, ap)?;
    let p = th.vm.heap.lock().class_shape(cl).parent;
    th.set_obj(dst, p)
}

pub fn classmethods(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cl = class_arg(th, ap)?;
    let d = th.vm.heap.lock().class_shape(cl).cl_methods;
    th.set_obj(dst, d)
}

pub fn classvariables(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cl = class_arg(th, ap)?;
    let d = th.vm.heap.lock().class_shape(cl).vars;
    th.set_obj(dst, d)
}

pub fn methods(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cl = class_arg(th, ap)?;
    let d = th.vm.heap.lock().class_shape(cl).inst_methods;
    th.set_obj(dst, d)
}

fn find_common(th: &mut Thread, dst: usize, ap: usize, dict: MethodDict) -> VmResult {
    let cl = class_arg(th, ap)?;
    let sel = {
        let r = str_arg(th, ap + 1)?;
        th.vm.heap.lock().str_bytes(r).to_vec()
    };
    let hash = str_cell_hash(th, ap + 1)?;
    let found = {
        let h = th.vm.heap.lock();
        method_find_in(&h, Some(cl), dict, &sel, hash)
    };
    match found {
        Some(f) => th.set(dst, &f.method),
        None    => th.set_nil(dst),
    }
}

pub fn method(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    find_common(th, dst, ap, MethodDict::Instance)
}

pub fn classmethod(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    find_common(th, dst, ap, MethodDict::Class)
}

/// The class the current method resolved through, one frame up.
pub fn current(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let _ = ap;
    let cl = th.frames.class_up(1);
    th.set_obj(dst, cl)
}

/// Dotted namespace path plus the class name.
pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cl = class_arg(th, ap)?;
    let text = {
        let h = th.vm.heap.lock();
        let name = h
            .class_shape(cl)
            .name
            .map(|n| h.str_lossy(n))
            .unwrap_or_else(|| "?".into());
        let ns_path = h
            .class_shape(cl)
            .ns
            .map(|ns| crate::intrinsics::namespace::ns_path(&h, ns))
            .unwrap_or_default();
        if ns_path.is_empty() || ns_path == "main" {
            name
        } else {
            format!("{}.{}", ns_path, name)
        }
    };
    ret_str(th, dst, text.as_bytes())
}
