/// Built-in class methods
///
/// One module per class cluster; every entry is registered through the
/// static method table the bootstrap consumes.  Aliases (`String` for
/// `write`, `copydeep` for `copy` on immutable kinds) bind the same
/// function under a second selector.

pub mod array;
pub mod boolean;
pub mod bytearray;
pub mod dict;
pub mod environment;
pub mod exception;
pub mod file;
pub mod list;
pub mod metaclass;
pub mod namespace;
pub mod number;
pub mod object;
pub mod pair;
pub mod set;
pub mod slice;
pub mod string;
pub mod system;

use crate::core::oop::MethodDict;
use crate::core::value::{Builtin, Cell, CodeFn, ObjRef, Value};
use crate::errors::VmResult;
use crate::except;
use crate::thread::Thread;

pub struct MethodDef {
    pub cl: Builtin,
    pub dict: MethodDict,
    pub sel: &'static str,
    pub name: &'static str,
    pub f: CodeFn,
}

macro_rules! m {
    ($cl:ident, cl, $sel:literal, $f:expr) => {
        MethodDef {
            cl: Builtin::$cl,
            dict: MethodDict::Class,
            sel: $sel,
            name: concat!("main.", stringify!($cl), ".", $sel),
            f: $f,
        }
    };
    ($cl:ident, inst, $sel:literal, $f:expr) => {
        MethodDef {
            cl: Builtin::$cl,
            dict: MethodDict::Instance,
            sel: $sel,
            name: concat!("main.", stringify!($cl), ".", $sel),
            f: $f,
        }
    };
}

/// The built-in method table, in bootstrap installation order.
pub static METHOD_TABLE: &[MethodDef] = &[
    // Metaclass
    m!(Metaclass, cl, "new", metaclass::new),
    m!(Metaclass, cl, "name", metaclass::name),
    m!(Metaclass, cl, "parent", metaclass::parent),
    m!(Metaclass, cl, "classmethods", metaclass::classmethods),
    m!(Metaclass, cl, "classvariables", metaclass::classvariables),
    m!(Metaclass, cl, "methods", metaclass::methods),
    m!(Metaclass, cl, "current", metaclass::current),
    m!(Metaclass, cl, "equal", object::equal),
    m!(Metaclass, cl, "write", metaclass::write),
    m!(Metaclass, inst, "name", metaclass::name),
    m!(Metaclass, inst, "parent", metaclass::parent),
    m!(Metaclass, inst, "classmethods", metaclass::classmethods),
    m!(Metaclass, inst, "classvariables", metaclass::classvariables),
    m!(Metaclass, inst, "methods", metaclass::methods),
    m!(Metaclass, inst, "at", metaclass::at),
    m!(Metaclass, inst, "ate", metaclass::ate),
    m!(Metaclass, inst, "atput", metaclass::atput),
    m!(Metaclass, inst, "write", metaclass::write),
    m!(Metaclass, inst, "method", metaclass::method),
    m!(Metaclass, inst, "classmethod", metaclass::classmethod),
    // Object
    m!(Object, cl, "new", object::new),
    m!(Object, inst, "__init__", object::init),
    m!(Object, inst, "Boolean", object::boolean),
    m!(Object, inst, "List", object::list),
    m!(Object, inst, "String", object::write),
    m!(Object, inst, "copy", object::copy),
    m!(Object, inst, "copydeep", object::copydeep),
    m!(Object, inst, "at", object::at),
    m!(Object, inst, "ate", object::ate),
    m!(Object, inst, "atdefault", object::atdefault),
    m!(Object, inst, "atput", object::atput),
    m!(Object, inst, "cons", object::cons),
    m!(Object, inst, "enumerate", object::enumerate),
    m!(Object, inst, "equal", object::equal),
    m!(Object, inst, "isnil", object::isnil),
    m!(Object, inst, "instanceof", object::instanceof),
    m!(Object, inst, "method", object::method),
    m!(Object, inst, "reverse", object::reverse),
    m!(Object, inst, "size", object::size),
    m!(Object, inst, "print", object::print),
    m!(Object, inst, "println", object::println),
    m!(Object, inst, "write", object::write),
    // Boolean
    m!(Boolean, cl, "new", boolean::new),
    m!(Boolean, inst, "Boolean", boolean::copy),
    m!(Boolean, inst, "Integer", boolean::integer),
    m!(Boolean, inst, "String", boolean::write),
    m!(Boolean, inst, "copy", boolean::copy),
    m!(Boolean, inst, "copydeep", boolean::copy),
    m!(Boolean, inst, "and", boolean::and),
    m!(Boolean, inst, "equal", boolean::equal),
    m!(Boolean, inst, "not", boolean::not),
    m!(Boolean, inst, "or", boolean::or),
    m!(Boolean, inst, "write", boolean::write),
    m!(Boolean, inst, "xor", boolean::xor),
    // Integer
    m!(Integer, cl, "new", number::int_new),
    m!(Integer, inst, "Boolean", number::int_boolean),
    m!(Integer, inst, "Integer", number::int_copy),
    m!(Integer, inst, "Float", number::int_float),
    m!(Integer, inst, "String", number::int_write),
    m!(Integer, inst, "copy", number::int_copy),
    m!(Integer, inst, "copydeep", number::int_copy),
    m!(Integer, inst, "add", number::int_add),
    m!(Integer, inst, "band", number::int_band),
    m!(Integer, inst, "bor", number::int_bor),
    m!(Integer, inst, "cmp", number::int_cmp),
    m!(Integer, inst, "div", number::int_div),
    m!(Integer, inst, "equal", number::int_equal),
    m!(Integer, inst, "ge", number::int_ge),
    m!(Integer, inst, "gt", number::int_gt),
    m!(Integer, inst, "hash", number::int_hash),
    m!(Integer, inst, "le", number::int_le),
    m!(Integer, inst, "lt", number::int_lt),
    m!(Integer, inst, "minus", number::int_minus),
    m!(Integer, inst, "mod", number::int_mod),
    m!(Integer, inst, "mul", number::int_mul),
    m!(Integer, inst, "sub", number::int_sub),
    m!(Integer, inst, "write", number::int_write),
    // Float
    m!(Float, inst, "String", number::float_write),
    m!(Float, inst, "sub", number::float_sub),
    m!(Float, inst, "div", number::float_div),
    m!(Float, inst, "write", number::float_write),
    // Method
    m!(Method, inst, "call", object::method_call),
    m!(Method, inst, "calla", object::method_calla),
    m!(Method, inst, "write", object::method_write),
    // Codemethod
    m!(Codemethod, inst, "call", object::method_call),
    m!(Codemethod, inst, "calla", object::method_calla),
    m!(Codemethod, inst, "write", object::method_write),
    // String
    m!(String, cl, "new", string::new),
    m!(String, inst, "Boolean", string::boolean),
    m!(String, inst, "Integer", string::integer),
    m!(String, inst, "String", string::copy),
    m!(String, inst, "Array", string::array),
    m!(String, inst, "Carray", string::carray),
    m!(String, inst, "Bytearray", string::bytearray),
    m!(String, inst, "Cbytearray", string::cbytearray),
    m!(String, inst, "Slice", string::slice_of),
    m!(String, inst, "Cslice", string::slice_of),
    m!(String, inst, "copy", string::copy),
    m!(String, inst, "copydeep", string::copy),
    m!(String, inst, "add", string::concat),
    m!(String, inst, "at", string::at),
    m!(String, inst, "call", string::call),
    m!(String, inst, "cmp", string::cmp),
    m!(String, inst, "concat", string::concat),
    m!(String, inst, "equal", string::equal),
    m!(String, inst, "format", string::format),
    m!(String, inst, "hash", string::hash),
    m!(String, inst, "index", string::index),
    m!(String, inst, "join", string::join),
    m!(String, inst, "parse", string::parse),
    m!(String, inst, "rindex", string::rindex),
    m!(String, inst, "rjoin", string::rjoin),
    m!(String, inst, "size", string::size),
    m!(String, inst, "slice", string::slice),
    m!(String, inst, "split", string::split),
    m!(String, inst, "write", string::write),
    // Pair
    m!(Pair, cl, "new", pair::new),
    m!(Pair, inst, "String", pair::write),
    m!(Pair, inst, "Pair", pair::copy),
    m!(Pair, inst, "List", pair::list),
    m!(Pair, inst, "copy", pair::copy),
    m!(Pair, inst, "copydeep", pair::copydeep),
    m!(Pair, inst, "equal", pair::equal),
    m!(Pair, inst, "first", pair::first),
    m!(Pair, inst, "hash", pair::hash),
    m!(Pair, inst, "second", pair::second),
    m!(Pair, inst, "write", pair::write),
    // List
    m!(List, cl, "new", list::new),
    m!(List, inst, "Boolean", list::boolean),
    m!(List, inst, "String", list::write),
    m!(List, inst, "List", list::copy),
    m!(List, inst, "Array", list::array),
    m!(List, inst, "Carray", list::carray),
    m!(List, inst, "Set", list::set),
    m!(List, inst, "Cset", list::cset),
    m!(List, inst, "Dictionary", list::dictionary),
    m!(List, inst, "Cdictionary", list::cdictionary),
    m!(List, inst, "copy", list::copy),
    m!(List, inst, "copydeep", list::copydeep),
    m!(List, inst, "at", list::at),
    m!(List, inst, "car", list::car),
    m!(List, inst, "cdr", list::cdr),
    m!(List, inst, "concat", list::concat),
    m!(List, inst, "cons", list::cons),
    m!(List, inst, "equal", list::equal),
    m!(List, inst, "hash", list::hash),
    m!(List, inst, "map1", list::map1),
    m!(List, inst, "map", list::map),
    m!(List, inst, "reduce1", list::reduce1),
    m!(List, inst, "reduce", list::reduce),
    m!(List, inst, "reverse", list::reverse),
    m!(List, inst, "size", list::size),
    m!(List, inst, "slice", list::slice),
    m!(List, inst, "write", list::write),
    // Array
    m!(Array, cl, "new", array::new),
    m!(Array, inst, "Boolean", array::boolean),
    m!(Array, inst, "Integer", array::size),
    m!(Array, inst, "String", array::write),
    m!(Array, inst, "List", array::list),
    m!(Array, inst, "Array", array::to_array),
    m!(Array, inst, "Carray", array::to_carray),
    m!(Array, inst, "Slice", array::slice_of),
    m!(Array, inst, "Cslice", array::cslice_of),
    m!(Array, inst, "copy", array::copy),
    m!(Array, inst, "copydeep", array::copydeep),
    m!(Array, inst, "at", array::at),
    m!(Array, inst, "atput", array::atput),
    m!(Array, inst, "equal", array::equal),
    m!(Array, inst, "size", array::size),
    m!(Array, inst, "slice", array::slice),
    m!(Array, inst, "write", array::write),
    // Carray
    m!(Carray, cl, "new", array::carray_new),
    m!(Carray, inst, "String", array::carray_write),
    m!(Carray, inst, "Array", array::carray_to_array),
    m!(Carray, inst, "Carray", array::carray_copy),
    m!(Carray, inst, "copy", array::carray_copy),
    m!(Carray, inst, "hash", array::carray_hash),
    m!(Carray, inst, "write", array::carray_write),
    // Bytearray
    m!(Bytearray, cl, "new", bytearray::new),
    m!(Bytearray, inst, "Boolean", bytearray::boolean),
    m!(Bytearray, inst, "Integer", bytearray::size),
    m!(Bytearray, inst, "String", bytearray::string),
    m!(Bytearray, inst, "List", bytearray::list),
    m!(Bytearray, inst, "Array", bytearray::array),
    m!(Bytearray, inst, "Carray", bytearray::carray),
    m!(Bytearray, inst, "Slice", bytearray::slice_of),
    m!(Bytearray, inst, "Cslice", bytearray::cslice_of),
    m!(Bytearray, inst, "copy", bytearray::copy),
    m!(Bytearray, inst, "copydeep", bytearray::copy),
    m!(Bytearray, inst, "at", bytearray::at),
    m!(Bytearray, inst, "atput", bytearray::atput),
    m!(Bytearray, inst, "cmp", bytearray::cmp),
    m!(Bytearray, inst, "equal", bytearray::equal),
    m!(Bytearray, inst, "size", bytearray::size),
    m!(Bytearray, inst, "slice", bytearray::slice),
    m!(Bytearray, inst, "write", bytearray::write),
    // Cbytearray
    m!(Cbytearray, cl, "new", bytearray::cbarray_new),
    m!(Cbytearray, inst, "String", bytearray::cbarray_write),
    m!(Cbytearray, inst, "copy", bytearray::cbarray_copy),
    m!(Cbytearray, inst, "copydeep", bytearray::cbarray_copy),
    m!(Cbytearray, inst, "write", bytearray::cbarray_write),
    // Slice
    m!(Slice, cl, "new", slice::new),
    m!(Slice, inst, "String", slice::write),
    m!(Slice, inst, "List", slice::list),
    m!(Slice, inst, "Array", slice::array),
    m!(Slice, inst, "Slice", slice::slice_of),
    m!(Slice, inst, "at", slice::at),
    m!(Slice, inst, "atput", slice::atput),
    m!(Slice, inst, "hash", slice::hash),
    m!(Slice, inst, "size", slice::size),
    m!(Slice, inst, "slice", slice::slice),
    m!(Slice, inst, "write", slice::write),
    // Cslice
    m!(Cslice, cl, "new", slice::cslice_new),
    m!(Cslice, inst, "String", slice::cslice_write),
    m!(Cslice, inst, "Cslice", slice::cslice_of),
    m!(Cslice, inst, "write", slice::cslice_write),
    // Set
    m!(Set, cl, "new", set::new),
    m!(Set, inst, "Boolean", set::boolean),
    m!(Set, inst, "Integer", set::size),
    m!(Set, inst, "String", set::write),
    m!(Set, inst, "List", set::list),
    m!(Set, inst, "Array", set::array),
    m!(Set, inst, "Carray", set::carray),
    m!(Set, inst, "Set", set::to_set),
    m!(Set, inst, "Cset", set::to_cset),
    m!(Set, inst, "copy", set::copy),
    m!(Set, inst, "copydeep", set::copydeep),
    m!(Set, inst, "at", set::at),
    m!(Set, inst, "del", set::del),
    m!(Set, inst, "delall", set::delall),
    m!(Set, inst, "put", set::put),
    m!(Set, inst, "size", set::size),
    m!(Set, inst, "tablesize", set::tablesize),
    m!(Set, inst, "write", set::write),
    // Cset
    m!(Cset, cl, "new", set::cset_new),
    m!(Cset, inst, "String", set::cset_write),
    m!(Cset, inst, "Set", set::cset_to_set),
    m!(Cset, inst, "Cset", set::cset_copy),
    m!(Cset, inst, "copy", set::cset_copy),
    m!(Cset, inst, "write", set::cset_write),
    // Dictionary
    m!(Dictionary, cl, "new", dict::new),
    m!(Dictionary, inst, "Boolean", dict::boolean),
    m!(Dictionary, inst, "Integer", dict::size),
    m!(Dictionary, inst, "String", dict::write),
    m!(Dictionary, inst, "List", dict::list),
    m!(Dictionary, inst, "Array", dict::array),
    m!(Dictionary, inst, "Carray", dict::carray),
    m!(Dictionary, inst, "Dictionary", dict::to_dict),
    m!(Dictionary, inst, "Cdictionary", dict::to_cdict),
    m!(Dictionary, inst, "copy", dict::copy),
    m!(Dictionary, inst, "copydeep", dict::copydeep),
    m!(Dictionary, inst, "at", dict::at),
    m!(Dictionary, inst, "ate", dict::ate),
    m!(Dictionary, inst, "atdefault", dict::atdefault),
    m!(Dictionary, inst, "atput", dict::atput),
    m!(Dictionary, inst, "atputnew", dict::atputnew),
    m!(Dictionary, inst, "del", dict::del),
    m!(Dictionary, inst, "delall", dict::delall),
    m!(Dictionary, inst, "put", dict::put),
    m!(Dictionary, inst, "size", dict::size),
    m!(Dictionary, inst, "tablesize", dict::tablesize),
    m!(Dictionary, inst, "write", dict::write),
    // Cdictionary
    m!(Cdictionary, cl, "new", dict::cdict_new),
    m!(Cdictionary, inst, "copy", dict::cdict_copy),
    m!(Cdictionary, inst, "copydeep", dict::cdict_copydeep),
    m!(Cdictionary, inst, "write", dict::cdict_write),
    // Namespace
    m!(Namespace, cl, "new", namespace::new),
    m!(Namespace, cl, "current", namespace::current),
    m!(Namespace, inst, "String", namespace::write),
    m!(Namespace, inst, "Dictionary", namespace::dictionary),
    m!(Namespace, inst, "at", namespace::at),
    m!(Namespace, inst, "ate", namespace::ate),
    m!(Namespace, inst, "atput", namespace::atput),
    m!(Namespace, inst, "name", namespace::name),
    m!(Namespace, inst, "parent", namespace::parent),
    m!(Namespace, inst, "write", namespace::write),
    // Module
    m!(Module, cl, "new", crate::module_loader::module_new),
    m!(Module, cl, "current", crate::module_loader::module_current),
    m!(Module, inst, "filename", crate::module_loader::module_filename),
    m!(Module, inst, "sha1", crate::module_loader::module_sha1),
    // File
    m!(File, cl, "new", file::new),
    m!(File, inst, "Boolean", file::eof),
    m!(File, inst, "Integer", file::tell),
    m!(File, inst, "copy", file::copy),
    m!(File, inst, "copydeep", file::copy),
    m!(File, inst, "eof", file::eof),
    m!(File, inst, "filename", file::filename),
    m!(File, inst, "flush", file::flush),
    m!(File, inst, "mode", file::mode),
    m!(File, inst, "read", file::read),
    m!(File, inst, "readb", file::readb),
    m!(File, inst, "readln", file::readln),
    m!(File, inst, "tell", file::tell),
    m!(File, inst, "unread", file::unread),
    m!(File, inst, "write", file::write),
    m!(File, inst, "writeln", file::writeln),
    // Environment
    m!(Environment, cl, "at", environment::at),
    m!(Environment, cl, "ate", environment::ate),
    m!(Environment, cl, "atput", environment::atput),
    // Exception
    m!(Exception, cl, "new", exception::new),
    m!(Exception, cl, "reraise", exception::reraise),
    m!(Exception, inst, "raise", exception::raise),
    // System
    m!(System, cl, "exit", system::exit),
    m!(System, cl, "abort", system::abort),
    m!(System, cl, "assert", system::assert),
    m!(System, cl, "collect", system::collect),
];

// ---------------------------------------------------------------------------
// Shared argument accessors
// ---------------------------------------------------------------------------

/// Slice normalization shared by every indexable kind: a negative offset
/// wraps from the end; a negative length means "length items ending at
/// offset".  The resulting range must lie within `size`.
pub fn slice_norm(mut ofs: i64, mut len: i64, size: i64) -> Option<(usize, usize)> {
    if ofs < 0 {
        ofs += size;
    }
    if len < 0 {
        ofs += len;
        len = -len;
    }
    if ofs < 0 || ofs + len > size {
        return None;
    }
    Some((ofs as usize, len as usize))
}

/// Single-index form of the normalization.
pub fn index_norm(ofs: i64, size: i64) -> Option<usize> {
    slice_norm(ofs, 1, size).map(|(o, _)| o)
}

pub fn int_arg(th: &mut Thread, idx: usize) -> VmResult<i64> {
    match th.get(idx)?.value {
        Value::Int(i) => Ok(i),
        _ => Err(except::inv_value(th, idx)),
    }
}

pub fn bool_arg(th: &mut Thread, idx: usize) -> VmResult<bool> {
    match th.get(idx)?.value {
        Value::Bool(b) => Ok(b),
        _ => Err(except::inv_value(th, idx)),
    }
}

pub fn float_arg(th: &mut Thread, idx: usize) -> VmResult<f64> {
    match th.get(idx)?.value {
        Value::Float(f) => Ok(f),
        _ => Err(except::inv_value(th, idx)),
    }
}

/// Object of the exact raw class.
fn obj_of_class(th: &mut Thread, idx: usize, b: Builtin) -> VmResult<ObjRef> {
    let r = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, idx).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.class_of_raw(r) == h.builtin(b) => Some(r),
            _ => None,
        }
    };
    match r {
        Some(r) => Ok(r),
        None    => Err(except::inv_value(th, idx)),
    }
}

/// Object whose raw class is `b` or below it.
fn obj_of_kind(th: &mut Thread, idx: usize, b: Builtin) -> VmResult<ObjRef> {
    let r = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, idx).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.is_subclass_of(h.class_of_raw(r), h.builtin(b)) => Some(r),
            _ => None,
        }
    };
    match r {
        Some(r) => Ok(r),
        None    => Err(except::inv_value(th, idx)),
    }
}

pub fn str_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_class(th, idx, Builtin::String)
}

pub fn str_arg_bytes(th: &mut Thread, idx: usize) -> VmResult<Vec<u8>> {
    let r = str_arg(th, idx)?;
    Ok(th.vm.heap.lock().str_bytes(r).to_vec())
}

/// List argument; nil is the empty list.
pub fn list_arg(th: &mut Thread, idx: usize) -> VmResult<Option<ObjRef>> {
    let r = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, idx).ok().map(|c| c.value.clone()) {
            Some(Value::Obj(None)) => Ok(None),
            Some(Value::Obj(Some(r))) if h.class_of_raw(r) == h.builtin(Builtin::List) => {
                Ok(Some(r))
            }
            _ => Err(()),
        }
    };
    match r {
        Ok(v)  => Ok(v),
        Err(()) => Err(except::inv_value(th, idx)),
    }
}

pub fn array_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_kind(th, idx, Builtin::Array)
}

pub fn barray_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_kind(th, idx, Builtin::Bytearray)
}

pub fn slice_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_kind(th, idx, Builtin::Slice)
}

pub fn set_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_kind(th, idx, Builtin::Set)
}

pub fn dict_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_kind(th, idx, Builtin::Dictionary)
}

pub fn ns_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_kind(th, idx, Builtin::Namespace)
}

pub fn module_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_class(th, idx, Builtin::Module)
}

pub fn file_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_class(th, idx, Builtin::File)
}

pub fn pair_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_class(th, idx, Builtin::Pair)
}

/// A class object (an instance of the metaclass).
pub fn class_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    let r = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, idx).ok().and_then(|c| c.as_obj()) {
            Some(r) if h.is_class(r) => Some(r),
            _ => None,
        }
    };
    match r {
        Some(r) => Ok(r),
        None    => Err(except::inv_value(th, idx)),
    }
}

/// A user instance (dictionary-shaped, of the user-instance class).
pub fn user_arg(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    obj_of_class(th, idx, Builtin::User)
}

/// Raw class of the cell at `idx`.
pub fn raw_class_of(th: &mut Thread, idx: usize) -> VmResult<ObjRef> {
    let c = th.get(idx)?;
    Ok(th.vm.heap.lock().class_of_value_raw(&c.value))
}

/// Call `write` on the cell at `idx` and return the resulting text.
pub fn write_of(th: &mut Thread, idx: usize) -> VmResult<String> {
    let mark = th.sp();
    let w = th.alloc(1)?;
    let c = th.get(idx)?;
    th.push(&c)?;
    crate::core::oop::call_by_selector(th, w, "write", 1)?;
    let s = {
        let h = th.vm.heap.lock();
        match h.stack_cell(th.tid, w).ok().and_then(|c| c.as_obj()) {
            Some(r) => h.str_lossy(r),
            None    => "#nil".to_string(),
        }
    };
    th.unwind(mark)?;
    Ok(s)
}

/// Store a string result.
pub fn ret_str(th: &mut Thread, dst: usize, s: &[u8]) -> VmResult {
    th.str_new(dst, s)?;
    Ok(())
}

/// Store the receiver itself.
pub fn ret_recvr(th: &mut Thread, dst: usize, ap: usize) -> VmResult {
    th.copy(dst, ap)
}

pub fn ret_cell(th: &mut Thread, dst: usize, c: &Cell) -> VmResult {
    th.set(dst, c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_normalization_rules() {
        // For "abcdef" (size 6): (-2, 2) is "ef", (5, -3) and (-1, -3)
        // are both "cde".
        assert_eq!(slice_norm(-2, 2, 6), Some((4, 2)));
        assert_eq!(slice_norm(5, -3, 6), Some((2, 3)));
        assert_eq!(slice_norm(-1, -3, 6), Some((2, 3)));
        assert_eq!(slice_norm(0, 6, 6), Some((0, 6)));
        assert_eq!(slice_norm(0, 7, 6), None);
        assert_eq!(slice_norm(-7, 1, 6), None);
        assert_eq!(slice_norm(6, 0, 6), Some((6, 0)));
    }

    #[test]
    fn index_normalization() {
        assert_eq!(index_norm(-1, 6), Some(5));
        assert_eq!(index_norm(0, 6), Some(0));
        assert_eq!(index_norm(6, 6), None);
    }

    #[test]
    fn method_table_is_well_formed() {
        for def in METHOD_TABLE {
            assert!(!def.sel.is_empty());
            assert!(def.name.starts_with("main."));
        }
    }
}
