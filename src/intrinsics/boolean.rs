/// Boolean class methods

use crate::core::oop::{self, method_redirect};
use crate::core::value::Value;
use crate::errors::VmResult;
use crate::intrinsics::{bool_arg, ret_str};
use crate::thread::Thread;

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    method_redirect(th, dst, "Boolean", 1, ap + 1)
}

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    bool_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn integer(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let b = bool_arg(th, ap)?;
    th.set_value(dst, Value::Int(if b { 1 } else { 0 }))
}

pub fn and(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let v = bool_arg(th, ap)? && bool_arg(th, ap + 1)?;
    th.set_value(dst, Value::Bool(v))
}

pub fn or(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let v = bool_arg(th, ap)? || bool_arg(th, ap + 1)?;
    th.set_value(dst, Value::Bool(v))
}

pub fn xor(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let v = bool_arg(th, ap)? ^ bool_arg(th, ap + 1)?;
    th.set_value(dst, Value::Bool(v))
}

pub fn not(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let v = !bool_arg(th, ap)?;
    th.set_value(dst, Value::Bool(v))
}

pub fn equal(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let b = bool_arg(th, ap)?;
    let eq = matches!(th.get(ap + 1)?.value, Value::Bool(o) if o == b);
    th.set_value(dst, Value::Bool(eq))
}

pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let b = bool_arg(th, ap)?;
    ret_str(th, dst, if b { b"#true" } else { b"#false" })
}
