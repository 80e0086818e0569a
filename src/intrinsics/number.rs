/// Integer and Float class methods
///
/// Mixed-mode arithmetic promotes to float when either operand is a
/// float; comparisons follow the same rule.  A zero divisor raises an
/// invalid-value exception.

use crate::core::oop::{self, method_redirect};
use crate::core::value::{mem_hash, Value};
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::{int_arg, ret_str};
use crate::thread::Thread;

// ---------------------------------------------------------------------------
// Integer
// ---------------------------------------------------------------------------

pub fn int_new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_min(th, argc, 2)?;
    method_redirect(th, dst, "Integer", argc - 1, ap + 1)
}

pub fn int_copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    int_arg(th, ap)?;
    th.copy(dst, ap)
}

pub fn int_boolean(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let i = int_arg(th, ap)?;
    th.set_value(dst, Value::Bool(i != 0))
}

pub fn int_float(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let i = int_arg(th, ap)?;
    th.set_value(dst, Value::Float(i as f64))
}

/// Shared binary arithmetic: Int op Int stays integral, Int op Float
/// promotes.
fn int_arith(
    th: &mut Thread,
    dst: usize,
    ap: usize,
    fi: impl Fn(i64, i64) -> Option<i64>,
    ff: impl Fn(f64, f64) -> f64,
) -> VmResult {
    let i = int_arg(th, ap)?;
    match th.get(ap + 1)?.value {
        Value::Int(j) => match fi(i, j) {
            Some(v) => th.set_value(dst, Value::Int(v)),
            None    => Err(except::inv_value(th, ap + 1)),
        },
        Value::Float(g) => th.set_value(dst, Value::Float(ff(i as f64, g))),
        _ => Err(except::inv_value(th, ap + 1)),
    }
}

pub fn int_add(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    int_arith(th, dst, ap, |a, b| Some(a.wrapping_add(b)), |a, b| a + b)
}

pub fn int_sub(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    int_arith(th, dst, ap, |a, b| Some(a.wrapping_sub(b)), |a, b| a - b)
}

pub fn int_mul(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    int_arith(th, dst, ap, |a, b| Some(a.wrapping_mul(b)), |a, b| a * b)
}

pub fn int_div(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    int_arith(th, dst, ap, |a, b| a.checked_div(b), |a, b| a / b)
}

pub fn int_mod(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let a = int_arg(th, ap)?;
    let b = int_arg(th, ap + 1)?;
    match a.checked_rem(b) {
        Some(v) => th.set_value(dst, Value::Int(v)),
        None    => Err(except::inv_value(th, ap + 1)),
    }
}

pub fn int_minus(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let i = int_arg(th, ap)?;
    th.set_value(dst, Value::Int(i.wrapping_neg()))
}

pub fn int_band(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let v = int_arg(th, ap)? & int_arg(th, ap + 1)?;
    th.set_value(dst, Value::Int(v))
}

pub fn int_bor(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let v = int_arg(th, ap)? | int_arg(th, ap + 1)?;
    th.set_value(dst, Value::Int(v))
}

/// Three-way comparison against an integer or float argument.
fn cmp3(th: &mut Thread, ap: usize) -> VmResult<i64> {
    let i = int_arg(th, ap)?;
    match th.get(ap + 1)?.value {
        Value::Int(j)   => Ok((i > j) as i64 - (i < j) as i64),
        Value::Float(g) => {
            let f = i as f64;
            Ok((f > g) as i64 - (f < g) as i64)
        }
        _ => Err(except::inv_value(th, ap + 1)),
    }
}

pub fn int_cmp(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let c = cmp3(th, ap)?;
    th.set_value(dst, Value::Int(c))
}

pub fn int_lt(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let c = cmp3(th, ap)?;
    th.set_value(dst, Value::Bool(c < 0))
}

pub fn int_le(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let c = cmp3(th, ap)?;
    th.set_value(dst, Value::Bool(c <= 0))
}

pub fn int_gt(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let c = cmp3(th, ap)?;
    th.set_value(dst, Value::Bool(c > 0))
}

pub fn int_ge(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let c = cmp3(th, ap)?;
    th.set_value(dst, Value::Bool(c >= 0))
}

pub fn int_equal(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let i = int_arg(th, ap)?;
    let eq = matches!(th.get(ap + 1)?.value, Value::Int(j) if j == i);
    th.set_value(dst, Value::Bool(eq))
}

pub fn int_hash(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let cached = th.get(ap)?.hash;
    let hv = match cached {
        Some(hv) => hv,
        None => {
            let i = int_arg(th, ap)?;
            let hv = mem_hash(&i.to_le_bytes());
            th.vm.heap.lock().stack_set_hash(th.tid, ap, hv);
            hv
        }
    };
    th.set_value(dst, Value::Int(hv as i64))
}

pub fn int_write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_range(th, argc, 1, 2)?;
    let val = int_arg(th, ap)?;
    if argc < 2 {
        return ret_str(th, dst, val.to_string().as_bytes());
    }
    let base = int_arg(th, ap + 1)?;
    if !(2..=16).contains(&base) {
        return Err(except::inv_value(th, ap + 1));
    }
    let mut digits = Vec::new();
    let mut v = val;
    if v == 0 {
        digits.push(b'0');
    }
    while v != 0 {
        digits.push(b"0123456789ABCDEF"[(v % base).unsigned_abs() as usize]);
        v /= base;
    }
    digits.reverse();
    ret_str(th, dst, &digits)
}

// ---------------------------------------------------------------------------
// Float
// ---------------------------------------------------------------------------

fn float_recvr(th: &mut Thread, ap: usize) -> VmResult<f64> {
    match th.get(ap)?.value {
        Value::Float(f) => Ok(f),
        _ => Err(except::inv_value(th, ap)),
    }
}

fn float_operand(th: &mut Thread, idx: usize) -> VmResult<f64> {
    match th.get(idx)?.value {
        Value::Int(i)   => Ok(i as f64),
        Value::Float(f) => Ok(f),
        _ => Err(except::inv_value(th, idx)),
    }
}

pub fn float_sub(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let v = float_recvr(th, ap)? - float_operand(th, ap + 1)?;
    th.set_value(dst, Value::Float(v))
}

pub fn float_div(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let v = float_recvr(th, ap)? / float_operand(th, ap + 1)?;
    th.set_value(dst, Value::Float(v))
}

pub fn float_write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let f = float_recvr(th, ap)?;
    ret_str(th, dst, format!("{}", f).as_bytes())
}
