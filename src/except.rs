/// Exception machinery
///
/// A raise finds the innermost catch frame, binds the exception object
/// into the frame's destination cell, unwinds every frame above it along
/// with the value stack, restores the byte-code cursor, and hands an
/// `Unwind` up the Rust call stack.  The activation that pushed the catch
/// frame (the interpreter loop, or a native `with_catch`) recognizes its
/// own frame index and resumes; everything in between just propagates.
///
/// With no catch frame the exception's written form goes to stderr and
/// the thread terminates; a second raise before the first is caught is a
/// double exception and fatal.

use crate::core::oop::{call_by_selector, user_new};
use crate::core::value::{mem_hash, Builtin, Cell, ObjRef};
use crate::errors::{Fatal, Unwind, VmResult};
use crate::thread::Thread;

// ---------------------------------------------------------------------------
// Exception object construction
// ---------------------------------------------------------------------------

/// New exception instance with its `type` field set to the dotted
/// taxonomy name.
pub fn except_new(th: &mut Thread, dst: usize, typ: &str) -> VmResult<ObjRef> {
    let cl = th.vm.heap.lock().builtin(Builtin::Exception);
    let x = user_new(th, dst, cl)?;
    put_field_str(th, x, "type", typ.as_bytes())?;
    Ok(x)
}

fn put_field(th: &mut Thread, x: ObjRef, key: &str, val: &Cell) {
    let mut h = th.vm.heap.lock();
    let _ = h.dict_puts(x, key.as_bytes(), mem_hash(key.as_bytes()), val);
}

fn put_field_idx(th: &mut Thread, x: ObjRef, key: &str, idx: usize) -> VmResult {
    let val = th.get(idx)?;
    put_field(th, x, key, &val);
    Ok(())
}

fn put_field_int(th: &mut Thread, x: ObjRef, key: &str, i: i64) {
    put_field(th, x, key, &Cell::int(i));
}

fn put_field_str(th: &mut Thread, x: ObjRef, key: &str, s: &[u8]) -> VmResult {
    let mark = th.sp();
    let w = th.alloc(1)?;
    th.str_new(w, s)?;
    let c = th.get(w)?;
    put_field(th, x, key, &c);
    th.unwind(mark)
}

fn put_field_obj(th: &mut Thread, x: ObjRef, key: &str, o: ObjRef) {
    put_field(th, x, key, &Cell::obj(o));
}

// ---------------------------------------------------------------------------
// Raise plumbing
// ---------------------------------------------------------------------------

/// The double-exception guard: a second raise before the first is caught
/// terminates the thread.
fn raise_enter(th: &mut Thread) -> VmResult {
    th.except_lvl += 1;
    if th.except_lvl > 1 {
        return Err(th.fatal(Fatal::DoubleException, None));
    }
    Ok(())
}

fn cur_method(th: &Thread) -> Cell {
    th.frames.cur_call().map(|f| f.method.clone()).unwrap_or_default()
}

/// No catch frame: print the exception's written form and terminate.
fn uncaught(th: &mut Thread, x_idx: usize) -> Unwind {
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let text = (|| -> VmResult<String> {
        let w = th.alloc(1)?;
        let x = th.get(x_idx)?;
        th.push(&x)?;
        call_by_selector(th, w, "write", 1)?;
        let h = th.vm.heap.lock();
        let s = match h.stack_cell(th.tid, w).ok().and_then(|c| c.as_obj()) {
            Some(r) => h.str_lossy(r),
            None    => "#nil".into(),
        };
        Ok(s)
    })()
    .unwrap_or_else(|_| "?".into());
    eprintln!("\nException: {}", text);
    th.fatal(Fatal::UncaughtException, None)
}

/// Transfer to a catch frame: bind the exception, unwind frames and
/// value stack, restore the byte-code cursor, set the pending flag.
fn transfer(th: &mut Thread, fx: usize, arg_idx: usize) -> Unwind {
    let dst = th.frames.except_at(fx).dst;
    let arg = match th.get(arg_idx) {
        Ok(c) => c,
        Err(u) => return u,
    };
    if let Err(u) = th.set(dst, &arg) {
        return u;
    }
    th.frames.except_at_mut(fx).valid = true;
    while th.frames.len() > fx + 1 {
        if let Err(u) = th.frame_pop1() {
            return u;
        }
    }
    let sp = th.frames.except_at(fx).sp;
    if let Err(u) = th.unwind(sp) {
        return u;
    }
    th.pc = th.frames.except_at(fx).pc.clone();
    th.exceptf = true;
    Unwind::Except { frame: fx }
}

fn deliver(th: &mut Thread, x_idx: usize, method: Cell) -> Unwind {
    if let Some(x) = th.get(x_idx).ok().and_then(|c| c.as_obj()) {
        if th.vm.heap.lock().is_set_shaped(x) {
            put_field(th, x, "method", &method);
        }
    }
    match th.frames.cur_x {
        None     => uncaught(th, x_idx),
        Some(fx) => transfer(th, fx, x_idx),
    }
}

/// Raise the exception held in a stack cell.
pub fn raise(th: &mut Thread, x_idx: usize) -> Unwind {
    if let Err(u) = raise_enter(th) {
        return u;
    }
    let m = cur_method(th);
    deliver(th, x_idx, m)
}

/// Raise attributing the exception to the calling method, used by the
/// Exception class's own raise method.
pub fn raise_from_caller(th: &mut Thread, x_idx: usize) -> Unwind {
    if let Err(u) = raise_enter(th) {
        return u;
    }
    let m = th
        .frames
        .cur_call()
        .ok()
        .and_then(|f| f.prev)
        .map(|i| th.frames.call_at(i).method.clone())
        .unwrap_or_default();
    deliver(th, x_idx, m)
}

/// Re-propagate the caught exception one catch frame up.
pub fn reraise(th: &mut Thread) -> Unwind {
    let fx = match th.frames.cur_x {
        Some(fx) if th.frames.except_at(fx).valid => fx,
        _ => return th.fatal(Fatal::NoFrame, None),
    };
    let arg_idx = th.frames.except_at(fx).dst;
    match th.frames.except_at(fx).prev {
        None       => uncaught(th, arg_idx),
        Some(prev) => transfer(th, prev, arg_idx),
    }
}

// ---------------------------------------------------------------------------
// Native catch frames
// ---------------------------------------------------------------------------

/// Outcome of a native catch region.
pub enum Caught<T> {
    Ok(T),
    /// The raised exception is bound in the destination cell.
    Except,
}

/// Run `f` under a catch frame whose destination is `dst`.  Delivers a
/// caught exception into `dst` and reports it; other unwinds propagate.
pub fn with_catch<T>(
    th: &mut Thread,
    dst: usize,
    f: impl FnOnce(&mut Thread) -> VmResult<T>,
) -> VmResult<Caught<T>> {
    let sp = th.sp();
    let fidx = {
        let r = th.frames.push_except(dst, sp, None);
        th.lift(r)?
    };
    match f(th) {
        Ok(v) => {
            th.frame_except_pop(1)?;
            Ok(Caught::Ok(v))
        }
        Err(Unwind::Except { frame }) if frame == fidx => {
            th.frame_except_pop(1)?;
            Ok(Caught::Except)
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

fn build(
    th: &mut Thread,
    typ: &str,
    fill: impl FnOnce(&mut Thread, ObjRef) -> VmResult,
) -> Unwind {
    let r = (|th: &mut Thread| -> VmResult<Unwind> {
        raise_enter(th)?;
        let w = th.alloc(1)?;
        let x = except_new(th, w, typ)?;
        fill(th, x)?;
        let m = cur_method(th);
        Ok(deliver(th, w, m))
    })(th);
    match r {
        Ok(u) | Err(u) => u,
    }
}

pub fn inv_value(th: &mut Thread, idx: usize) -> Unwind {
    build(th, "system.invalid-value", |th, x| put_field_idx(th, x, "value", idx))
}

pub fn no_method(th: &mut Thread, recvr_idx: usize, sel: &[u8]) -> Unwind {
    let sel = sel.to_vec();
    build(th, "system.no-method", move |th, x| {
        put_field_idx(th, x, "receiver", recvr_idx)?;
        put_field_str(th, x, "selector", &sel)
    })
}

pub fn no_variable(th: &mut Thread, name_idx: usize) -> Unwind {
    build(th, "system.no-variable", |th, x| put_field_idx(th, x, "name", name_idx))
}

pub fn num_args(th: &mut Thread, expected: usize) -> Unwind {
    let got = th.frames.cur_call().map(|f| f.argc).unwrap_or(0);
    build(th, "system.number-of-arguments", move |th, x| {
        put_field_int(th, x, "expected", expected as i64);
        put_field_int(th, x, "got", got as i64);
        Ok(())
    })
}

pub fn num_args_min(th: &mut Thread, min: usize) -> Unwind {
    let got = th.frames.cur_call().map(|f| f.argc).unwrap_or(0);
    build(th, "system.number-of-arguments", move |th, x| {
        put_field_int(th, x, "minimum", min as i64);
        put_field_int(th, x, "got", got as i64);
        Ok(())
    })
}

pub fn num_args_range(th: &mut Thread, min: usize, max: usize) -> Unwind {
    let got = th.frames.cur_call().map(|f| f.argc).unwrap_or(0);
    build(th, "system.number-of-arguments", move |th, x| {
        put_field_int(th, x, "minimum", min as i64);
        put_field_int(th, x, "maximum", max as i64);
        put_field_int(th, x, "got", got as i64);
        Ok(())
    })
}

pub fn no_attr(th: &mut Thread, inst_idx: usize, attr_idx: usize) -> Unwind {
    build(th, "system.no-attribute", |th, x| {
        put_field_idx(th, x, "instance", inst_idx)?;
        put_field_idx(th, x, "attribute", attr_idx)
    })
}

pub fn idx_range(th: &mut Thread, inst_idx: usize, idx_idx: usize) -> Unwind {
    build(th, "system.index-range", |th, x| {
        put_field_idx(th, x, "instance", inst_idx)?;
        put_field_idx(th, x, "index", idx_idx)
    })
}

pub fn idx_range2(th: &mut Thread, inst_idx: usize, idx_idx: usize, len_idx: usize) -> Unwind {
    build(th, "system.index-range", |th, x| {
        put_field_idx(th, x, "instance", inst_idx)?;
        put_field_idx(th, x, "index", idx_idx)?;
        put_field_idx(th, x, "length", len_idx)
    })
}

pub fn key_not_found(th: &mut Thread, inst_idx: usize, key_idx: usize) -> Unwind {
    build(th, "system.key-not-found", |th, x| {
        put_field_idx(th, x, "instance", inst_idx)?;
        put_field_idx(th, x, "key", key_idx)
    })
}

pub fn modify_const(th: &mut Thread, inst: ObjRef, key_idx: usize) -> Unwind {
    build(th, "system.modify-constant", |th, x| {
        put_field_obj(th, x, "instance", inst);
        put_field_idx(th, x, "key", key_idx)
    })
}

pub fn file_open(th: &mut Thread, filename_idx: usize, mode_idx: usize, msg: &str) -> Unwind {
    let errno = th.errno() as i64;
    let msg = msg.to_string();
    build(th, "system.file-open", move |th, x| {
        put_field_idx(th, x, "filename", filename_idx)?;
        put_field_idx(th, x, "mode", mode_idx)?;
        put_field_int(th, x, "errno", errno);
        put_field_str(th, x, "message", msg.as_bytes())
    })
}

pub fn module_load(th: &mut Thread, name_idx: usize, msg: &str) -> Unwind {
    let msg = msg.to_string();
    build(th, "system.module-load", move |th, x| {
        put_field_idx(th, x, "name", name_idx)?;
        put_field_str(th, x, "message", msg.as_bytes())
    })
}

pub fn descent_loop(th: &mut Thread) -> Unwind {
    build(th, "system.descent-loop", |_, _| Ok(()))
}
