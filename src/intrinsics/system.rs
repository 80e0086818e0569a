/// System class methods

use crate::core::oop::{self, call_by_selector};
use crate::core::value::Value;
use crate::errors::{Fatal, VmResult};
use crate::intrinsics::int_arg;
use crate::thread::Thread;

pub fn exit(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let _ = dst;
    let code = int_arg(th, ap)?;
    std::process::exit(code as i32)
}

/// Write the message to the error stream and terminate.
pub fn abort(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    let _ = dst;
    if argc >= 2 {
        let msg = {
            let h = th.vm.heap.lock();
            match h.stack_cell(th.tid, ap + 1).ok().and_then(|c| c.as_obj()) {
                Some(r) if matches!(h.shape(r), crate::gc::Shape::Str(_)) => h.str_lossy(r),
                _ => String::new(),
            }
        };
        eprint!("{}", msg);
    }
    Err(th.fatal(Fatal::Aborted, None))
}

/// `assert(flag, message)`: abort with the message when the flag is
/// false.
pub fn assert(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let flag = match th.get(ap + 1)?.value {
        Value::Bool(b) => b,
        _ => return Err(crate::except::inv_value(th, ap + 1)),
    };
    if !flag {
        let mark = th.sp();
        let w = th.alloc(1)?;
        let recvr = th.get(ap)?;
        th.push(&recvr)?;
        let msg = th.get(ap + 2)?;
        th.push(&msg)?;
        call_by_selector(th, w, "abort", 2)?;
        th.unwind(mark)?;
    }
    th.copy(dst, ap + 1)
}

/// Debug hook: force a collection.
pub fn collect(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    let _ = (dst, argc, ap);
    th.vm.heap.lock().collect();
    Ok(())
}
