/// Exception class methods

use crate::core::oop::{self, class_of_resolved};
use crate::core::value::Builtin;
use crate::errors::VmResult;
use crate::except;
use crate::intrinsics::str_arg;
use crate::thread::Thread;

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let typ = {
        let r = str_arg(th, ap + 1)?;
        th.vm.heap.lock().str_lossy(r)
    };
    except::except_new(th, dst, &typ)?;
    Ok(())
}

/// Raise the receiver; it must be an Exception instance.  The exception's
/// method field names the caller, not this raise method.
pub fn raise(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let _ = dst;
    let is_exception = {
        let c = th.get(ap)?;
        let h = th.vm.heap.lock();
        class_of_resolved(&h, &c.value) == h.builtin(Builtin::Exception)
    };
    if !is_exception {
        return Err(except::inv_value(th, ap));
    }
    Err(except::raise_from_caller(th, ap))
}

pub fn reraise(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let _ = (dst, ap);
    Err(except::reraise(th))
}
