/// Frame stack
///
/// Three frame kinds on one explicit stack: namespace frames scope
/// environment lookup, method-call frames carry the dispatch state, and
/// exception frames are catch points.  Frames never hold counted
/// references; everything they point at stays reachable through the value
/// stack, the constants table or the namespace tree.
///
/// The stack is byte-budgeted against the configured frame-stack size, so
/// runaway recursion dies with a frame-stack overflow rather than eating
/// the host.

use std::sync::Arc;

use crate::core::value::{Cell, CodeBlob, ObjRef};
use crate::errors::Fatal;

/// Byte-code cursor: a blob plus an offset into it.
#[derive(Clone, Debug)]
pub struct Pc {
    pub blob: Arc<CodeBlob>,
    pub off: usize,
}

impl Pc {
    pub fn symbol(&self) -> String {
        format!("{}+{:#x}", self.blob.name, self.off)
    }
}

#[derive(Debug)]
pub struct NsFrame {
    pub ns: ObjRef,
    pub prev: Option<usize>,
}

#[derive(Debug)]
pub struct CallFrame {
    /// Class the dispatch resolved through; None for bare method calls.
    pub cl: Option<ObjRef>,
    pub method: Cell,
    /// Destination slot in the caller's value stack.
    pub dst: usize,
    /// Value-stack height at entry; everything above is released on pop.
    pub bp: usize,
    pub argc: usize,
    /// Stack index of the first argument (the receiver).
    pub ap: usize,
    pub prev: Option<usize>,
}

#[derive(Debug)]
pub struct ExceptFrame {
    /// Destination slot for the caught exception.
    pub dst: usize,
    pub valid: bool,
    /// Value-stack height to restore on catch.
    pub sp: usize,
    /// Byte-code cursor to resume at, for catch frames pushed by the
    /// interpreter.
    pub pc: Option<Pc>,
    pub prev: Option<usize>,
}

#[derive(Debug)]
pub enum Frame {
    Ns(NsFrame),
    Call(CallFrame),
    Except(ExceptFrame),
}

pub struct FrameStack {
    frames: Vec<Frame>,
    bytes: usize,
    limit_bytes: usize,
    pub cur_ns: Option<usize>,
    pub cur_mc: Option<usize>,
    pub cur_x: Option<usize>,
}

const FRAME_BYTES: usize = std::mem::size_of::<Frame>();

impl FrameStack {
    pub fn new(limit_bytes: usize) -> FrameStack {
        FrameStack {
            frames: Vec::new(),
            bytes: 0,
            limit_bytes,
            cur_ns: None,
            cur_mc: None,
            cur_x: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, i: usize) -> &Frame {
        &self.frames[i]
    }

    fn charge(&mut self) -> Result<(), Fatal> {
        if self.bytes + FRAME_BYTES > self.limit_bytes {
            return Err(Fatal::FrameStackOverflow);
        }
        self.bytes += FRAME_BYTES;
        Ok(())
    }

    pub fn push_ns(&mut self, ns: ObjRef) -> Result<usize, Fatal> {
        self.charge()?;
        self.frames.push(Frame::Ns(NsFrame { ns, prev: self.cur_ns }));
        self.cur_ns = Some(self.frames.len() - 1);
        Ok(self.frames.len() - 1)
    }

    pub fn push_call(
        &mut self,
        cl: Option<ObjRef>,
        method: Cell,
        dst: usize,
        bp: usize,
        argc: usize,
        ap: usize,
    ) -> Result<usize, Fatal> {
        self.charge()?;
        self.frames.push(Frame::Call(CallFrame {
            cl,
            method,
            dst,
            bp,
            argc,
            ap,
            prev: self.cur_mc,
        }));
        self.cur_mc = Some(self.frames.len() - 1);
        Ok(self.frames.len() - 1)
    }

    pub fn push_except(&mut self, dst: usize, sp: usize, pc: Option<Pc>) -> Result<usize, Fatal> {
        self.charge()?;
        self.frames.push(Frame::Except(ExceptFrame {
            dst,
            valid: false,
            sp,
            pc,
            prev: self.cur_x,
        }));
        self.cur_x = Some(self.frames.len() - 1);
        Ok(self.frames.len() - 1)
    }

    /// Pop the top frame and restore the chain head it shadowed.  The
    /// caller releases whatever value-stack region the frame pinned.
    pub fn pop(&mut self) -> Result<Frame, Fatal> {
        let f = self.frames.pop().ok_or(Fatal::FrameStackUnderflow)?;
        self.bytes -= FRAME_BYTES;
        match &f {
            Frame::Ns(fr)     => self.cur_ns = fr.prev,
            Frame::Call(fr)   => self.cur_mc = fr.prev,
            Frame::Except(fr) => self.cur_x = fr.prev,
        }
        Ok(f)
    }

    // -- chain accessors ----------------------------------------------------

    pub fn call_at(&self, i: usize) -> &CallFrame {
        match &self.frames[i] {
            Frame::Call(fr) => fr,
            _ => panic!("not a call frame"),
        }
    }

    pub fn except_at(&self, i: usize) -> &ExceptFrame {
        match &self.frames[i] {
            Frame::Except(fr) => fr,
            _ => panic!("not an exception frame"),
        }
    }

    pub fn except_at_mut(&mut self, i: usize) -> &mut ExceptFrame {
        match &mut self.frames[i] {
            Frame::Except(fr) => fr,
            _ => panic!("not an exception frame"),
        }
    }

    pub fn cur_call(&self) -> Result<&CallFrame, Fatal> {
        self.cur_mc.map(|i| self.call_at(i)).ok_or(Fatal::NoFrame)
    }

    /// Namespace `n` levels up the namespace-frame chain.
    pub fn ns_up(&self, mut n: usize) -> Result<ObjRef, Fatal> {
        let mut cur = self.cur_ns;
        while let Some(i) = cur {
            let fr = match &self.frames[i] {
                Frame::Ns(fr) => fr,
                _ => unreachable!(),
            };
            if n == 0 {
                return Ok(fr.ns);
            }
            n -= 1;
            cur = fr.prev;
        }
        Err(Fatal::NoFrame)
    }

    /// Dispatching class `n` levels up the call-frame chain, skipping
    /// frames with no class.
    pub fn class_up(&self, mut n: usize) -> Option<ObjRef> {
        let mut cur = self.cur_mc;
        while let Some(i) = cur {
            let fr = self.call_at(i);
            if let Some(cl) = fr.cl {
                if n == 0 {
                    return Some(cl);
                }
                n -= 1;
            }
            cur = fr.prev;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_restore_on_pop() {
        let mut fs = FrameStack::new(4096);
        let a = fs.push_ns(ObjRef(1)).unwrap();
        fs.push_ns(ObjRef(2)).unwrap();
        assert_eq!(fs.ns_up(0).unwrap(), ObjRef(2));
        assert_eq!(fs.ns_up(1).unwrap(), ObjRef(1));
        fs.pop().unwrap();
        assert_eq!(fs.cur_ns, Some(a));
        assert_eq!(fs.ns_up(0).unwrap(), ObjRef(1));
    }

    #[test]
    fn overflow_is_detected() {
        let mut fs = FrameStack::new(FRAME_BYTES * 2);
        fs.push_ns(ObjRef(1)).unwrap();
        fs.push_ns(ObjRef(1)).unwrap();
        assert_eq!(fs.push_ns(ObjRef(1)).unwrap_err(), Fatal::FrameStackOverflow);
    }

    #[test]
    fn class_up_skips_bare_calls() {
        let mut fs = FrameStack::new(4096);
        fs.push_call(Some(ObjRef(7)), Cell::nil(), 0, 0, 0, 0).unwrap();
        fs.push_call(None, Cell::nil(), 0, 0, 0, 0).unwrap();
        fs.push_call(Some(ObjRef(9)), Cell::nil(), 0, 0, 0, 0).unwrap();
        assert_eq!(fs.class_up(0), Some(ObjRef(9)));
        assert_eq!(fs.class_up(1), Some(ObjRef(7)));
        assert_eq!(fs.class_up(2), None);
    }
}
