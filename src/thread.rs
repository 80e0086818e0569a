/// Threads
///
/// Each thread owns a frame stack and a registered value stack; the value
/// stack is the thread's only GC root set, so every scratch cell a method
/// needs goes through the stack API here.  Heap access always goes through
/// the VM's object lock.
///
/// Fatal errors print a message and a one-line-per-frame backtrace; the
/// main thread exits the process, worker threads unwind out of their entry
/// point with the exit code.

use std::sync::Arc;

use crate::core::value::{Cell, ObjRef, Value};
use crate::errors::{Fatal, Unwind, VmResult};
use crate::frame::{FrameStack, Pc};
use crate::gc::LockTry;
use crate::runtime::Vm;

pub const DEFAULT_STACK_SIZE: usize = 8192;

pub struct Thread {
    pub(crate) vm: Arc<Vm>,
    pub(crate) tid: usize,
    pub(crate) is_main: bool,
    pub(crate) frames: FrameStack,
    pub(crate) pc: Option<Pc>,
    pub(crate) pc_instr_start: usize,
    pub(crate) except_lvl: u32,
    pub(crate) exceptf: bool,
    pub(crate) errno: i32,
    pub(crate) fatal_lvl: u32,
    /// Print each decoded instruction to stderr.
    pub trace: bool,
}

impl Thread {
    pub(crate) fn new(vm: Arc<Vm>, tid: usize, is_main: bool, frame_stack_size: usize) -> Thread {
        Thread {
            vm,
            tid,
            is_main,
            frames: FrameStack::new(frame_stack_size),
            pc: None,
            pc_instr_start: 0,
            except_lvl: 0,
            exceptf: false,
            errno: 0,
            fatal_lvl: 0,
            trace: false,
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Snapshot the OS error of the last failed call, for the errno field
    /// of file exceptions.
    pub fn errno_set(&mut self, err: &std::io::Error) -> i32 {
        self.errno = err.raw_os_error().unwrap_or(0);
        self.errno
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    /// One-shot exception flag; reading clears it.
    pub fn except_chk(&mut self) -> bool {
        std::mem::replace(&mut self.exceptf, false)
    }

    // -- fatal termination --------------------------------------------------

    pub(crate) fn fatal(&mut self, code: Fatal, msg: Option<String>) -> Unwind {
        use std::io::Write;
        let _ = std::io::stdout().flush();
        match &msg {
            Some(m) => eprintln!("Thread {} fatal: {} - {}", self.tid, code, m),
            None    => eprintln!("Thread {} fatal: {}", self.tid, code),
        }
        self.fatal_lvl += 1;
        if self.fatal_lvl == 1 {
            self.print_backtrace();
        }
        if self.is_main {
            std::process::exit(code.exit_code());
        }
        log::warn!("worker thread {} terminating: {}", self.tid, code);
        Unwind::Fatal(code)
    }

    /// Promote a stack-level failure into fatal thread termination.
    pub(crate) fn lift<T>(&mut self, r: Result<T, Fatal>) -> VmResult<T> {
        match r {
            Ok(v)  => Ok(v),
            Err(f) => Err(self.fatal(f, None)),
        }
    }

    /// One line per active call frame: the method's symbolic name and its
    /// written arguments.
    pub(crate) fn print_backtrace(&mut self) {
        eprintln!("Backtrace:");
        let mut chain = Vec::new();
        {
            let mut cur = self.frames.cur_mc;
            while let Some(i) = cur {
                let fr = self.frames.call_at(i);
                chain.push((fr.method.clone(), fr.argc, fr.ap));
                cur = fr.prev;
            }
        }
        for (lvl, (method, argc, ap)) in chain.into_iter().enumerate() {
            let mut line = format!("{:3}: {}.call(", lvl, method_symbol(&method));
            for n in 0..argc {
                if n > 0 {
                    line.push_str(", ");
                }
                line.push_str(&self.write_arg(ap + n));
            }
            line.push(')');
            eprintln!("{}", line);
        }
    }

    fn write_arg(&mut self, idx: usize) -> String {
        let attempt = (|| -> VmResult<String> {
            let w = self.alloc(1)?;
            let c = self.get(idx)?;
            self.push(&c)?;
            crate::core::oop::call_by_selector(self, w, "write", 1)?;
            let s = {
                let h = self.vm.heap.lock();
                match h.stack_cell(self.tid, w).ok().and_then(|c| c.as_obj()) {
                    Some(r) => h.str_lossy(r),
                    None    => "#nil".to_string(),
                }
            };
            self.unwind(w)?;
            Ok(s)
        })();
        attempt.unwrap_or_else(|_| "?".to_string())
    }

    // -- value stack --------------------------------------------------------

    pub fn sp(&self) -> usize {
        self.vm.heap.lock().stack_len(self.tid)
    }

    /// Allocate `n` nil scratch cells; returns the index of the first.
    pub fn alloc(&mut self, n: usize) -> VmResult<usize> {
        let r = self.vm.heap.lock().stack_alloc(self.tid, n);
        self.lift(r)
    }

    pub fn free(&mut self, n: usize) -> VmResult {
        let r = self.vm.heap.lock().stack_free(self.tid, n);
        self.lift(r)
    }

    /// Pop back to absolute height `to`.
    pub fn unwind(&mut self, to: usize) -> VmResult {
        let r = self.vm.heap.lock().stack_unwind(self.tid, to);
        self.lift(r)
    }

    /// Free `nf` cells then allocate `na`, as one bounds-checked step.
    pub fn free_alloc(&mut self, nf: usize, na: usize) -> VmResult<usize> {
        let r = {
            let mut h = self.vm.heap.lock();
            h.stack_free(self.tid, nf).and_then(|_| h.stack_alloc(self.tid, na))
        };
        self.lift(r)
    }

    pub fn push(&mut self, c: &Cell) -> VmResult<usize> {
        let r = self.vm.heap.lock().stack_push(self.tid, c);
        self.lift(r)
    }

    pub fn push_value(&mut self, v: Value) -> VmResult<usize> {
        self.push(&Cell::new(v))
    }

    pub fn push_obj(&mut self, o: Option<ObjRef>) -> VmResult<usize> {
        self.push_value(Value::Obj(o))
    }

    pub fn get(&mut self, idx: usize) -> VmResult<Cell> {
        let r = self.vm.heap.lock().stack_get(self.tid, idx);
        self.lift(r)
    }

    pub fn set(&mut self, idx: usize, c: &Cell) -> VmResult {
        let r = self.vm.heap.lock().stack_set(self.tid, idx, c);
        self.lift(r)
    }

    pub fn set_value(&mut self, idx: usize, v: Value) -> VmResult {
        let r = self.vm.heap.lock().stack_set_value(self.tid, idx, v);
        self.lift(r)
    }

    pub fn set_obj(&mut self, idx: usize, o: Option<ObjRef>) -> VmResult {
        self.set_value(idx, Value::Obj(o))
    }

    pub fn set_nil(&mut self, idx: usize) -> VmResult {
        self.set_value(idx, Value::NIL)
    }

    pub fn copy(&mut self, dst: usize, src: usize) -> VmResult {
        let r = self.vm.heap.lock().stack_copy(self.tid, dst, src);
        self.lift(r)
    }

    // -- constructors into stack cells --------------------------------------

    pub fn str_new(&mut self, dst: usize, data: &[u8]) -> VmResult<ObjRef> {
        let r = self.vm.heap.lock().str_new(self.tid, dst, data);
        self.lift(r)
    }

    pub fn str_new_hashed(&mut self, dst: usize, data: &[u8], hash: u32) -> VmResult<ObjRef> {
        let r = self.vm.heap.lock().str_new_hashed(self.tid, dst, data, hash);
        self.lift(r)
    }

    pub fn push_str(&mut self, data: &[u8]) -> VmResult<usize> {
        let idx = self.alloc(1)?;
        self.str_new(idx, data)?;
        Ok(idx)
    }

    pub fn pair_new(&mut self, dst: usize, first: &Cell, second: &Cell) -> VmResult<ObjRef> {
        let r = self.vm.heap.lock().pair_new(self.tid, dst, first, second);
        self.lift(r)
    }

    pub fn list_new(&mut self, dst: usize, item: &Cell, next: Option<ObjRef>) -> VmResult<ObjRef> {
        let r = self.vm.heap.lock().list_new(self.tid, dst, item, next);
        self.lift(r)
    }

    pub fn array_new(&mut self, dst: usize, class: crate::core::value::Builtin, size: usize) -> VmResult<ObjRef> {
        let r = self.vm.heap.lock().array_new(self.tid, dst, class, size);
        self.lift(r)
    }

    pub fn barray_new(
        &mut self,
        dst: usize,
        class: crate::core::value::Builtin,
        data: &[u8],
    ) -> VmResult<ObjRef> {
        let r = self.vm.heap.lock().barray_new(self.tid, dst, class, data);
        self.lift(r)
    }

    pub fn set_new(&mut self, dst: usize, class: crate::core::value::Builtin, size: usize) -> VmResult<ObjRef> {
        let r = self.vm.heap.lock().set_new(self.tid, dst, class, size);
        self.lift(r)
    }

    pub fn slice_new(
        &mut self,
        dst: usize,
        class: crate::core::value::Builtin,
        underlying: ObjRef,
        ofs: usize,
        len: usize,
    ) -> VmResult<ObjRef> {
        let r = self.vm.heap.lock().slice_new(self.tid, dst, class, underlying, ofs, len);
        self.lift(r)
    }

    /// Enter a namespace: push a namespace frame.  The embedder's entry
    /// context and module init hooks run under one of these.
    pub fn enter_ns(&mut self, ns: ObjRef) -> VmResult<()> {
        let r = self.frames.push_ns(ns);
        self.lift(r)?;
        Ok(())
    }

    /// Pop one frame of any kind, releasing the value-stack region it
    /// pinned.
    pub fn leave_frame(&mut self) -> VmResult<()> {
        self.frame_pop1()
    }

    /// The current call frame's (bp, argc, ap, dst), or fatal when no
    /// call frame is active.
    pub(crate) fn cur_call_info(&mut self) -> VmResult<(usize, usize, usize, usize)> {
        let info = self.frames.cur_call().map(|f| (f.bp, f.argc, f.ap, f.dst));
        self.lift(info)
    }

    // -- frame popping ------------------------------------------------------

    /// Pop one frame, releasing the value-stack region it pinned.
    pub(crate) fn frame_pop1(&mut self) -> VmResult<()> {
        let f = {
            let r = self.frames.pop();
            self.lift(r)?
        };
        match f {
            crate::frame::Frame::Ns(_) => Ok(()),
            crate::frame::Frame::Call(fr) => self.unwind(fr.bp),
            crate::frame::Frame::Except(fr) => self.unwind(fr.sp),
        }
    }

    /// Pop frames until `n` exception frames have been popped.
    pub fn frame_except_pop(&mut self, mut n: usize) -> VmResult<()> {
        if self.except_lvl > 0 {
            self.except_lvl -= 1;
        }
        while n > 0 {
            let top = match self.frames.len().checked_sub(1) {
                Some(i) => i,
                None => return Err(self.fatal(Fatal::FrameStackUnderflow, None)),
            };
            let was_except = matches!(self.frames.get(top), crate::frame::Frame::Except(_));
            self.frame_pop1()?;
            if was_except {
                n -= 1;
            }
        }
        Ok(())
    }

    // -- container lock -----------------------------------------------------

    /// Take the container lock of `r`.  Re-entry by the owning thread is
    /// how descent loops through cyclic data are detected.
    pub(crate) fn obj_lock(&mut self, r: ObjRef) -> VmResult {
        let me = std::thread::current().id();
        loop {
            let mut h = self.vm.heap.lock();
            match h.obj_try_lock(r, me) {
                LockTry::Acquired => return Ok(()),
                LockTry::OwnedBySelf => {
                    drop(h);
                    return Err(crate::except::descent_loop(self));
                }
                LockTry::Busy => {
                    self.vm.obj_cv.wait(&mut h);
                }
            }
        }
    }

    pub(crate) fn obj_unlock(&mut self, r: ObjRef) {
        self.vm.heap.lock().obj_unlock(r);
        self.vm.obj_cv.notify_all();
    }

    // -- worker entry -------------------------------------------------------

    /// Entry point for a spawned thread.  Expects its value stack laid out
    /// bottom to top as: namespace to run under, entry method, result
    /// slot, then the arguments with the receiver first.  Returns the
    /// entry method's integer result, zero when it is not an integer, or
    /// the fatal exit code.
    pub fn run_entry(mut self) -> i64 {
        let (ns, method, argc) = {
            let h = self.vm.heap.lock();
            let len = h.stack_len(self.tid);
            if len < 3 {
                drop(h);
                let _ = self.fatal(Fatal::StackRange, Some("bad entry stack".into()));
                return Fatal::StackRange.exit_code() as i64;
            }
            let ns = h.stack_get(self.tid, 0).ok().and_then(|c| c.as_obj());
            let method = h.stack_get(self.tid, 1).unwrap_or_default();
            (ns, method, len - 3)
        };
        let result = crate::core::oop::method_run(&mut self, 2, ns, None, &method, argc, 3);
        match result {
            Ok(()) => {
                let out = self
                    .get(2)
                    .ok()
                    .map(|c| match c.value {
                        Value::Int(i) => i,
                        _             => 0,
                    })
                    .unwrap_or(0);
                log::debug!("thread {} finished with {}", self.tid, out);
                out
            }
            Err(Unwind::Fatal(f)) => f.exit_code() as i64,
            Err(Unwind::Except { .. }) => {
                // Raise with no catch frame terminates the thread before
                // this point; an escaped unwind is a frame-chain bug.
                debug_assert!(false, "unwind escaped thread entry");
                Fatal::UncaughtException.exit_code() as i64
            }
        }
    }

    /// Detach-and-run helper; the join handle yields the entry result.
    pub fn spawn(self) -> std::thread::JoinHandle<i64> {
        std::thread::Builder::new()
            .name(format!("opal-{}", self.tid))
            .spawn(move || self.run_entry())
            .expect("thread spawn failed")
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.vm.heap.lock().unregister_stack(self.tid);
    }
}

/// Symbolic name of a method value, for backtraces and write methods.
pub fn method_symbol(c: &Cell) -> String {
    match &c.value {
        Value::Method(m)      => format!("&Method({})", m.symbol()),
        Value::Codemethod(cm) => format!("&Codemethod({})", cm.name),
        _                     => "???".to_string(),
    }
}
