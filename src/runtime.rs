/// VM construction, class bootstrap, and run entry points
///
/// Bootstrap order matters: the metaclass is created as an instance of
/// itself, the base classes are allocated as metaclass instances, then
/// names, parents and dictionaries are filled in, the built-in method
/// table is installed, the root namespace `main` is created with every
/// class bound into it, and finally the per-class init hooks run under
/// the root namespace.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, ReentrantMutex};

use crate::core::oop::{method_run, MethodDict};
use crate::core::value::{
    mem_hash, Builtin, Cell, Codemethod, Value,
};
use crate::errors::{Fatal, RunError, Unwind, VmResult};
use crate::gc::{ClassField, Heap};
use crate::intrinsics::METHOD_TABLE;
use crate::thread::{Thread, DEFAULT_STACK_SIZE};

pub struct Vm {
    pub(crate) heap: Mutex<Heap>,
    pub(crate) obj_cv: Condvar,
    pub(crate) module_lock: ReentrantMutex<()>,
}

impl Vm {
    /// Take the global object lock.  Everything reachable through the
    /// returned heap is shared state; release promptly.
    pub fn heap(&self) -> parking_lot::MutexGuard<'_, Heap> {
        self.heap.lock()
    }

    /// Initialize the VM and create the main thread.  Zero sizes select
    /// the defaults: 8192 cells and one page of frame stack.
    pub fn init(stack_size: usize, frame_stack_size: usize) -> Thread {
        let page = page_size::get();
        let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let frame_stack_size = if frame_stack_size == 0 { page } else { frame_stack_size };
        let vm = Arc::new(Vm {
            heap: Mutex::new(Heap::new(page)),
            obj_cv: Condvar::new(),
            module_lock: ReentrantMutex::new(()),
        });
        let tid = vm.heap.lock().register_stack(stack_size);
        let mut th = Thread::new(vm, tid, true, frame_stack_size);
        classes_init(&mut th).expect("class bootstrap failed");
        log::debug!("vm initialized, {} live objects", th.vm().heap.lock().live_count());
        th
    }

    /// Create a worker thread.  The caller lays out its entry stack and
    /// spawns it.
    pub fn thread_create(
        self: &Arc<Vm>,
        stack_size: usize,
        frame_stack_size: usize,
    ) -> Thread {
        let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let frame_stack_size = if frame_stack_size == 0 {
            page_size::get()
        } else {
            frame_stack_size
        };
        let tid = self.heap.lock().register_stack(stack_size);
        Thread::new(self.clone(), tid, false, frame_stack_size)
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

fn classes_init(th: &mut Thread) -> VmResult {
    let mark = th.sp();
    let w = th.alloc(4)?;
    let tid = th.tid;

    // Pass 0: the metaclass, an instance of itself.
    let meta = {
        let mut h = th.vm.heap.lock();
        let r = h.class_alloc(tid, w, None);
        match r {
            Ok(meta) => {
                h.obj_set_class(meta, meta);
                h.set_builtin(Builtin::Metaclass, meta);
                meta
            }
            Err(f) => {
                drop(h);
                return Err(th.fatal(f, None));
            }
        }
    };

    // Pass 1: allocate every base class as a metaclass instance.
    for b in Builtin::ALL.into_iter().skip(1) {
        let mut h = th.vm.heap.lock();
        let r = h.class_alloc(tid, w, Some(meta));
        match r {
            Ok(cl) => h.set_builtin(b, cl),
            Err(f) => {
                drop(h);
                return Err(th.fatal(f, None));
            }
        }
    }

    // Pass 2: names, parents, and the three dictionaries.
    for b in Builtin::ALL {
        let cl = th.vm.heap.lock().builtin(b);
        th.str_new(w + 1, b.class_name().as_bytes())?;
        {
            let mut h = th.vm.heap.lock();
            let name_r = h.stack_cell(tid, w + 1).unwrap().as_obj();
            h.class_set_field(cl, ClassField::Name, name_r);
            let parent = b.parent().map(|p| h.builtin(p));
            h.class_set_field(cl, ClassField::Parent, parent);
        }
        for (i, (field, size)) in [
            (ClassField::Vars, crate::intrinsics::metaclass::CL_VARS_DICT_SIZE),
            (ClassField::ClMethods, crate::intrinsics::metaclass::CL_METHOD_DICT_SIZE),
            (ClassField::InstMethods, crate::intrinsics::metaclass::CL_METHOD_DICT_SIZE),
        ]
        .into_iter()
        .enumerate()
        {
            let d = {
                let r = th.vm.heap.lock().set_new(tid, w + 1 + i, Builtin::Dictionary, size);
                th.lift(r)?
            };
            th.vm.heap.lock().class_set_field(cl, field, Some(d));
        }
    }

    // Pass 3: install the built-in method table.
    for def in METHOD_TABLE {
        let cm = Cell::new(Value::Codemethod(Codemethod { name: def.name, f: def.f }));
        let mut h = th.vm.heap.lock();
        let cl = h.builtin(def.cl);
        let dict = match def.dict {
            MethodDict::Class    => h.class_shape(cl).cl_methods,
            MethodDict::Instance => h.class_shape(cl).inst_methods,
        }
        .expect("pass 2 built the dictionaries");
        h.dict_puts(dict, def.sel.as_bytes(), mem_hash(def.sel.as_bytes()), &cm)
            .expect("method selectors are not constant-named");
    }

    // Pass 4: the root namespace, self-bound under its own name.
    let main_dict = {
        let r = th.vm.heap.lock().set_new(tid, w, Builtin::Dictionary, 64);
        th.lift(r)?
    };
    th.str_new(w + 1, b"main")?;
    let main_ns = {
        let mut h = th.vm.heap.lock();
        let name_r = h.stack_cell(tid, w + 1).unwrap().as_obj();
        let r = h.ns_new(tid, w + 2, name_r, None, main_dict);
        match r {
            Ok(ns) => {
                let cell = Cell::obj(ns);
                h.dict_puts(main_dict, b"main", mem_hash(b"main"), &cell)
                    .expect("fresh dictionary");
                h.set_main_ns(ns);
                ns
            }
            Err(f) => {
                drop(h);
                return Err(th.fatal(f, None));
            }
        }
    };

    // Pass 5: every class gets the root as home namespace and a binding
    // there.
    for b in Builtin::ALL {
        let mut h = th.vm.heap.lock();
        let cl = h.builtin(b);
        h.class_set_field(cl, ClassField::Ns, Some(main_ns));
        let name = b.class_name().as_bytes();
        let cell = Cell::obj(cl);
        h.dict_puts(main_dict, name, mem_hash(name), &cell)
            .expect("fresh binding");
    }

    // Pass 6: class init hooks run under the root namespace.
    {
        let r = th.frames.push_ns(main_ns);
        th.lift(r)?;
    }
    crate::module_loader::class_init(th)?;
    crate::intrinsics::file::class_init(th)?;
    th.frame_pop1()?;

    th.unwind(mark)
}

// ---------------------------------------------------------------------------
// Run entry points
// ---------------------------------------------------------------------------

fn run_entry_method(
    th: &mut Thread,
    dst: usize,
    entry_ns: Option<crate::core::value::ObjRef>,
    entry_cl: Option<crate::core::value::ObjRef>,
    entry_method: &Cell,
    args: &[String],
) -> VmResult {
    let base = th.alloc(1 + args.len())?;
    th.set_value(base, Value::Obj(entry_ns))?;
    for (i, a) in args.iter().enumerate() {
        th.str_new(base + 1 + i, a.as_bytes())?;
    }
    method_run(th, dst, entry_ns, entry_cl, entry_method, 1 + args.len(), base)
}

fn map_unwind(u: Unwind) -> RunError {
    match u {
        Unwind::Fatal(f)      => RunError::Fatal(f),
        Unwind::Except { .. } => RunError::Fatal(Fatal::UncaughtException),
    }
}

/// Load a module and execute a class method in it by name.  The class
/// path is dotted: namespaces down to the class.
pub fn run(
    th: &mut Thread,
    dst: usize,
    entry_module: &str,
    entry_cl: &str,
    entry_method: &str,
    args: &[String],
) -> Result<(), RunError> {
    let mark = th.sp();
    let result = run_inner(th, dst, entry_module, entry_cl, entry_method, args);
    if result.is_ok() {
        let _ = th.unwind(mark);
    }
    result
}

fn run_inner(
    th: &mut Thread,
    dst: usize,
    entry_module: &str,
    entry_cl: &str,
    entry_method: &str,
    args: &[String],
) -> Result<(), RunError> {
    let Some((path, sha)) = crate::module_loader::find_module(th, entry_module) else {
        return Err(RunError::ModuleNotFound(entry_module.to_string()));
    };
    let name_hash = mem_hash(entry_module.as_bytes());
    let module_slot = th.alloc(1).map_err(map_unwind)?;
    let main_ns = th.vm.heap.lock().main_ns();
    match crate::module_loader::load(th, module_slot, entry_module, name_hash, &path, &sha, main_ns)
        .map_err(map_unwind)?
    {
        Ok(()) => {}
        Err(msg) => return Err(RunError::ModuleInit(entry_module.to_string(), msg)),
    }

    // Walk the dotted class path from the module's namespace.
    let mut cursor = {
        let h = th.vm.heap.lock();
        h.stack_cell(th.tid, module_slot)
            .ok()
            .and_then(|c| c.as_obj())
    };
    let segments: Vec<&str> = entry_cl.split('.').collect();
    for (i, seg) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        let next = {
            let h = th.vm.heap.lock();
            match cursor {
                Some(ns) if h.is_ns(ns) => h
                    .ns_ats(ns, seg.as_bytes(), mem_hash(seg.as_bytes()))
                    .map(|pr| h.pair_parts(pr).1.as_obj())
                    .flatten(),
                _ => None,
            }
        };
        match next {
            Some(r) if last => {
                if !th.vm.heap.lock().is_class(r) {
                    return Err(RunError::ClassNotFound(entry_cl.to_string()));
                }
                cursor = Some(r);
            }
            Some(r) => cursor = Some(r),
            None if last => return Err(RunError::ClassNotFound(entry_cl.to_string())),
            None => return Err(RunError::NamespaceNotFound(seg.to_string())),
        }
    }
    let class = cursor.expect("class path walked");

    // The entry must be a class method on the class itself.
    let method = {
        let h = th.vm.heap.lock();
        h.class_shape(class)
            .cl_methods
            .and_then(|d| h.dict_ats(d, entry_method.as_bytes(), mem_hash(entry_method.as_bytes())))
            .map(|pr| h.pair_parts(pr).1)
    };
    let method = match method {
        Some(m) if m.is_callable() => m,
        _ => return Err(RunError::MethodNotFound(entry_method.to_string())),
    };

    run_entry_method(th, dst, None, Some(class), &method, args).map_err(map_unwind)
}

/// Run a statically-linked module: its init function, then its entry
/// method, both under the root namespace.
pub fn run_static(
    th: &mut Thread,
    dst: usize,
    init: Codemethod,
    entry: Codemethod,
    args: &[String],
) -> Result<(), RunError> {
    let mark = th.sp();
    let main_ns = th.vm.heap.lock().main_ns();
    let result = (|th: &mut Thread| -> VmResult {
        let w = th.push_obj(Some(main_ns))?;
        let init_cell = Cell::new(Value::Codemethod(init));
        method_run(th, w, Some(main_ns), None, &init_cell, 1, w)?;
        let entry_cell = Cell::new(Value::Codemethod(entry));
        run_entry_method(th, dst, Some(main_ns), None, &entry_cell, args)
    })(th);
    match result {
        Ok(()) => {
            let _ = th.unwind(mark);
            Ok(())
        }
        Err(u) => Err(map_unwind(u)),
    }
}

/// Exit code of an entry method result: its integer value, or zero.
pub fn exit_code_of(th: &mut Thread, dst: usize) -> i32 {
    match th.get(dst) {
        Ok(Cell { value: Value::Int(i), .. }) => i as i32,
        _ => 0,
    }
}
