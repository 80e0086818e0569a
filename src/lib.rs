/// Opal virtual machine library
///
/// Module layout:
///   - mem           — page-backed size-class arena
///   - gc            — object table, reference counts, mark-sweep collector
///   - core::value   — tagged cells and object references
///   - core::oop     — classes, selector dispatch, container probing
///   - frame         — namespace / call / exception frame stack
///   - thread        — per-thread stacks, fatal handling, worker entry
///   - except        — raise/reraise/catch machinery and the taxonomy
///   - bytecode      — instruction set, operand encoding, assembler
///   - vm            — byte-code interpreter
///   - parse         — literal parser for the external value syntax
///   - intrinsics    — built-in class methods and the method table
///   - module_loader — dynamic extension modules
///   - runtime       — VM bootstrap and run entry points
///   - errors        — fatal codes and embedder-facing errors

pub mod bytecode;
pub mod core;
pub mod errors;
pub mod except;
pub mod frame;
pub mod gc;
pub mod intrinsics;
pub mod mem;
pub mod module_loader;
pub mod parse;
pub mod runtime;
pub mod thread;
pub mod vm;

pub use crate::core::value::{Builtin, Cell, Codemethod, MethodRef, ObjRef, Value};
pub use crate::errors::{Fatal, RunError, Unwind, VmResult};
pub use crate::runtime::{exit_code_of, run, run_static, Vm};
pub use crate::thread::Thread;
