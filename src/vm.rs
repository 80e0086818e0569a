/// Byte-code interpreter
///
/// A flat decode loop over the thread's byte-code cursor.  All state lives
/// on the thread (cursor, frames, value stack), so nested method calls
/// re-enter `interp` and raises transfer control by unwinding the Rust
/// call stack until they reach the activation whose catch frame was hit;
/// that activation's loop simply continues at the restored cursor.
///
/// Every operand is bounds-checked against the frame and stack limits; an
/// undecodable byte or illegal base terminates the thread with an
/// invalid-instruction report naming the symbolic address.

use crate::bytecode::{op, parse_float_text, Base, Reader};
use crate::core::oop;
use crate::core::value::{Builtin, MethodRef, Value};
use crate::errors::{Fatal, Unwind, VmResult};
use crate::except;
use crate::frame::Pc;
use crate::thread::Thread;

/// Resolved cell operand: an absolute index into the thread's value
/// stack.
type Loc = usize;

fn invalid_instr(th: &mut Thread) -> Unwind {
    let (symbol, bytes) = match &th.pc {
        Some(pc) => {
            let start = th.pc_instr_start.min(pc.blob.code.len());
            let end = pc.off.min(pc.blob.code.len()).max(start);
            let hex: Vec<String> = pc.blob.code[start..end]
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();
            (format!("{}+{:#x}", pc.blob.name, start), hex.join(" "))
        }
        None => ("?".to_string(), String::new()),
    };
    th.fatal(Fatal::InvalidOpcode, Some(format!("{}: {}", symbol, bytes)))
}

/// Resolve a decoded cell operand against the current call frame.
fn resolve(th: &mut Thread, base: Base, ofs: i64, nbytes: u8) -> VmResult<Loc> {
    let (bp, argc, ap, dst) = th.cur_call_info()?;
    let len = th.sp();
    match base {
        Base::Sp => {
            if ofs < 0 || ofs as usize >= len.saturating_sub(bp) {
                return Err(invalid_instr(th));
            }
            Ok(len - 1 - ofs as usize)
        }
        Base::Bp => {
            if ofs >= 0 || (-ofs) as usize > len.saturating_sub(bp) {
                return Err(invalid_instr(th));
            }
            Ok(bp + (-ofs) as usize - 1)
        }
        Base::Arg => {
            if ofs < 0 || ofs as usize >= argc {
                return Err(invalid_instr(th));
            }
            Ok(ap + ofs as usize)
        }
        Base::Dst => {
            if nbytes != 0 || ofs != 0 {
                return Err(invalid_instr(th));
            }
            Ok(dst)
        }
    }
}

fn trace_instr(th: &Thread) {
    let Some(pc) = &th.pc else { return };
    let start = th.pc_instr_start.min(pc.blob.code.len());
    let end = pc.off.min(pc.blob.code.len()).max(start);
    let hex: Vec<String> = pc.blob.code[start..end]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    eprintln!("{}+{:#x}: {}", pc.blob.name, start, hex.join(" "));
}

/// Read the boolean at the stack top; anything else is an invalid value.
fn top_bool(th: &mut Thread) -> VmResult<bool> {
    let sp = th.sp();
    if sp == 0 {
        return Err(th.fatal(Fatal::StackRange, None));
    }
    match th.get(sp - 1)?.value {
        Value::Bool(b) => Ok(b),
        _ => Err(except::inv_value(th, sp - 1)),
    }
}

/// Execute a byte-code method.  The caller has already pushed the call
/// frame; this installs the cursor and runs until a return opcode.
pub fn interp(th: &mut Thread, m: &MethodRef) -> VmResult {
    let old_pc = th.pc.take();
    th.pc = Some(Pc { blob: m.blob.clone(), off: m.entry });
    let mark = th.frames.len();
    let result = interp_loop(th, mark);
    if result.is_ok() {
        th.pc = old_pc;
    }
    result
}

fn interp_loop(th: &mut Thread, mark: usize) -> VmResult {
    macro_rules! step {
        ($th:expr, $e:expr) => {
            match $e {
                Ok(v) => v,
                Err(Unwind::Except { frame }) if frame >= mark => {
                    // Our catch frame took the exception; the cursor was
                    // restored by the raise.
                    continue;
                }
                Err(e) => return Err(e),
            }
        };
    }

    loop {
        let pc = th.pc.clone().expect("interpreter without a cursor");
        let code = &pc.blob.code;
        th.pc_instr_start = pc.off;
        let mut r = Reader::new(code, pc.off);

        let Some(opcode) = r.u8() else {
            return Err(invalid_instr(th));
        };

        macro_rules! operand {
            ($e:expr) => {
                match $e {
                    Some(v) => v,
                    None => {
                        th.pc.as_mut().unwrap().off = r.off;
                        return Err(invalid_instr(th));
                    }
                }
            };
        }

        match opcode {
            op::NOP => {
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
            }

            op::STACK_FREE => {
                let n = operand!(r.uintv()) as usize;
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.free(n)?;
            }

            op::STACK_ALLOC => {
                let n = operand!(r.uintv()) as usize;
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.alloc(n)?;
            }

            op::STACK_FREE_ALLOC => {
                let nf = operand!(r.uintv()) as usize;
                let na = operand!(r.uintv()) as usize;
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.free_alloc(nf, na)?;
            }

            op::ASSIGN => {
                let (b1, o1, n1) = operand!(r.cell_ref());
                let (b2, o2, n2) = operand!(r.cell_ref());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let dst = resolve(th, b1, o1, n1)?;
                let src = resolve(th, b2, o2, n2)?;
                th.copy(dst, src)?;
            }

            op::PUSH => {
                let (b, o, n) = operand!(r.cell_ref());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let src = resolve(th, b, o, n)?;
                let c = th.get(src)?;
                th.push(&c)?;
            }

            op::CALL => {
                let (b, o, n) = operand!(r.cell_ref());
                let sel = operand!(r.strv()).to_vec();
                let hash = operand!(r.hash32());
                let argc = operand!(r.uintv()) as usize;
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let dst = resolve(th, b, o, n)?;
                if argc < 1 || argc > th.sp() {
                    return Err(invalid_instr(th));
                }
                step!(th, oop::call_sel_hashed(th, dst, &sel, hash, argc));
            }

            op::RET => {
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                return Ok(());
            }

            op::RET_ARG0 => {
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let (_, _, ap, dst) = th.cur_call_info()?;
                th.copy(dst, ap)?;
                return Ok(());
            }

            op::CATCH_PUSH => {
                let (b, o, n) = operand!(r.cell_ref());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let var = resolve(th, b, o, n)?;
                let sp = th.sp();
                let pc_snapshot = th.pc.clone();
                let res = th.frames.push_except(var, sp, pc_snapshot);
                th.lift(res)?;
            }

            op::RAISE => {
                let (b, o, n) = operand!(r.cell_ref());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let arg = resolve(th, b, o, n)?;
                step!(th, Err::<(), Unwind>(except::raise(th, arg)));
            }

            op::RERAISE => {
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                step!(th, Err::<(), Unwind>(except::reraise(th)));
            }

            op::CATCH_POP => {
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.frame_except_pop(1)?;
            }

            op::CATCH_POP_N => {
                let n = operand!(r.uintv()) as usize;
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.frame_except_pop(n)?;
            }

            op::BR => {
                let ofs = operand!(r.intv());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.pc.as_mut().unwrap().off = (r.off as i64 + ofs) as usize;
            }

            op::BR_TRUE | op::BR_FALSE | op::BR_TRUE_POP | op::BR_FALSE_POP => {
                let ofs = operand!(r.intv());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let b = step!(th, top_bool(th));
                let want = matches!(opcode, op::BR_TRUE | op::BR_TRUE_POP);
                if b == want {
                    th.pc.as_mut().unwrap().off = (r.off as i64 + ofs) as usize;
                }
                if matches!(opcode, op::BR_TRUE_POP | op::BR_FALSE_POP) {
                    th.free(1)?;
                }
            }

            op::BR_EXCEPT => {
                let ofs = operand!(r.intv());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                if th.except_chk() {
                    th.pc.as_mut().unwrap().off = (r.off as i64 + ofs) as usize;
                }
            }

            op::ENV_AT | op::ENV_AT_PUSH => {
                let dst = if opcode == op::ENV_AT {
                    let (b, o, n) = operand!(r.cell_ref());
                    Some((b, o, n))
                } else {
                    None
                };
                let name = operand!(r.strv()).to_vec();
                let hash = operand!(r.hash32());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                // Route through Environment.ate so the lookup is ordinary
                // dispatch.
                let env = th.vm.heap.lock().builtin(Builtin::Environment);
                match dst {
                    Some((b, o, n)) => {
                        let dst = resolve(th, b, o, n)?;
                        let mark = th.sp();
                        th.push_obj(Some(env))?;
                        let ni = th.alloc(1)?;
                        th.str_new_hashed(ni, &name, hash)?;
                        step!(th, oop::call_by_selector(th, dst, "ate", 2));
                        th.unwind(mark)?;
                    }
                    None => {
                        let dst = th.alloc(1)?;
                        th.push_obj(Some(env))?;
                        let ni = th.alloc(1)?;
                        th.str_new_hashed(ni, &name, hash)?;
                        step!(th, oop::call_by_selector(th, dst, "ate", 2));
                        th.unwind(dst + 1)?;
                    }
                }
            }

            op::NIL => {
                let (b, o, n) = operand!(r.cell_ref());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let dst = resolve(th, b, o, n)?;
                th.set_nil(dst)?;
            }

            op::NIL_PUSH => {
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.push_obj(None)?;
            }

            op::FALSE | op::TRUE => {
                let (b, o, n) = operand!(r.cell_ref());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let dst = resolve(th, b, o, n)?;
                th.set_value(dst, Value::Bool(opcode == op::TRUE))?;
            }

            op::FALSE_PUSH | op::TRUE_PUSH => {
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.push_value(Value::Bool(opcode == op::TRUE_PUSH))?;
            }

            op::INT => {
                let (b, o, n) = operand!(r.cell_ref());
                let v = operand!(r.intv());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let dst = resolve(th, b, o, n)?;
                th.set_value(dst, Value::Int(v))?;
            }

            op::INT_PUSH => {
                let v = operand!(r.intv());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                th.push_value(Value::Int(v))?;
            }

            op::FLOAT | op::FLOAT_PUSH => {
                let dst = if opcode == op::FLOAT {
                    Some(operand!(r.cell_ref()))
                } else {
                    None
                };
                let text = operand!(r.strv()).to_vec();
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let Some(v) = parse_float_text(&text) else {
                    return Err(invalid_instr(th));
                };
                match dst {
                    Some((b, o, n)) => {
                        let dst = resolve(th, b, o, n)?;
                        th.set_value(dst, Value::Float(v))?;
                    }
                    None => {
                        th.push_value(Value::Float(v))?;
                    }
                }
            }

            op::METHOD | op::METHOD_PUSH => {
                let dst = if opcode == op::METHOD {
                    Some(operand!(r.cell_ref()))
                } else {
                    None
                };
                let ofs = operand!(r.intv());
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let entry = r.off as i64 + ofs;
                if entry < 0 || entry as usize > code.len() {
                    return Err(invalid_instr(th));
                }
                let m = Value::Method(MethodRef { blob: pc.blob.clone(), entry: entry as usize });
                match dst {
                    Some((b, o, n)) => {
                        let dst = resolve(th, b, o, n)?;
                        th.set_value(dst, m)?;
                    }
                    None => {
                        th.push_value(m)?;
                    }
                }
            }

            op::STR | op::STRH => {
                let (b, o, n) = operand!(r.cell_ref());
                let s = operand!(r.strv()).to_vec();
                let hash = if opcode == op::STRH {
                    Some(operand!(r.hash32()))
                } else {
                    None
                };
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let dst = resolve(th, b, o, n)?;
                match hash {
                    Some(h) => th.str_new_hashed(dst, &s, h)?,
                    None    => th.str_new(dst, &s)?,
                };
            }

            op::STR_PUSH | op::STRH_PUSH => {
                let s = operand!(r.strv()).to_vec();
                let hash = if opcode == op::STRH_PUSH {
                    Some(operand!(r.hash32()))
                } else {
                    None
                };
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let dst = th.alloc(1)?;
                match hash {
                    Some(h) => th.str_new_hashed(dst, &s, h)?,
                    None    => th.str_new(dst, &s)?,
                };
            }

            op::ARGC_CHK => {
                let expected = operand!(r.uintv()) as usize;
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                let (_, argc, _, _) = th.cur_call_info()?;
                if argc != expected {
                    step!(th, Err::<(), Unwind>(except::num_args(th, expected)));
                }
            }

            op::ARG_ARRAY => {
                let n = operand!(r.uintv()) as usize;
                th.pc.as_mut().unwrap().off = r.off;
                if th.trace {
                    trace_instr(th);
                }
                step!(th, oop::method_array_arg_push(th, n).map(|_| ()));
            }

            _ => {
                th.pc.as_mut().unwrap().off = r.off;
                return Err(invalid_instr(th));
            }
        }
    }
}
