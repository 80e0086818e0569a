/// File class methods
///
/// A file object holds its filename, mode string and a native handle; the
/// class carries pre-bound stdin/stdout/stderr instances.  Blocking reads
/// and writes run on a duplicated handle so the object lock is never held
/// across IO.

use std::io::{Read, Seek, Write};

use crate::core::oop::{self, call_by_selector};
use crate::core::value::{Builtin, Value};
use crate::errors::VmResult;
use crate::except;
use crate::gc::FileHandle;
use crate::intrinsics::{file_arg, int_arg, ret_str, str_arg};
use crate::thread::Thread;

/// Class init hook: bind the three standard streams as class variables.
pub fn class_init(th: &mut Thread) -> VmResult {
    let mark = th.sp();
    for (name, mode, handle) in [
        ("stdin", "r", FileHandle::Stdin),
        ("stdout", "w", FileHandle::Stdout),
        ("stderr", "w", FileHandle::Stderr),
    ] {
        let w = th.alloc(3)?;
        th.str_new(w, name.as_bytes())?;
        th.str_new(w + 1, mode.as_bytes())?;
        let (name_r, mode_r) = {
            let h = th.vm.heap.lock();
            (
                h.stack_cell(th.tid, w).unwrap().as_obj().unwrap(),
                h.stack_cell(th.tid, w + 1).unwrap().as_obj().unwrap(),
            )
        };
        {
            let mut h = th.vm.heap.lock();
            let r = h.file_new(th.tid, w + 2, name_r, mode_r, handle);
            drop(h);
            th.lift(r)?;
        }
        let cell = th.get(w + 2)?;
        {
            let mut h = th.vm.heap.lock();
            let cl = h.builtin(Builtin::File);
            let _ = h.class_puts(cl, name.as_bytes(), crate::core::value::mem_hash(name.as_bytes()), &cell);
        }
        th.unwind(w)?;
    }
    th.unwind(mark)
}

fn open_options(mode: &str) -> Option<std::fs::OpenOptions> {
    let mut o = std::fs::OpenOptions::new();
    match mode {
        "r"  => o.read(true),
        "r+" => o.read(true).write(true),
        "w"  => o.write(true).create(true).truncate(true),
        "w+" => o.read(true).write(true).create(true).truncate(true),
        "a"  => o.append(true).create(true),
        "a+" => o.read(true).append(true).create(true),
        _    => return None,
    };
    Some(o)
}

pub fn new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 3)?;
    let filename_r = str_arg(th, ap + 1)?;
    let mode_r = str_arg(th, ap + 2)?;
    let (path, mode) = {
        let h = th.vm.heap.lock();
        (h.str_lossy(filename_r), h.str_lossy(mode_r))
    };
    let Some(opts) = open_options(&mode) else {
        return Err(except::inv_value(th, ap + 2));
    };
    match opts.open(&path) {
        Ok(f) => {
            let r = th
                .vm
                .heap
                .lock()
                .file_new(th.tid, dst, filename_r, mode_r, FileHandle::File(f));
            th.lift(r)?;
            Ok(())
        }
        Err(e) => {
            th.errno_set(&e);
            Err(except::file_open(th, ap + 1, ap + 2, &e.to_string()))
        }
    }
}

/// Duplicate the native handle so IO can run outside the object lock.
enum Io {
    File(std::fs::File),
    Stdin,
    Stdout,
    Stderr,
}

fn dup_io(th: &mut Thread, f: crate::core::value::ObjRef) -> Option<Io> {
    let h = th.vm.heap.lock();
    match &h.file_shape(f).handle {
        FileHandle::File(file) => file.try_clone().ok().map(Io::File),
        FileHandle::Stdin      => Some(Io::Stdin),
        FileHandle::Stdout     => Some(Io::Stdout),
        FileHandle::Stderr     => Some(Io::Stderr),
    }
}

pub fn copy(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let f = file_arg(th, ap)?;
    let dup = dup_io(th, f);
    let (filename, mode) = {
        let h = th.vm.heap.lock();
        let sh = h.file_shape(f);
        (sh.filename, sh.mode)
    };
    let (Some(dup), Some(filename), Some(mode)) = (dup, filename, mode) else {
        return th.set_nil(dst);
    };
    let handle = match dup {
        Io::File(file) => FileHandle::File(file),
        Io::Stdin      => FileHandle::Stdin,
        Io::Stdout     => FileHandle::Stdout,
        Io::Stderr     => FileHandle::Stderr,
    };
    let r = th.vm.heap.lock().file_new(th.tid, dst, filename, mode, handle);
    th.lift(r)?;
    Ok(())
}

pub fn eof(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let f = file_arg(th, ap)?;
    let e = th.vm.heap.lock().file_shape(f).eof;
    th.set_value(dst, Value::Bool(e))
}

pub fn flush(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let f = file_arg(th, ap)?;
    {
        let mut h = th.vm.heap.lock();
        match &mut h.file_mut(f).handle {
            FileHandle::File(file) => {
                let _ = file.flush();
            }
            FileHandle::Stdout => {
                let _ = std::io::stdout().flush();
            }
            FileHandle::Stderr => {
                let _ = std::io::stderr().flush();
            }
            FileHandle::Stdin => {}
        }
    }
    th.copy(dst, ap)
}

pub fn filename(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let f = file_arg(th, ap)?;
    let n = th.vm.heap.lock().file_shape(f).filename;
    th.set_obj(dst, n)
}

pub fn mode(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let f = file_arg(th, ap)?;
    let m = th.vm.heap.lock().file_shape(f).mode;
    th.set_obj(dst, m)
}

/// Read up to `n` bytes; the pushback byte comes first.  Returns the
/// bytes, or None for an IO error.
fn read_raw(th: &mut Thread, f: crate::core::value::ObjRef, n: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(n.min(64 * 1024));
    {
        let mut h = th.vm.heap.lock();
        if out.len() < n {
            if let Some(b) = h.file_mut(f).pushback.take() {
                out.push(b);
            }
        }
    }
    if out.len() >= n {
        return Some(out);
    }
    let want = n - out.len();
    let mut buf = vec![0u8; want];
    let mut got = 0usize;
    let io = dup_io(th, f)?;
    let result: std::io::Result<()> = (|| {
        match io {
            Io::File(mut file) => {
                while got < want {
                    let k = file.read(&mut buf[got..])?;
                    if k == 0 {
                        break;
                    }
                    got += k;
                }
            }
            Io::Stdin => {
                let stdin = std::io::stdin();
                let mut lock = stdin.lock();
                while got < want {
                    let k = lock.read(&mut buf[got..])?;
                    if k == 0 {
                        break;
                    }
                    got += k;
                }
            }
            Io::Stdout | Io::Stderr => {}
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            if got < want {
                th.vm.heap.lock().file_mut(f).eof = true;
            }
            out.extend_from_slice(&buf[..got]);
            Some(out)
        }
        Err(e) => {
            th.errno_set(&e);
            None
        }
    }
}

pub fn read(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let f = file_arg(th, ap)?;
    let n = int_arg(th, ap + 1)?;
    if n < 0 {
        return Err(except::inv_value(th, ap + 1));
    }
    match read_raw(th, f, n as usize) {
        Some(data) => ret_str(th, dst, &data),
        None       => th.set_value(dst, Value::Int(-1)),
    }
}

pub fn readb(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let f = file_arg(th, ap)?;
    let n = int_arg(th, ap + 1)?;
    if n < 0 {
        return Err(except::inv_value(th, ap + 1));
    }
    match read_raw(th, f, n as usize) {
        Some(data) => {
            let r = th.vm.heap.lock().barray_new(th.tid, dst, Builtin::Bytearray, &data);
            th.lift(r)?;
            Ok(())
        }
        None => th.set_value(dst, Value::Int(-1)),
    }
}

/// Read through the next newline, up to an optional byte limit.
pub fn readln(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_range(th, argc, 1, 2)?;
    let f = file_arg(th, ap)?;
    let mut limit = None;
    if argc == 2 {
        let n = int_arg(th, ap + 1)?;
        if n > 0 {
            limit = Some(n as usize);
        }
    }
    let mut out = Vec::new();
    loop {
        if let Some(lim) = limit {
            if out.len() >= lim {
                break;
            }
        }
        match read_raw(th, f, 1) {
            None => return th.set_value(dst, Value::Int(-1)),
            Some(b) if b.is_empty() => break,
            Some(b) => {
                out.push(b[0]);
                if b[0] == b'\n' {
                    break;
                }
            }
        }
    }
    ret_str(th, dst, &out)
}

pub fn tell(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let f = file_arg(th, ap)?;
    let pos = {
        let mut h = th.vm.heap.lock();
        match &mut h.file_mut(f).handle {
            FileHandle::File(file) => file.stream_position().unwrap_or(0),
            _ => 0,
        }
    };
    th.set_value(dst, Value::Int(pos as i64))
}

/// Push one character back; the next read returns it first.
pub fn unread(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let f = file_arg(th, ap)?;
    let s = str_arg(th, ap + 1)?;
    let b = {
        let h = th.vm.heap.lock();
        let bytes = h.str_bytes(s);
        if bytes.len() != 1 {
            None
        } else {
            Some(bytes[0])
        }
    };
    let Some(b) = b else {
        return Err(except::inv_value(th, ap + 1));
    };
    {
        let mut h = th.vm.heap.lock();
        let sh = h.file_mut(f);
        sh.pushback = Some(b);
        sh.eof = false;
    }
    th.copy(dst, ap)
}

/// One argument: the info form.  Two: write string or byte-array data
/// and answer the byte count.
pub fn write(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    match argc {
        1 => {
            let f = file_arg(th, ap)?;
            let text = {
                let mut h = th.vm.heap.lock();
                let name = h
                    .file_shape(f)
                    .filename
                    .map(|r| h.str_lossy(r))
                    .unwrap_or_default();
                let mode = h
                    .file_shape(f)
                    .mode
                    .map(|r| h.str_lossy(r))
                    .unwrap_or_default();
                let eof = h.file_shape(f).eof;
                let ofs = match &mut h.file_mut(f).handle {
                    FileHandle::File(file) => file.stream_position().unwrap_or(0),
                    _ => 0,
                };
                format!(
                    "File@{:#x}{{filename: {}, mode: {}, ofs: {}, eof: {}}}",
                    f.idx(),
                    name,
                    mode,
                    ofs,
                    if eof { "#true" } else { "#false" }
                )
            };
            ret_str(th, dst, text.as_bytes())
        }
        2 => {
            let f = file_arg(th, ap)?;
            let data = {
                let h = th.vm.heap.lock();
                match h.stack_cell(th.tid, ap + 1).ok().and_then(|c| c.as_obj()) {
                    Some(r) if h.class_of_raw(r) == h.builtin(Builtin::String) => {
                        Some(h.str_bytes(r).to_vec())
                    }
                    Some(r) if h.class_of_raw(r) == h.builtin(Builtin::Bytearray) => {
                        Some(h.barray_bytes(r).to_vec())
                    }
                    _ => None,
                }
            };
            let Some(data) = data else {
                return Err(except::inv_value(th, ap + 1));
            };
            let Some(io) = dup_io(th, f) else {
                return th.set_value(dst, Value::Int(-1));
            };
            let written: std::io::Result<usize> = match io {
                Io::File(mut file) => file.write(&data),
                Io::Stdout         => std::io::stdout().write(&data),
                Io::Stderr         => std::io::stderr().write(&data),
                Io::Stdin          => Ok(0),
            };
            match written {
                Ok(n) => th.set_value(dst, Value::Int(n as i64)),
                Err(e) => {
                    th.errno_set(&e);
                    th.set_value(dst, Value::Int(-1))
                }
            }
        }
        _ => Err(except::num_args_range(th, 1, 2)),
    }
}

/// Write the data then a newline, both through ordinary dispatch.
pub fn writeln(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let _ = dst;
    let mark = th.sp();
    let recvr = th.get(ap)?;
    let arg = th.get(ap + 1)?;
    let w = th.alloc(1)?;
    th.push(&recvr)?;
    th.push(&arg)?;
    call_by_selector(th, w, "write", 2)?;
    th.free(2)?;
    th.push(&recvr)?;
    let nl = th.alloc(1)?;
    th.str_new(nl, b"\n")?;
    call_by_selector(th, w, "write", 2)?;
    th.unwind(mark)
}
