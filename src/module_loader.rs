/// Module loader
///
/// A module name resolves against the `Module.path` directory list to a
/// `libopal<name>.so` candidate, fingerprinted with SHA-1.  Loading links
/// the library and runs its entry: `__<name>_code__` (a function
/// answering the module's byte-code blob) or `__<name>_init__` (a native
/// init with the ordinary code-method signature).  `Module.loaded` maps
/// names to module instances; reloading an already-loaded name clones it
/// into the requesting namespace, sharing the backing dictionary, after
/// the fingerprints are compared.
///
/// The loader lock is recursive so init hooks may load further modules.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::core::oop::{self, method_run, module_cur, str_cell_hash};
use crate::core::value::{mem_hash, Builtin, Cell, Codemethod, MethodRef, ObjRef, Value};
use crate::core::value::CodeBlob;
use crate::errors::VmResult;
use crate::except;
use crate::gc::ModuleLib;
use crate::intrinsics::{module_arg, str_arg};
use crate::thread::Thread;

pub const LIB_PREFIX: &str = "libopal";
pub const LIB_SUFFIX: &str = ".so";

/// Environment variable naming the module search path, `:`-separated.
pub const MODULE_PATH_VAR: &str = "OPAL_MODULE_PATH";

/// Signature of a byte-code module entry: answers the compiled blob.
pub type ModuleCodeFn = unsafe extern "Rust" fn() -> &'static [u8];

/// Class init hook: seed `Module.path` from the environment and create
/// the loaded-modules dictionary.
pub fn class_init(th: &mut Thread) -> VmResult {
    let mark = th.sp();
    if let Ok(path) = std::env::var(MODULE_PATH_VAR) {
        let dirs: Vec<&str> = path.split(':').collect();
        let base = th.sp();
        for d in &dirs {
            let w = th.alloc(1)?;
            th.str_new(w, d.as_bytes())?;
        }
        let lst = th.alloc(1)?;
        oop::list_from_stack(th, lst, base, dirs.len())?;
        let cell = th.get(lst)?;
        let mut h = th.vm.heap.lock();
        let cl = h.builtin(Builtin::Module);
        let _ = h.class_puts(cl, b"path", mem_hash(b"path"), &cell);
    }
    let d = th.alloc(1)?;
    let r = {
        let res = th.vm.heap.lock().set_new(th.tid, d, Builtin::Dictionary, 16);
        th.lift(res)?
    };
    {
        let mut h = th.vm.heap.lock();
        let cl = h.builtin(Builtin::Module);
        let _ = h.class_puts(cl, b"loaded", mem_hash(b"loaded"), &Cell::obj(r));
    }
    th.unwind(mark)
}

/// Directories to search: the `Module.path` class variable when it is a
/// list of strings, else the current directory.
fn search_dirs(th: &mut Thread) -> Vec<PathBuf> {
    let h = th.vm.heap.lock();
    let cl = h.builtin(Builtin::Module);
    let mut out = Vec::new();
    if let Some(c) = h.class_ats(cl, b"path", mem_hash(b"path")) {
        let mut node = c.as_obj();
        while let Some(r) = node {
            if h.class_of_raw(r) != h.builtin(Builtin::List) {
                break;
            }
            if let Some(s) = h.list_item(r).as_obj() {
                if matches!(h.shape(s), crate::gc::Shape::Str(_)) {
                    out.push(PathBuf::from(h.str_lossy(s)));
                }
            }
            node = h.list_next(r);
        }
    }
    if out.is_empty() {
        out.push(PathBuf::from("."));
    }
    out
}

fn fingerprint(path: &Path) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    let mut hasher = Sha1::new();
    hasher.update(&data);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(40);
    for b in digest {
        hex.push_str(&format!("{:02x}", b));
    }
    Some(hex)
}

/// Resolve a module name to a readable library path and its fingerprint.
pub fn find_module(th: &mut Thread, name: &str) -> Option<(PathBuf, String)> {
    for dir in search_dirs(th) {
        let candidate = dir.join(format!("{}{}{}", LIB_PREFIX, name, LIB_SUFFIX));
        if let Some(sha) = fingerprint(&candidate) {
            return Some((candidate, sha));
        }
    }
    None
}

fn loaded_dict(th: &mut Thread) -> ObjRef {
    let h = th.vm.heap.lock();
    let cl = h.builtin(Builtin::Module);
    let pr = h
        .class_ats(cl, b"loaded", mem_hash(b"loaded"))
        .and_then(|c| c.as_obj());
    match pr {
        Some(r) if h.is_set_shaped(r) => r,
        _ => {
            eprintln!("Missing loaded modules dictionary, system corrupted");
            std::process::abort();
        }
    }
}

/// Load or clone a module into `parent`.  Returns an error message for
/// the module-load exception.
pub fn load(
    th: &mut Thread,
    dst: usize,
    name: &str,
    name_hash: u32,
    filename: &Path,
    sha1_hex: &str,
    parent: ObjRef,
) -> VmResult<Result<(), String>> {
    let vm = th.vm.clone();
    let _guard = vm.module_lock.lock();

    let loaded = loaded_dict(th);
    let existing = {
        let h = th.vm.heap.lock();
        h.dict_ats(loaded, name.as_bytes(), name_hash)
            .and_then(|pr| h.pair_parts(pr).1.as_obj())
    };

    if let Some(m) = existing {
        // Already loaded: fingerprints must agree, then clone sharing the
        // backing dictionary and the library handle.
        let (old_sha, m_name, m_dict, m_filename, m_sha, m_lib) = {
            let h = th.vm.heap.lock();
            let sh = h.module_shape(m);
            (
                sh.sha1.map(|r| h.str_lossy(r)).unwrap_or_default(),
                sh.ns.name,
                sh.ns.dict,
                sh.filename,
                sh.sha1,
                sh.lib.clone(),
            )
        };
        if old_sha != sha1_hex {
            return Ok(Err("SHA1 conflict".into()));
        }
        let (Some(m_name), Some(m_dict), Some(m_filename), Some(m_sha)) =
            (m_name, m_dict, m_filename, m_sha)
        else {
            return Ok(Err("corrupt module".into()));
        };
        let clone = {
            let r = th.vm.heap.lock().module_new(
                th.tid,
                dst,
                m_name,
                Some(parent),
                m_dict,
                m_filename,
                m_sha,
                m_lib,
            );
            th.lift(r)?
        };
        bind_in(th, parent, name, name_hash, clone)?;
        log::debug!("module {}: cloned into new namespace", name);
        return Ok(Ok(()));
    }

    // Fresh load.
    let lib = match unsafe { libloading::Library::new(filename) } {
        Ok(lib) => lib,
        Err(e)  => return Ok(Err(format!("load failed, {}", e))),
    };
    let code_sym = format!("__{}_code__\0", name);
    let init_sym = format!("__{}_init__\0", name);
    let entry: Option<Cell> = unsafe {
        if let Ok(code) = lib.get::<ModuleCodeFn>(code_sym.as_bytes()) {
            let bytes = code();
            let blob = Arc::new(CodeBlob {
                name: name.to_string(),
                code: bytes.to_vec().into_boxed_slice(),
            });
            Some(Cell::new(Value::Method(MethodRef { blob, entry: 0 })))
        } else if let Ok(init) = lib.get::<crate::core::value::CodeFn>(init_sym.as_bytes()) {
            let leaked: &'static str = Box::leak(format!("{}.init", name).into_boxed_str());
            Some(Cell::new(Value::Codemethod(Codemethod { name: leaked, f: *init })))
        } else {
            None
        }
    };
    let Some(entry) = entry else {
        return Ok(Err(format!("cannot find module function __{0}_code__ or __{0}_init__", name)));
    };

    let mark = th.sp();
    let w = th.alloc(3)?;
    th.str_new_hashed(w, name.as_bytes(), name_hash)?;
    th.str_new(w + 1, filename.to_string_lossy().as_bytes())?;
    th.str_new(w + 2, sha1_hex.as_bytes())?;
    let (name_r, filename_r, sha_r) = {
        let h = th.vm.heap.lock();
        (
            h.stack_cell(th.tid, w).unwrap().as_obj().unwrap(),
            h.stack_cell(th.tid, w + 1).unwrap().as_obj().unwrap(),
            h.stack_cell(th.tid, w + 2).unwrap().as_obj().unwrap(),
        )
    };
    let dict_slot = th.alloc(1)?;
    let dict = {
        let r = th.vm.heap.lock().set_new(th.tid, dict_slot, Builtin::Dictionary, 32);
        th.lift(r)?
    };
    let module_lib = Arc::new(ModuleLib { name: name.to_string(), lib });
    let module = {
        let r = th.vm.heap.lock().module_new(
            th.tid,
            dst,
            name_r,
            Some(parent),
            dict,
            filename_r,
            sha_r,
            Some(module_lib),
        );
        th.lift(r)?
    };
    bind_in(th, parent, name, name_hash, module)?;
    th.unwind(mark)?;

    // Run the entry under the module's namespace, the module itself as
    // the one argument.
    let arg = th.push(&Cell::obj(module))?;
    method_run(th, arg, Some(module), None, &entry, 1, arg)?;
    th.free(1)?;

    let cell = th.get(dst)?;
    let _ = th
        .vm
        .heap
        .lock()
        .dict_puts(loaded, name.as_bytes(), name_hash, &cell);
    log::info!("module {} loaded from {}", name, filename.display());
    Ok(Ok(()))
}

fn bind_in(th: &mut Thread, parent: ObjRef, name: &str, hash: u32, module: ObjRef) -> VmResult {
    let stored = {
        let mut h = th.vm.heap.lock();
        h.ns_puts(parent, name.as_bytes(), hash, &Cell::obj(module))
    };
    if stored.is_err() {
        let n = th.alloc(1)?;
        th.str_new_hashed(n, name.as_bytes(), hash)?;
        return Err(except::modify_const(th, parent, n));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Module class methods
// ---------------------------------------------------------------------------

pub fn module_new(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 2)?;
    let name_r = str_arg(th, ap + 1)?;
    let name = th.vm.heap.lock().str_lossy(name_r);
    let hash = str_cell_hash(th, ap + 1)?;
    let parent = {
        let r = th.frames.ns_up(1);
        th.lift(r)?
    };
    let Some((path, sha)) = find_module(th, &name) else {
        return Err(except::module_load(th, ap + 1, "module not found"));
    };
    match load(th, dst, &name, hash, &path, &sha, parent)? {
        Ok(())   => Ok(()),
        Err(msg) => Err(except::module_load(th, ap + 1, &msg)),
    }
}

/// The module containing the caller's namespace.
pub fn module_current(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let _ = ap;
    let ns = {
        let r = th.frames.ns_up(1);
        th.lift(r)?
    };
    let m = {
        let h = th.vm.heap.lock();
        module_cur(&h, Some(ns))
    };
    th.set_obj(dst, m)
}

pub fn module_filename(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let m = module_arg(th, ap)?;
    let f = th.vm.heap.lock().module_shape(m).filename;
    th.set_obj(dst, f)
}

pub fn module_sha1(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let m = module_arg(th, ap)?;
    let s = th.vm.heap.lock().module_shape(m).sha1;
    th.set_obj(dst, s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha1() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("libopalx.so");
        std::fs::write(&p, b"hello world").unwrap();
        let sha = fingerprint(&p).unwrap();
        assert_eq!(sha, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert!(fingerprint(&dir.path().join("missing")).is_none());
    }
}
