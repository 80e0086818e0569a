/// Cells and tagged values
///
/// A cell is the unit of storage on the value stack and inside containers.
/// It carries an atom (boolean, integer, float, method pointer) or an
/// object reference, plus a cached hash with a validity flag.  Nil is the
/// absent object reference.
///
/// Cells never own their referenced object by Rust means; reference counts
/// are maintained explicitly by the heap when a cell is assigned or
/// released, so plain `Cell` clones held as locals are uncounted and only
/// valid while the source stays rooted.

use std::fmt;
use std::sync::Arc;

use crate::errors::VmResult;
use crate::thread::Thread;

/// CRC-32 of the raw bytes; the one hash function of the VM.  Selector
/// hashes embedded in byte-code use the same function.
#[inline]
pub fn mem_hash(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// ---------------------------------------------------------------------------
// Object references
// ---------------------------------------------------------------------------

/// Index of an object slot in the heap table.  Copyable and uncounted;
/// retain/release bookkeeping happens at the cell level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// A compiled byte-code blob, shared by every method pointer into it.
pub struct CodeBlob {
    /// Symbolic origin, e.g. the module name; used in backtraces and
    /// invalid-instruction reports.
    pub name: String,
    pub code: Box<[u8]>,
}

impl fmt::Debug for CodeBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeBlob({}, {} bytes)", self.name, self.code.len())
    }
}

/// Byte-code method pointer: a blob plus an entry offset.
#[derive(Clone, Debug)]
pub struct MethodRef {
    pub blob: Arc<CodeBlob>,
    pub entry: usize,
}

impl MethodRef {
    pub fn symbol(&self) -> String {
        if self.entry == 0 {
            self.blob.name.clone()
        } else {
            format!("{}+{:#x}", self.blob.name, self.entry)
        }
    }
}

impl PartialEq for MethodRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.blob, &other.blob) && self.entry == other.entry
    }
}

/// Native code-method signature: thread, destination stack slot, argument
/// count and stack index of the first argument (the receiver).
pub type CodeFn = fn(&mut Thread, usize, usize, usize) -> VmResult;

/// Native code-method pointer with its symbolic name.
#[derive(Clone, Copy)]
pub struct Codemethod {
    pub name: &'static str,
    pub f: CodeFn,
}

impl fmt::Debug for Codemethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Codemethod({})", self.name)
    }
}

// ---------------------------------------------------------------------------
// Values and cells
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub enum Value {
    /// Object reference; `None` is nil.
    Obj(Option<ObjRef>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Method(MethodRef),
    Codemethod(Codemethod),
}

impl Value {
    pub const NIL: Value = Value::Obj(None);

    #[inline]
    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => *r,
            _             => None,
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Obj(None))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Obj(_)        => "object",
            Value::Bool(_)       => "boolean",
            Value::Int(_)        => "integer",
            Value::Float(_)      => "float",
            Value::Method(_)     => "method",
            Value::Codemethod(_) => "codemethod",
        }
    }
}

/// Tagged value slot with a cached hash.
#[derive(Clone, Debug)]
pub struct Cell {
    pub value: Value,
    pub hash: Option<u32>,
}

impl Cell {
    pub const fn nil() -> Cell {
        Cell { value: Value::NIL, hash: None }
    }

    pub fn new(value: Value) -> Cell {
        Cell { value, hash: None }
    }

    pub fn with_hash(value: Value, hash: u32) -> Cell {
        Cell { value, hash: Some(hash) }
    }

    #[inline]
    pub fn obj(r: ObjRef) -> Cell {
        Cell::new(Value::Obj(Some(r)))
    }

    #[inline]
    pub fn opt_obj(r: Option<ObjRef>) -> Cell {
        Cell::new(Value::Obj(r))
    }

    #[inline]
    pub fn int(i: i64) -> Cell {
        Cell::new(Value::Int(i))
    }

    #[inline]
    pub fn bool(b: bool) -> Cell {
        Cell::new(Value::Bool(b))
    }

    #[inline]
    pub fn float(f: f64) -> Cell {
        Cell::new(Value::Float(f))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.value.is_nil()
    }

    #[inline]
    pub fn as_obj(&self) -> Option<ObjRef> {
        self.value.as_obj()
    }

    /// True when the cell holds a method or code-method, the only values
    /// dispatch will execute.
    pub fn is_callable(&self) -> bool {
        matches!(self.value, Value::Method(_) | Value::Codemethod(_))
    }
}

impl Default for Cell {
    fn default() -> Cell {
        Cell::nil()
    }
}

// ---------------------------------------------------------------------------
// Built-in class identifiers
// ---------------------------------------------------------------------------

/// Identity of each built-in class in the constants table.  The order is
/// the bootstrap order; `Metaclass` must come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Metaclass,
    Object,
    Boolean,
    Integer,
    Float,
    Method,
    Codemethod,
    String,
    Pair,
    List,
    Array,
    Carray,
    Bytearray,
    Cbytearray,
    Slice,
    Cslice,
    Set,
    Cset,
    Dictionary,
    Cdictionary,
    Namespace,
    Module,
    User,
    File,
    Exception,
    System,
    Environment,
}

pub const BUILTIN_COUNT: usize = 27;

impl Builtin {
    pub const ALL: [Builtin; BUILTIN_COUNT] = [
        Builtin::Metaclass,
        Builtin::Object,
        Builtin::Boolean,
        Builtin::Integer,
        Builtin::Float,
        Builtin::Method,
        Builtin::Codemethod,
        Builtin::String,
        Builtin::Pair,
        Builtin::List,
        Builtin::Array,
        Builtin::Carray,
        Builtin::Bytearray,
        Builtin::Cbytearray,
        Builtin::Slice,
        Builtin::Cslice,
        Builtin::Set,
        Builtin::Cset,
        Builtin::Dictionary,
        Builtin::Cdictionary,
        Builtin::Namespace,
        Builtin::Module,
        Builtin::User,
        Builtin::File,
        Builtin::Exception,
        Builtin::System,
        Builtin::Environment,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Class name as visible from the language; `#`-prefixed so the
    /// bindings in the root namespace are constant dictionary keys.
    pub fn class_name(self) -> &'static str {
        match self {
            Builtin::Metaclass   => "#Metaclass",
            Builtin::Object      => "#Object",
            Builtin::Boolean     => "#Boolean",
            Builtin::Integer     => "#Integer",
            Builtin::Float       => "#Float",
            Builtin::Method      => "#Method",
            Builtin::Codemethod  => "#Codemethod",
            Builtin::String         => "#String",
            Builtin::Pair        => "#Pair",
            Builtin::List        => "#List",
            Builtin::Array       => "#Array",
            Builtin::Carray      => "#Carray",
            Builtin::Bytearray   => "#Bytearray",
            Builtin::Cbytearray  => "#Cbytearray",
            Builtin::Slice       => "#Slice",
            Builtin::Cslice      => "#Cslice",
            Builtin::Set         => "#Set",
            Builtin::Cset        => "#Cset",
            Builtin::Dictionary  => "#Dictionary",
            Builtin::Cdictionary => "#Cdictionary",
            Builtin::Namespace   => "#Namespace",
            Builtin::Module      => "#Module",
            Builtin::User        => "#__User_Class",
            Builtin::File        => "#File",
            Builtin::Exception   => "#Exception",
            Builtin::System      => "#System",
            Builtin::Environment => "#Environment",
        }
    }

    /// Parent class in the built-in hierarchy; `None` only for Object.
    pub fn parent(self) -> Option<Builtin> {
        match self {
            Builtin::Object      => None,
            Builtin::Carray      => Some(Builtin::Array),
            Builtin::Cbytearray  => Some(Builtin::Bytearray),
            Builtin::Cslice      => Some(Builtin::Slice),
            Builtin::Cset        => Some(Builtin::Set),
            Builtin::Cdictionary => Some(Builtin::Dictionary),
            Builtin::Module      => Some(Builtin::Namespace),
            Builtin::Exception   => Some(Builtin::User),
            _                    => Some(Builtin::Object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_cell_is_nil() {
        assert!(Cell::nil().is_nil());
        assert!(!Cell::int(0).is_nil());
        assert!(!Cell::bool(false).is_nil());
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(mem_hash(b"equal"), mem_hash(b"equal"));
        assert_ne!(mem_hash(b"equal"), mem_hash(b"write"));
    }

    #[test]
    fn builtin_parent_chain_reaches_object() {
        for b in Builtin::ALL {
            let mut cur = b;
            let mut steps = 0;
            while let Some(p) = cur.parent() {
                cur = p;
                steps += 1;
                assert!(steps < 8);
            }
            assert_eq!(cur, Builtin::Object);
        }
    }
}
