//! End-to-end VM tests: dispatch, containers, exceptions, collection.
//!
//! Every test boots a fresh VM and enters the root namespace, the same
//! invariant the CLI driver and module init hooks maintain.

use std::sync::Arc;

use opal::bytecode::{op, Asm};
use opal::core::oop::{self, call_by_selector, MethodDict};
use opal::core::value::{mem_hash, CodeBlob, MethodRef};
use opal::except::{with_catch, Caught};
use opal::{Builtin, Cell, Codemethod, ObjRef, Thread, Value, Vm, VmResult};

fn boot() -> Thread {
    let mut th = Vm::init(0, 0);
    let main = th.vm().clone().heap().main_ns();
    th.enter_ns(main).unwrap();
    th
}

fn main_ns(th: &Thread) -> ObjRef {
    th.vm().clone().heap().main_ns()
}

fn class_of(th: &Thread, b: Builtin) -> ObjRef {
    th.vm().clone().heap().builtin(b)
}

fn str_of(th: &mut Thread, idx: usize) -> String {
    let r = th.get(idx).unwrap().as_obj().expect("expected a string result");
    let vm = th.vm().clone();
    let s = vm.heap().str_lossy(r);
    s
}

fn int_of(th: &mut Thread, idx: usize) -> i64 {
    match th.get(idx).unwrap().value {
        Value::Int(i) => i,
        other => panic!("expected integer, got {:?}", other),
    }
}

fn bool_of(th: &mut Thread, idx: usize) -> bool {
    match th.get(idx).unwrap().value {
        Value::Bool(b) => b,
        other => panic!("expected boolean, got {:?}", other),
    }
}

/// Field of a caught exception object.
fn exc_field(th: &mut Thread, idx: usize, field: &str) -> Option<Cell> {
    let x = th.get(idx).ok()?.as_obj()?;
    let vm = th.vm().clone();
    let h = vm.heap();
    let pr = h.dict_ats(x, field.as_bytes(), mem_hash(field.as_bytes()))?;
    Some(h.pair_parts(pr).1)
}

fn exc_type(th: &mut Thread, idx: usize) -> String {
    let c = exc_field(th, idx, "type").expect("exception without type");
    let r = c.as_obj().expect("type is a string");
    let vm = th.vm().clone();
    let s = vm.heap().str_lossy(r);
    s
}

/// Run `f` expecting a raise; returns the catch slot holding the
/// exception.
fn expect_raise(th: &mut Thread, f: impl FnOnce(&mut Thread) -> VmResult) -> usize {
    let dst = th.alloc(1).unwrap();
    match with_catch(th, dst, f).unwrap() {
        Caught::Except => dst,
        Caught::Ok(()) => panic!("expected an exception"),
    }
}

// ---------------------------------------------------------------------------
// Class hierarchy
// ---------------------------------------------------------------------------

#[test]
fn every_builtin_is_a_subclass_of_object() {
    let th = boot();
    let vm = th.vm().clone();
    let h = vm.heap();
    let object = h.builtin(Builtin::Object);
    for b in Builtin::ALL {
        assert!(h.is_subclass_of(h.builtin(b), object), "{:?}", b);
    }
    assert!(h.is_subclass_of(h.builtin(Builtin::Cdictionary), h.builtin(Builtin::Dictionary)));
    assert!(!h.is_subclass_of(h.builtin(Builtin::Set), h.builtin(Builtin::Dictionary)));
}

#[test]
fn instanceof_resolves_the_raw_class() {
    let mut th = boot();
    let dst = th.alloc(1).unwrap();
    th.push_value(Value::Int(3)).unwrap();
    call_by_selector(&mut th, dst, "instanceof", 1).unwrap();
    assert_eq!(th.get(dst).unwrap().as_obj(), Some(class_of(&th, Builtin::Integer)));
}

// ---------------------------------------------------------------------------
// Strings and slicing
// ---------------------------------------------------------------------------

fn slice_str(th: &mut Thread, s: &str, ofs: i64, len: i64) -> String {
    let mark = th.sp();
    let dst = th.alloc(1).unwrap();
    th.push_str(s.as_bytes()).unwrap();
    th.push_value(Value::Int(ofs)).unwrap();
    th.push_value(Value::Int(len)).unwrap();
    call_by_selector(th, dst, "slice", 3).unwrap();
    let out = str_of(th, dst);
    th.unwind(mark).unwrap();
    out
}

#[test]
fn string_slice_with_negative_offsets() {
    let mut th = boot();
    assert_eq!(slice_str(&mut th, "abcdef", -2, 2), "ef");
    assert_eq!(slice_str(&mut th, "abcdef", 5, -3), "cde");
    assert_eq!(slice_str(&mut th, "abcdef", -1, -3), "cde");
    assert_eq!(slice_str(&mut th, "abcdef", 0, 6), "abcdef");
}

#[test]
fn string_slice_out_of_range_raises() {
    let mut th = boot();
    let caught = expect_raise(&mut th, |th| {
        let d = th.alloc(1)?;
        th.push_str(b"abcdef")?;
        th.push_value(Value::Int(4))?;
        th.push_value(Value::Int(5))?;
        call_by_selector(th, d, "slice", 3)
    });
    assert_eq!(exc_type(&mut th, caught), "system.index-range");
}

#[test]
fn string_integer_base_detection() {
    let mut th = boot();
    let cases: &[(&str, Option<i64>, i64)] = &[
        ("0x1F", None, 31),
        ("0b11", None, 3),
        ("077", None, 63),
        ("123", None, 123),
        ("101", Some(2), 5),
        ("-ff", Some(16), -255),
    ];
    for (text, base, want) in cases {
        let mark = th.sp();
        let dst = th.alloc(1).unwrap();
        th.push_str(text.as_bytes()).unwrap();
        let argc = match base {
            Some(b) => {
                th.push_value(Value::Int(*b)).unwrap();
                2
            }
            None => 1,
        };
        call_by_selector(&mut th, dst, "Integer", argc).unwrap();
        assert_eq!(int_of(&mut th, dst), *want, "{}", text);
        th.unwind(mark).unwrap();
    }
}

#[test]
fn string_integer_rejects_signed_prefix_forms() {
    let mut th = boot();
    let caught = expect_raise(&mut th, |th| {
        let d = th.alloc(1)?;
        th.push_str(b"-0x10")?;
        call_by_selector(th, d, "Integer", 1)
    });
    assert_eq!(exc_type(&mut th, caught), "system.invalid-value");
}

#[test]
fn string_hash_agrees_with_equality() {
    let mut th = boot();
    let h1 = {
        let d = th.alloc(1).unwrap();
        th.push_str(b"selector").unwrap();
        call_by_selector(&mut th, d, "hash", 1).unwrap();
        int_of(&mut th, d)
    };
    let h2 = {
        let d = th.alloc(1).unwrap();
        th.push_str(b"selector").unwrap();
        call_by_selector(&mut th, d, "hash", 1).unwrap();
        int_of(&mut th, d)
    };
    assert_eq!(h1, h2);
    let eq = {
        let d = th.alloc(1).unwrap();
        th.push_str(b"selector").unwrap();
        th.push_str(b"selector").unwrap();
        call_by_selector(&mut th, d, "equal", 2).unwrap();
        bool_of(&mut th, d)
    };
    assert!(eq);
}

#[test]
fn string_format_substitutes_by_index() {
    let mut th = boot();
    let dst = th.alloc(1).unwrap();
    th.push_str(b"x=[0], y=[1]").unwrap();
    th.push_value(Value::Int(4)).unwrap();
    th.push_str(b"yes").unwrap();
    call_by_selector(&mut th, dst, "format", 3).unwrap();
    assert_eq!(str_of(&mut th, dst), "x=4, y=yes");
}

#[test]
fn string_parse_round_trips_literals() {
    let mut th = boot();
    for (text, check) in [
        ("#nil", "isnil"),
        ("(1, 2, 3)", "size"),
    ] {
        let mark = th.sp();
        let dst = th.alloc(1).unwrap();
        th.push_str(text.as_bytes()).unwrap();
        call_by_selector(&mut th, dst, "parse", 1).unwrap();
        let d2 = th.alloc(1).unwrap();
        let parsed = th.get(dst).unwrap();
        th.push(&parsed).unwrap();
        call_by_selector(&mut th, d2, check, 1).unwrap();
        th.unwind(mark).unwrap();
    }
    // A parsed pair writes back in pair syntax.
    let dst = th.alloc(1).unwrap();
    th.push_str(b"<1, \"a\">").unwrap();
    call_by_selector(&mut th, dst, "parse", 1).unwrap();
    let d2 = th.alloc(1).unwrap();
    let parsed = th.get(dst).unwrap();
    th.push(&parsed).unwrap();
    call_by_selector(&mut th, d2, "write", 1).unwrap();
    assert_eq!(str_of(&mut th, d2), "<1, \"a\">");
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

/// Build a list of integers; leaves it in `dst`.
fn int_list(th: &mut Thread, dst: usize, items: &[i64]) {
    th.set_nil(dst).unwrap();
    let mut tail = None;
    for v in items.iter().rev() {
        tail = Some(th.list_new(dst, &Cell::int(*v), tail).unwrap());
    }
}

fn lists_equal(th: &mut Thread, a: usize, b: usize) -> bool {
    let d = th.alloc(1).unwrap();
    let ca = th.get(a).unwrap();
    let cb = th.get(b).unwrap();
    th.push(&ca).unwrap();
    th.push(&cb).unwrap();
    call_by_selector(th, d, "equal", 2).unwrap();
    let out = bool_of(th, d);
    th.free(3).unwrap();
    out
}

#[test]
fn list_reverse_is_involutive() {
    let mut th = boot();
    let l = th.alloc(1).unwrap();
    int_list(&mut th, l, &[1, 2, 3, 4]);
    let r1 = th.alloc(1).unwrap();
    let c = th.get(l).unwrap();
    th.push(&c).unwrap();
    call_by_selector(&mut th, r1, "reverse", 1).unwrap();
    th.free(1).unwrap();
    let r2 = th.alloc(1).unwrap();
    let c = th.get(r1).unwrap();
    th.push(&c).unwrap();
    call_by_selector(&mut th, r2, "reverse", 1).unwrap();
    th.free(1).unwrap();
    assert!(lists_equal(&mut th, l, r2));
}

#[test]
fn list_concat_is_associative() {
    let mut th = boot();
    let a = th.alloc(1).unwrap();
    let b = th.alloc(1).unwrap();
    let c = th.alloc(1).unwrap();
    int_list(&mut th, a, &[1]);
    int_list(&mut th, b, &[2, 3]);
    int_list(&mut th, c, &[4]);

    let concat = |th: &mut Thread, x: usize, y: usize| -> usize {
        let slot = th.alloc(1).unwrap();
        let d = th.alloc(1).unwrap();
        let cx = th.get(x).unwrap();
        let cy = th.get(y).unwrap();
        th.push(&cx).unwrap();
        th.push(&cy).unwrap();
        call_by_selector(th, d, "concat", 2).unwrap();
        th.copy(slot, d).unwrap();
        th.unwind(slot + 1).unwrap();
        slot
    };
    let ab = concat(&mut th, a, b);
    let ab_c = concat(&mut th, ab, c);
    let bc = concat(&mut th, b, c);
    let a_bc = concat(&mut th, a, bc);
    assert!(lists_equal(&mut th, ab_c, a_bc));
}

#[test]
fn list_concat_shares_the_second_operand() {
    let mut th = boot();
    let a = th.alloc(1).unwrap();
    let b = th.alloc(1).unwrap();
    int_list(&mut th, a, &[1]);
    int_list(&mut th, b, &[2, 3]);
    let d = th.alloc(1).unwrap();
    let ca = th.get(a).unwrap();
    let cb = th.get(b).unwrap();
    th.push(&ca).unwrap();
    th.push(&cb).unwrap();
    call_by_selector(&mut th, d, "concat", 2).unwrap();
    let head = th.get(d).unwrap().as_obj().unwrap();
    let vm = th.vm().clone();
    let h = vm.heap();
    let shared = h.list_next(head);
    assert_eq!(shared, th.get(b).unwrap().as_obj());
}

#[test]
fn copydeep_yields_equal_but_unshared_structure() {
    let mut th = boot();
    let inner = th.alloc(1).unwrap();
    int_list(&mut th, inner, &[2, 3]);
    let outer = th.alloc(1).unwrap();
    let ic = th.get(inner).unwrap();
    let tail = th.list_new(outer, &ic, None).unwrap();
    th.list_new(outer, &Cell::int(1), Some(tail)).unwrap();

    let copy = th.alloc(1).unwrap();
    let oc = th.get(outer).unwrap();
    th.push(&oc).unwrap();
    call_by_selector(&mut th, copy, "copydeep", 1).unwrap();
    th.free(1).unwrap();

    assert!(lists_equal(&mut th, outer, copy));
    let (o, c) = (
        th.get(outer).unwrap().as_obj().unwrap(),
        th.get(copy).unwrap().as_obj().unwrap(),
    );
    assert_ne!(o, c);
    let vm = th.vm().clone();
    let h = vm.heap();
    let o_inner = h.list_item(h.list_next(o).unwrap()).as_obj().unwrap();
    let c_inner = h.list_item(h.list_next(c).unwrap()).as_obj().unwrap();
    assert_ne!(o_inner, c_inner, "deep copy must not share the inner list");
}

#[test]
fn list_write_formats_elements() {
    let mut th = boot();
    let l = th.alloc(1).unwrap();
    int_list(&mut th, l, &[1, 2]);
    let d = th.alloc(1).unwrap();
    let c = th.get(l).unwrap();
    th.push(&c).unwrap();
    call_by_selector(&mut th, d, "write", 1).unwrap();
    assert_eq!(str_of(&mut th, d), "(1, 2)");
}

// ---------------------------------------------------------------------------
// Dictionaries
// ---------------------------------------------------------------------------

fn dict_new(th: &mut Thread) -> usize {
    let dst = th.alloc(1).unwrap();
    th.push_obj(Some(class_of(th, Builtin::Dictionary))).unwrap();
    call_by_selector(th, dst, "new", 1).unwrap();
    th.free(1).unwrap();
    dst
}

fn dict_atput_str(th: &mut Thread, d: usize, key: &str, val: i64) -> VmResult {
    let mark = th.sp();
    let w = th.alloc(1)?;
    let dc = th.get(d)?;
    th.push(&dc)?;
    th.push_str(key.as_bytes())?;
    th.push_value(Value::Int(val))?;
    call_by_selector(th, w, "atput", 3)?;
    th.unwind(mark)
}

fn dict_ate_str(th: &mut Thread, d: usize, key: &str) -> VmResult<i64> {
    let mark = th.sp();
    let w = th.alloc(1)?;
    let dc = th.get(d)?;
    th.push(&dc)?;
    th.push_str(key.as_bytes())?;
    call_by_selector(th, w, "ate", 2)?;
    let out = int_of(th, w);
    th.unwind(mark)?;
    Ok(out)
}

#[test]
fn dictionary_round_trip() {
    let mut th = boot();
    let d = dict_new(&mut th);
    dict_atput_str(&mut th, d, "alpha", 1).unwrap();
    dict_atput_str(&mut th, d, "beta", 2).unwrap();
    assert_eq!(dict_ate_str(&mut th, d, "alpha").unwrap(), 1);
    assert_eq!(dict_ate_str(&mut th, d, "beta").unwrap(), 2);
    dict_atput_str(&mut th, d, "alpha", 9).unwrap();
    assert_eq!(dict_ate_str(&mut th, d, "alpha").unwrap(), 9);
}

#[test]
fn dictionary_missing_key_raises_key_not_found() {
    let mut th = boot();
    let d = dict_new(&mut th);
    let caught = expect_raise(&mut th, |th| {
        let w = th.alloc(1)?;
        let dc = th.get(d)?;
        th.push(&dc)?;
        th.push_str(b"missing")?;
        call_by_selector(th, w, "ate", 2)
    });
    assert_eq!(exc_type(&mut th, caught), "system.key-not-found");
}

#[test]
fn constant_named_keys_reject_reassignment() {
    let mut th = boot();
    let d = dict_new(&mut th);
    dict_atput_str(&mut th, d, "#K", 1).unwrap();
    assert_eq!(dict_ate_str(&mut th, d, "#K").unwrap(), 1);
    let d_obj = th.get(d).unwrap().as_obj().unwrap();
    let caught = expect_raise(&mut th, |th| dict_atput_str(th, d, "#K", 2));
    assert_eq!(exc_type(&mut th, caught), "system.modify-constant");
    let inst = exc_field(&mut th, caught, "instance").unwrap();
    assert_eq!(inst.as_obj(), Some(d_obj));
    let key = exc_field(&mut th, caught, "key").unwrap();
    let vm = th.vm().clone();
    assert_eq!(vm.heap().str_lossy(key.as_obj().unwrap()), "#K");
}

#[test]
fn reassignment_allocates_a_fresh_pair() {
    let mut th = boot();
    let d = dict_new(&mut th);
    dict_atput_str(&mut th, d, "k", 1).unwrap();
    // Hold the binding pair, then overwrite the key.
    let pair_slot = th.alloc(1).unwrap();
    {
        let dc = th.get(d).unwrap();
        th.push(&dc).unwrap();
        th.push_str(b"k").unwrap();
        call_by_selector(&mut th, pair_slot, "at", 2).unwrap();
        th.free(2).unwrap();
    }
    let old_pair = th.get(pair_slot).unwrap().as_obj().unwrap();
    dict_atput_str(&mut th, d, "k", 2).unwrap();
    let vm = th.vm().clone();
    let h = vm.heap();
    // The external holder still observes the old value.
    let (_, old_val) = h.pair_parts(old_pair);
    assert!(matches!(old_val.value, Value::Int(1)));
}

// ---------------------------------------------------------------------------
// User classes, dispatch privacy, attribute access
// ---------------------------------------------------------------------------

fn hidden_codemethod(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let _ = ap;
    th.set_value(dst, Value::Int(42))
}

fn callit_codemethod(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    oop::argc_chk_exact(th, argc, 1)?;
    let recvr = th.get(ap)?;
    th.push(&recvr)?;
    call_by_selector(th, dst, "_hidden", 1)
}

/// Create a user class through the metaclass, as byte-code would.
fn make_class(th: &mut Thread, name: &str, parent: Builtin) -> ObjRef {
    let dst = th.alloc(1).unwrap();
    th.push_obj(Some(class_of(th, Builtin::Metaclass))).unwrap();
    th.push_str(name.as_bytes()).unwrap();
    th.push_obj(Some(class_of(th, parent))).unwrap();
    call_by_selector(th, dst, "new", 3).unwrap();
    th.free(3).unwrap();
    th.get(dst).unwrap().as_obj().unwrap()
}

fn make_instance(th: &mut Thread, cl: ObjRef) -> usize {
    let dst = th.alloc(1).unwrap();
    th.push_obj(Some(cl)).unwrap();
    call_by_selector(th, dst, "new", 1).unwrap();
    th.free(1).unwrap();
    dst
}

#[test]
fn private_selectors_dispatch_only_from_the_owning_class() {
    let mut th = boot();
    let a = make_class(&mut th, "A", Builtin::Object);
    oop::method_add(&mut th, a, MethodDict::Instance, "_hidden", "main.A._hidden", hidden_codemethod);
    oop::method_add(&mut th, a, MethodDict::Instance, "callit", "main.A.callit", callit_codemethod);
    let inst = make_instance(&mut th, a);

    // From outside class A the private selector is invisible.
    let inst_cell = th.get(inst).unwrap();
    let caught = expect_raise(&mut th, |th| {
        let w = th.alloc(1)?;
        th.push(&inst_cell)?;
        call_by_selector(th, w, "_hidden", 1)
    });
    assert_eq!(exc_type(&mut th, caught), "system.no-method");

    // Through a method of A it dispatches.
    let w = th.alloc(1).unwrap();
    let inst_cell = th.get(inst).unwrap();
    th.push(&inst_cell).unwrap();
    call_by_selector(&mut th, w, "callit", 1).unwrap();
    assert_eq!(int_of(&mut th, w), 42);
}

#[test]
fn user_instances_initialize_from_a_dictionary() {
    let mut th = boot();
    let a = make_class(&mut th, "Point", Builtin::Object);
    let d = dict_new(&mut th);
    dict_atput_str(&mut th, d, "x", 5).unwrap();

    let dst = th.alloc(1).unwrap();
    th.push_obj(Some(a)).unwrap();
    let dc = th.get(d).unwrap();
    th.push(&dc).unwrap();
    call_by_selector(&mut th, dst, "new", 2).unwrap();
    th.free(2).unwrap();

    let w = th.alloc(1).unwrap();
    let ic = th.get(dst).unwrap();
    th.push(&ic).unwrap();
    th.push_str(b"x").unwrap();
    call_by_selector(&mut th, w, "ate", 2).unwrap();
    assert_eq!(int_of(&mut th, w), 5);

    // instanceof resolves through __instanceof__.
    let w2 = th.alloc(1).unwrap();
    let ic = th.get(dst).unwrap();
    th.push(&ic).unwrap();
    call_by_selector(&mut th, w2, "instanceof", 1).unwrap();
    assert_eq!(th.get(w2).unwrap().as_obj(), Some(a));
}

#[test]
fn missing_attribute_raises_no_attribute() {
    let mut th = boot();
    let a = make_class(&mut th, "Empty", Builtin::Object);
    let inst = make_instance(&mut th, a);
    let inst_cell = th.get(inst).unwrap();
    let caught = expect_raise(&mut th, |th| {
        let w = th.alloc(1)?;
        th.push(&inst_cell)?;
        th.push_str(b"nothing")?;
        call_by_selector(th, w, "ate", 2)
    });
    assert_eq!(exc_type(&mut th, caught), "system.no-attribute");
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

#[test]
fn catch_delivers_the_exact_raised_object() {
    let mut th = boot();
    // Build an exception instance first.
    let x = th.alloc(1).unwrap();
    th.push_obj(Some(class_of(&th, Builtin::Exception))).unwrap();
    th.push_str(b"app.custom").unwrap();
    call_by_selector(&mut th, x, "new", 2).unwrap();
    th.free(2).unwrap();
    let x_obj = th.get(x).unwrap().as_obj().unwrap();

    let xc = th.get(x).unwrap();
    let caught = expect_raise(&mut th, |th| {
        let w = th.alloc(1)?;
        th.push(&xc)?;
        call_by_selector(th, w, "raise", 1)
    });
    assert_eq!(th.get(caught).unwrap().as_obj(), Some(x_obj));
    assert_eq!(exc_type(&mut th, caught), "app.custom");
}

#[test]
fn wrong_argument_count_raises_with_expected_and_got() {
    let mut th = boot();
    let caught = expect_raise(&mut th, |th| {
        let w = th.alloc(1)?;
        th.push_obj(None)?;
        // cons takes a receiver and one element.
        call_by_selector(th, w, "cons", 1)
    });
    assert_eq!(exc_type(&mut th, caught), "system.number-of-arguments");
    assert!(matches!(
        exc_field(&mut th, caught, "expected").unwrap().value,
        Value::Int(2)
    ));
    assert!(matches!(
        exc_field(&mut th, caught, "got").unwrap().value,
        Value::Int(1)
    ));
}

#[test]
fn unknown_selector_raises_no_method_with_selector_field() {
    let mut th = boot();
    let caught = expect_raise(&mut th, |th| {
        let w = th.alloc(1)?;
        th.push_value(Value::Int(1))?;
        call_by_selector(th, w, "frobnicate", 1)
    });
    assert_eq!(exc_type(&mut th, caught), "system.no-method");
    let sel = exc_field(&mut th, caught, "selector").unwrap().as_obj().unwrap();
    let vm = th.vm().clone();
    assert_eq!(vm.heap().str_lossy(sel), "frobnicate");
}

#[test]
fn descent_loop_is_detected_on_cyclic_write() {
    let mut th = boot();
    let slot = th.alloc(1).unwrap();
    let a = th.array_new(slot, Builtin::Array, 1).unwrap();
    // a[0] = a
    {
        let w = th.alloc(1).unwrap();
        th.push_obj(Some(a)).unwrap();
        th.push_value(Value::Int(0)).unwrap();
        th.push_obj(Some(a)).unwrap();
        call_by_selector(&mut th, w, "atput", 3).unwrap();
        th.unwind(w).unwrap();
    }
    let caught = expect_raise(&mut th, |th| {
        let w = th.alloc(1)?;
        th.push_obj(Some(a))?;
        call_by_selector(th, w, "write", 1)
    });
    assert_eq!(exc_type(&mut th, caught), "system.descent-loop");
}

#[test]
fn reraise_propagates_one_catch_frame_up() {
    let mut th = boot();
    // Byte-code method: catch, then reraise without popping the frame.
    let mut a = Asm::new();
    a.stack_alloc(1);
    a.op(op::CATCH_PUSH).sp(0);
    let to_handler = a.branch(op::BR_EXCEPT);
    a.push_nil();
    a.call_to(|a| { a.sp(1); }, "car", 1);
    a.ret();
    let handler = a.here();
    a.op(op::RERAISE);
    a.patch(to_handler, handler);
    let m = method_of(a, "test.rethrower");

    let outer = th.alloc(1).unwrap();
    let r = with_catch(&mut th, outer, |th| {
        let dst = th.alloc(1)?;
        let arg = th.push_obj(None)?;
        oop::method_run(th, dst, None, None, &m, 1, arg)
    })
    .unwrap();
    assert!(matches!(r, Caught::Except));
    assert_eq!(exc_type(&mut th, outer), "system.invalid-value");
}

#[test]
fn nested_catch_frames_catch_innermost_first() {
    let mut th = boot();
    let outer = th.alloc(1).unwrap();
    let r = with_catch(&mut th, outer, |th| {
        let inner = th.alloc(1)?;
        let caught = with_catch(th, inner, |th| {
            let w = th.alloc(1)?;
            th.push_obj(None)?;
            call_by_selector(th, w, "car", 1)
        })?;
        assert!(matches!(caught, Caught::Except));
        assert_eq!(exc_type(th, inner), "system.invalid-value");
        Ok(())
    })
    .unwrap();
    assert!(matches!(r, Caught::Ok(())));
}

// ---------------------------------------------------------------------------
// Garbage collection
// ---------------------------------------------------------------------------

#[test]
fn cycles_are_collected_by_the_mark_sweep_pass() {
    let mut th = boot();
    let mark = th.sp();
    let sa = th.alloc(1).unwrap();
    let sb = th.alloc(1).unwrap();
    let a = th.array_new(sa, Builtin::Array, 1).unwrap();
    let b = th.array_new(sb, Builtin::Array, 1).unwrap();
    {
        let vm = th.vm().clone();
        let mut h = vm.heap();
        h.array_set(a, 0, &Cell::obj(b));
        h.array_set(b, 0, &Cell::obj(a));
    }
    let live_with_cycle = th.vm().clone().heap().live_count();
    // Drop the only external references; the cycle keeps itself alive
    // under pure reference counting.
    th.unwind(mark).unwrap();
    assert_eq!(th.vm().clone().heap().live_count(), live_with_cycle);
    th.vm().clone().heap().collect();
    assert_eq!(th.vm().clone().heap().live_count(), live_with_cycle - 2);
}

#[test]
fn acyclic_garbage_is_reclaimed_by_counting_alone() {
    let mut th = boot();
    let baseline = th.vm().clone().heap().live_count();
    let mark = th.sp();
    let s = th.alloc(1).unwrap();
    th.str_new(s, b"transient").unwrap();
    assert_eq!(th.vm().clone().heap().live_count(), baseline + 1);
    th.unwind(mark).unwrap();
    assert_eq!(th.vm().clone().heap().live_count(), baseline);
}

#[test]
fn collection_preserves_reachable_objects() {
    let mut th = boot();
    let s = th.alloc(1).unwrap();
    th.str_new(s, b"keep me").unwrap();
    th.vm().clone().heap().collect();
    assert_eq!(str_of(&mut th, s), "keep me");
    // A second pass is just as harmless.
    th.vm().clone().heap().collect();
    assert_eq!(str_of(&mut th, s), "keep me");
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

fn method_of(asm: Asm, name: &str) -> Cell {
    let blob = Arc::new(CodeBlob { name: name.into(), code: asm.finish() });
    Cell::new(Value::Method(MethodRef { blob, entry: 0 }))
}

#[test]
fn interpreter_dispatches_and_returns() {
    let mut th = boot();
    let mut a = Asm::new();
    a.argc_chk(1);
    a.op(op::PUSH).arg(0);
    a.push_int(2);
    a.call_to(|a| { a.dst(); }, "add", 2);
    a.ret();
    let m = method_of(a, "test.add2");

    let dst = th.alloc(1).unwrap();
    let arg = th.push_value(Value::Int(40)).unwrap();
    oop::method_run(&mut th, dst, None, None, &m, 1, arg).unwrap();
    assert_eq!(int_of(&mut th, dst), 42);
}

#[test]
fn interpreter_argc_check_raises() {
    let mut th = boot();
    let mut a = Asm::new();
    a.argc_chk(2);
    a.ret();
    let m = method_of(a, "test.wants2");

    let caught = expect_raise(&mut th, |th| {
        let dst = th.alloc(1)?;
        let arg = th.push_value(Value::Int(1))?;
        oop::method_run(th, dst, None, None, &m, 1, arg)
    });
    assert_eq!(exc_type(&mut th, caught), "system.number-of-arguments");
}

#[test]
fn interpreter_catches_and_resumes() {
    let mut th = boot();
    let mut a = Asm::new();
    a.stack_alloc(1);                       // caught slot
    a.op(op::CATCH_PUSH).sp(0);
    let to_handler = a.branch(op::BR_EXCEPT);
    a.push_nil();
    a.call_to(|a| { a.sp(1); }, "car", 1);  // raises system.invalid-value
    a.ret();
    let handler = a.here();
    a.op(op::CATCH_POP);
    a.op(op::ASSIGN).dst().sp(0);
    a.ret();
    a.patch(to_handler, handler);
    let m = method_of(a, "test.catcher");

    let dst = th.alloc(1).unwrap();
    let arg = th.push_obj(None).unwrap();
    oop::method_run(&mut th, dst, None, None, &m, 1, arg).unwrap();
    assert_eq!(exc_type(&mut th, dst), "system.invalid-value");
}

#[test]
fn interpreter_branches_on_booleans() {
    let mut th = boot();
    let mut a = Asm::new();
    // if arg0 then 1 else 2
    a.op(op::PUSH).arg(0);
    let to_true = a.branch(op::BR_TRUE_POP);
    a.op(op::INT).dst().int(2);
    a.ret();
    let t = a.here();
    a.op(op::INT).dst().int(1);
    a.ret();
    a.patch(to_true, t);
    let m = method_of(a, "test.select");

    for (input, want) in [(true, 1), (false, 2)] {
        let mark = th.sp();
        let dst = th.alloc(1).unwrap();
        let arg = th.push_value(Value::Bool(input)).unwrap();
        oop::method_run(&mut th, dst, None, None, &m, 1, arg).unwrap();
        assert_eq!(int_of(&mut th, dst), want);
        th.unwind(mark).unwrap();
    }
}

#[test]
fn invalid_instruction_kills_a_worker_thread() {
    let th = boot();
    let vm = th.vm().clone();
    let mut worker = vm.thread_create(0, 0);
    let main = main_ns(&th);
    let mut a = Asm::new();
    a.op(0x3f); // undecodable
    let m = method_of(a, "test.bad");

    worker.push_obj(Some(main)).unwrap();
    worker.push(&m).unwrap();
    worker.push_obj(None).unwrap(); // result slot
    worker.push_obj(None).unwrap(); // one argument
    let code = worker.spawn().join().unwrap();
    assert_eq!(code, opal::Fatal::InvalidOpcode.exit_code() as i64);
}

// ---------------------------------------------------------------------------
// Environment and namespaces
// ---------------------------------------------------------------------------

#[test]
fn environment_stores_into_the_active_namespace() {
    let mut th = boot();
    let env = class_of(&th, Builtin::Environment);
    {
        let w = th.alloc(1).unwrap();
        th.push_obj(Some(env)).unwrap();
        th.push_str(b"answer").unwrap();
        th.push_value(Value::Int(41)).unwrap();
        call_by_selector(&mut th, w, "atput", 3).unwrap();
        th.unwind(w).unwrap();
    }
    let w = th.alloc(1).unwrap();
    th.push_obj(Some(env)).unwrap();
    th.push_str(b"answer").unwrap();
    call_by_selector(&mut th, w, "ate", 2).unwrap();
    assert_eq!(int_of(&mut th, w), 41);
}

#[test]
fn environment_missing_name_raises_no_variable() {
    let mut th = boot();
    let env = class_of(&th, Builtin::Environment);
    let caught = expect_raise(&mut th, |th| {
        let w = th.alloc(1)?;
        th.push_obj(Some(env))?;
        th.push_str(b"nope")?;
        call_by_selector(th, w, "ate", 2)
    });
    assert_eq!(exc_type(&mut th, caught), "system.no-variable");
}

#[test]
fn class_bindings_resolve_through_the_environment() {
    let mut th = boot();
    let env = class_of(&th, Builtin::Environment);
    let w = th.alloc(1).unwrap();
    th.push_obj(Some(env)).unwrap();
    th.push_str(b"#Integer").unwrap();
    call_by_selector(&mut th, w, "ate", 2).unwrap();
    assert_eq!(th.get(w).unwrap().as_obj(), Some(class_of(&th, Builtin::Integer)));
}

#[test]
fn namespace_write_elides_the_root() {
    let mut th = boot();
    let main = main_ns(&th);
    let dst = th.alloc(1).unwrap();
    th.push_obj(Some(class_of(&th, Builtin::Namespace))).unwrap();
    th.push_str(b"inner").unwrap();
    th.push_obj(Some(main)).unwrap();
    call_by_selector(&mut th, dst, "new", 3).unwrap();
    th.free(3).unwrap();

    let w = th.alloc(1).unwrap();
    let nc = th.get(dst).unwrap();
    th.push(&nc).unwrap();
    call_by_selector(&mut th, w, "write", 1).unwrap();
    assert_eq!(str_of(&mut th, w), "inner");
}

// ---------------------------------------------------------------------------
// Static run and worker threads
// ---------------------------------------------------------------------------

fn static_init(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    let _ = (dst, argc, ap);
    let main = th.vm().clone().heap().main_ns();
    let slot = th.alloc(1)?;
    let cl = opal::intrinsics::metaclass::class_new(
        th,
        slot,
        main,
        b"Start",
        mem_hash(b"Start"),
        Some(th.vm().clone().heap().builtin(Builtin::Object)),
    )?;
    oop::method_add(th, cl, MethodDict::Class, "start", "static.Start.start", static_start);
    Ok(())
}

fn static_start(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    let _ = ap;
    // Receiver plus the string arguments.
    th.set_value(dst, Value::Int(argc as i64 * 10))
}

#[test]
fn run_static_executes_the_entry_method() {
    let mut th = Vm::init(0, 0);
    let dst = th.alloc(1).unwrap();
    let init = Codemethod { name: "static.init", f: static_init };
    let entry = Codemethod { name: "static.start", f: static_start };
    opal::run_static(&mut th, dst, init, entry, &["a".into(), "b".into()]).unwrap();
    // Namespace receiver + two argument strings.
    assert_eq!(opal::exit_code_of(&mut th, dst), 30);
}

fn worker_sum(th: &mut Thread, dst: usize, argc: usize, ap: usize) -> VmResult {
    let mut sum = 0;
    for i in 0..argc {
        if let Value::Int(v) = th.get(ap + i)?.value {
            sum += v;
        }
    }
    th.set_value(dst, Value::Int(sum))
}

#[test]
fn worker_threads_share_the_heap_and_join_with_their_result() {
    let th = boot();
    let vm = th.vm().clone();
    let main = main_ns(&th);

    let mut handles = Vec::new();
    for n in 0..4i64 {
        let mut worker = vm.thread_create(0, 0);
        worker.push_obj(Some(main)).unwrap();
        worker
            .push_value(Value::Codemethod(Codemethod { name: "test.sum", f: worker_sum }))
            .unwrap();
        worker.push_obj(None).unwrap();
        worker.push_value(Value::Int(n)).unwrap();
        worker.push_value(Value::Int(40)).unwrap();
        handles.push((n, worker.spawn()));
    }
    for (n, h) in handles {
        assert_eq!(h.join().unwrap(), 40 + n);
    }
}

#[test]
fn module_not_found_reports_the_documented_error_code() {
    let mut th = Vm::init(0, 0);
    let dst = th.alloc(1).unwrap();
    let err = opal::run(&mut th, dst, "no_such_module", "Start", "start", &[]).unwrap_err();
    assert_eq!(err.code(), -2);
}
