/// Parsing strings into instances
///
/// The literal grammar of the language's external value syntax: `#nil`,
/// `#true`/`#false`, integers with 0b/0x/0-octal prefixes, floats, quoted
/// strings with escapes, pairs `<a, b>`, lists `(...)`, arrays `[...]`,
/// sets and dictionaries `{...}`, and `Name@{...}` object literals that
/// resolve the class through the Environment.
///
/// Everything scans byte-wise; delimiter search respects quoting and
/// bracket nesting.

use crate::core::oop::{call_by_selector, dict_at_put, environ_find, list_from_stack, set_put};
use crate::core::value::{Builtin, Value};
use crate::errors::VmResult;
use crate::thread::Thread;

pub fn trim(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if !first.is_ascii_whitespace() {
            break;
        }
        s = rest;
    }
    while let [rest @ .., last] = s {
        if !last.is_ascii_whitespace() {
            break;
        }
        s = rest;
    }
    s
}

/// Find a top-level delimiter, skipping quoted strings and nested
/// `<>`, `()`, `[]`, `{}` groups.
pub fn delim_find(delim: u8, s: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < s.len() {
        let c = s[i];
        let close = match c {
            b'"' => {
                i += 1;
                while i < s.len() {
                    match s[i] {
                        b'\\' => i += 2,
                        b'"'  => break,
                        _     => i += 1,
                    }
                }
                if i >= s.len() {
                    return None;
                }
                i += 1;
                continue;
            }
            b'<' => b'>',
            b'(' => b')',
            b'[' => b']',
            b'{' => b'}',
            _ => {
                if c == delim {
                    return Some(i);
                }
                i += 1;
                continue;
            }
        };
        let inner = delim_find(close, &s[i + 1..])?;
        i += inner + 2;
    }
    None
}

pub fn digit(c: u8, base: i64) -> Option<i64> {
    let d = match c {
        b'0'..=b'9' => (c - b'0') as i64,
        b'a'..=b'z' => (c - b'a') as i64 + 10,
        b'A'..=b'Z' => (c - b'A') as i64 + 10,
        _ => return None,
    };
    (d < base).then_some(d)
}

/// Digits in an explicit base; a leading minus only when allowed.
pub fn int_base(s: &[u8], base: i64, allow_neg: bool) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    let mut val = 0i64;
    let mut neg = false;
    for (i, &c) in s.iter().enumerate() {
        if c == b'-' && i == 0 && allow_neg {
            neg = true;
            continue;
        }
        val = val.wrapping_mul(base).wrapping_add(digit(c, base)?);
    }
    if neg && s.len() == 1 {
        return None;
    }
    Some(if neg { -val } else { val })
}

/// Base detection: `0b`/`0x` prefixes and leading-zero octal apply to
/// unsigned parses only; plain decimal accepts a sign.
pub fn int(s: &[u8]) -> Option<i64> {
    if s.len() >= 3 && s[0] == b'0' {
        match s[1].to_ascii_uppercase() {
            b'B' => return int_base(&s[2..], 2, false),
            b'X' => return int_base(&s[2..], 16, false),
            _ => {}
        }
    }
    if s.len() >= 2 && s[0] == b'0' {
        return int_base(&s[1..], 8, false);
    }
    int_base(s, 10, true)
}

/// Validate the shape digits[.digits][E[+-]digits], then parse.
pub fn float(s: &[u8]) -> Option<f64> {
    let mut p = s;
    if let [b'-', rest @ ..] = p {
        p = rest;
    }
    let digits = |p: &mut &[u8]| -> usize {
        let mut n = 0;
        while let [c, rest @ ..] = *p {
            if !c.is_ascii_digit() {
                break;
            }
            n += 1;
            *p = rest;
        }
        n
    };
    if digits(&mut p) == 0 {
        return None;
    }
    let mut saw_frac_or_exp = false;
    if let [b'.', rest @ ..] = p {
        p = rest;
        if digits(&mut p) == 0 {
            return None;
        }
        saw_frac_or_exp = true;
    }
    if let [c, rest @ ..] = p {
        if c.to_ascii_uppercase() == b'E' {
            p = rest;
            if let [sign, rest @ ..] = p {
                if *sign == b'+' || *sign == b'-' {
                    p = rest;
                }
            }
            if digits(&mut p) == 0 {
                return None;
            }
            saw_frac_or_exp = true;
        }
    }
    if !p.is_empty() || !saw_frac_or_exp {
        return None;
    }
    std::str::from_utf8(s).ok()?.parse().ok()
}

/// Unescape quoted-string content (the part between the quotes).
pub fn string_body(s: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        let c = s[i];
        if c == b'"' {
            return None;
        }
        if c != b'\\' {
            out.push(c);
            i += 1;
            continue;
        }
        i += 1;
        let e = *s.get(i)?;
        i += 1;
        match e {
            b'\\' => out.push(b'\\'),
            b'"'  => out.push(b'"'),
            b'n'  => out.push(b'\n'),
            b'r'  => out.push(b'\r'),
            b't'  => out.push(b'\t'),
            b'x'  => {
                let hi = digit(*s.get(i)?, 16)?;
                let lo = digit(*s.get(i + 1)?, 16)?;
                out.push((hi * 16 + lo) as u8);
                i += 2;
            }
            _ => return None,
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Full literal parser
// ---------------------------------------------------------------------------

/// Parse a literal into `dst`.  Returns false when the text matches no
/// literal form; raises only through the constructors it invokes.
pub fn parse(th: &mut Thread, dst: usize, s: &[u8]) -> VmResult<bool> {
    let s = trim(s);
    if s.is_empty() {
        return Ok(false);
    }
    if s == b"#nil" {
        th.set_nil(dst)?;
        return Ok(true);
    }
    if s == b"#true" || s == b"#false" {
        th.set_value(dst, Value::Bool(s == b"#true"))?;
        return Ok(true);
    }
    if let Some(v) = int(s) {
        th.set_value(dst, Value::Int(v))?;
        return Ok(true);
    }
    if let Some(v) = float(s) {
        th.set_value(dst, Value::Float(v))?;
        return Ok(true);
    }
    if s.len() >= 2 && s[0] == b'"' && s[s.len() - 1] == b'"' {
        if let Some(body) = string_body(&s[1..s.len() - 1]) {
            th.str_new(dst, &body)?;
            return Ok(true);
        }
        return Ok(false);
    }
    if s.len() >= 2 && s[0] == b'<' && s[s.len() - 1] == b'>' {
        return parse_pair(th, dst, &s[1..s.len() - 1]);
    }
    if s.len() >= 2 && s[0] == b'(' && s[s.len() - 1] == b')' {
        return parse_list(th, dst, &s[1..s.len() - 1]);
    }
    if s.len() >= 2 && s[0] == b'[' && s[s.len() - 1] == b']' {
        return parse_array(th, dst, &s[1..s.len() - 1]);
    }
    if s.len() >= 2 && s[0] == b'{' && s[s.len() - 1] == b'}' {
        let body = &s[1..s.len() - 1];
        // A dictionary when the first element carries a top-level colon.
        let first = delim_find(b',', body).unwrap_or(body.len());
        if delim_find(b':', &body[..first]).is_some() {
            return parse_dict(th, dst, body);
        }
        return parse_set(th, dst, body);
    }
    parse_object(th, dst, s)
}

fn split_elems(body: &[u8]) -> Option<Vec<&[u8]>> {
    let mut out = Vec::new();
    let mut rest = trim(body);
    if rest.is_empty() {
        return Some(out);
    }
    loop {
        match delim_find(b',', rest) {
            Some(i) => {
                out.push(&rest[..i]);
                rest = &rest[i + 1..];
            }
            None => {
                out.push(rest);
                return Some(out);
            }
        }
    }
}

fn parse_pair(th: &mut Thread, dst: usize, body: &[u8]) -> VmResult<bool> {
    let Some(i) = delim_find(b',', body) else {
        return Ok(false);
    };
    let mark = th.sp();
    let w = th.alloc(2)?;
    let ok = parse(th, w, &body[..i])? && parse(th, w + 1, &body[i + 1..])?;
    if ok {
        let first = th.get(w)?;
        let second = th.get(w + 1)?;
        th.pair_new(dst, &first, &second)?;
    }
    th.unwind(mark)?;
    Ok(ok)
}

fn parse_elems(th: &mut Thread, body: &[u8]) -> VmResult<Option<usize>> {
    let Some(parts) = split_elems(body) else {
        return Ok(None);
    };
    let n = parts.len();
    let base = th.alloc(n)?;
    for (i, part) in parts.into_iter().enumerate() {
        if !parse(th, base + i, part)? {
            return Ok(None);
        }
    }
    Ok(Some(n))
}

fn parse_list(th: &mut Thread, dst: usize, body: &[u8]) -> VmResult<bool> {
    let mark = th.sp();
    let base = mark;
    match parse_elems(th, body)? {
        Some(n) => {
            list_from_stack(th, dst, base, n)?;
            th.unwind(mark)?;
            Ok(true)
        }
        None => {
            th.unwind(mark)?;
            Ok(false)
        }
    }
}

fn parse_array(th: &mut Thread, dst: usize, body: &[u8]) -> VmResult<bool> {
    let mark = th.sp();
    match parse_elems(th, body)? {
        Some(n) => {
            let r = {
                let res = th.vm.heap.lock().array_new(th.tid, dst, Builtin::Array, n);
                th.lift(res)?
            };
            for i in 0..n {
                let c = th.get(mark + i)?;
                th.vm.heap.lock().array_set(r, i, &c);
            }
            th.unwind(mark)?;
            Ok(true)
        }
        None => {
            th.unwind(mark)?;
            Ok(false)
        }
    }
}

fn parse_set(th: &mut Thread, dst: usize, body: &[u8]) -> VmResult<bool> {
    let mark = th.sp();
    let s = {
        let res = th.vm.heap.lock().set_new(th.tid, dst, Builtin::Set, 16);
        th.lift(res)?
    };
    match parse_elems(th, body)? {
        Some(n) => {
            for i in 0..n {
                set_put(th, s, mark + i)?;
            }
            th.unwind(mark)?;
            Ok(true)
        }
        None => {
            th.unwind(mark)?;
            Ok(false)
        }
    }
}

fn parse_dict(th: &mut Thread, dst: usize, body: &[u8]) -> VmResult<bool> {
    let mark = th.sp();
    let d = {
        let res = th.vm.heap.lock().set_new(th.tid, dst, Builtin::Dictionary, 16);
        th.lift(res)?
    };
    let Some(parts) = split_elems(body) else {
        th.unwind(mark)?;
        return Ok(false);
    };
    for part in parts {
        let Some(colon) = delim_find(b':', part) else {
            th.unwind(mark)?;
            return Ok(false);
        };
        let w = th.alloc(2)?;
        let ok = parse(th, w, &part[..colon])? && parse(th, w + 1, &part[colon + 1..])?;
        if !ok {
            th.unwind(mark)?;
            return Ok(false);
        }
        dict_at_put(th, d, w, w + 1)?;
        th.unwind(w)?;
    }
    th.unwind(mark)?;
    Ok(true)
}

/// `Name@{...}`: resolve the class through the Environment and send it
/// `new` with the parsed dictionary.
fn parse_object(th: &mut Thread, dst: usize, s: &[u8]) -> VmResult<bool> {
    let Some(at) = delim_find(b'@', s) else {
        return Ok(false);
    };
    let Some(brace) = delim_find(b'{', s) else {
        return Ok(false);
    };
    if brace < at {
        return Ok(false);
    }
    let mark = th.sp();
    let name_idx = th.alloc(1)?;
    th.str_new(name_idx, trim(&s[..at]))?;
    let Some(pr) = environ_find(th, name_idx)? else {
        th.unwind(mark)?;
        return Ok(false);
    };
    let cl = th.vm.heap.lock().pair_parts(pr).1;
    th.push(&cl)?;
    let dict_idx = th.alloc(1)?;
    let dict_src = &s[brace..];
    let dict_src = trim(dict_src);
    if !(dict_src.len() >= 2 && dict_src[0] == b'{' && dict_src[dict_src.len() - 1] == b'}') {
        th.unwind(mark)?;
        return Ok(false);
    }
    if !parse_dict(th, dict_idx, &dict_src[1..dict_src.len() - 1])? {
        th.unwind(mark)?;
        return Ok(false);
    }
    call_by_selector(th, dst, "new", 2)?;
    th.unwind(mark)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_base_detection() {
        assert_eq!(int(b"0x1F"), Some(31));
        assert_eq!(int(b"0b11"), Some(3));
        assert_eq!(int(b"077"), Some(63));
        assert_eq!(int(b"123"), Some(123));
        assert_eq!(int(b"-42"), Some(-42));
        assert_eq!(int(b"-0x10"), None);
        assert_eq!(int(b"0"), Some(0));
        assert_eq!(int(b"12a"), None);
    }

    #[test]
    fn explicit_base() {
        assert_eq!(int_base(b"101", 2, true), Some(5));
        assert_eq!(int_base(b"-ff", 16, true), Some(-255));
        assert_eq!(int_base(b"2", 2, true), None);
    }

    #[test]
    fn float_shapes() {
        assert_eq!(float(b"1.5"), Some(1.5));
        assert_eq!(float(b"-2.25e2"), Some(-225.0));
        assert_eq!(float(b"3e2"), Some(300.0));
        assert_eq!(float(b"12"), None);
        assert_eq!(float(b"1."), None);
        assert_eq!(float(b".5"), None);
    }

    #[test]
    fn delimiters_respect_nesting() {
        assert_eq!(delim_find(b',', b"a, b"), Some(1));
        assert_eq!(delim_find(b',', b"(a, b), c"), Some(6));
        assert_eq!(delim_find(b',', b"\"a, b\", c"), Some(6));
        assert_eq!(delim_find(b',', b"<a, b>"), None);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(string_body(b"a\\nb"), Some(b"a\nb".to_vec()));
        assert_eq!(string_body(b"\\x41"), Some(b"A".to_vec()));
        assert_eq!(string_body(b"\\q"), None);
    }
}
