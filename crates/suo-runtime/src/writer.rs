//! The bootstrap writer.
//!
//! The writer keeps its state as a list of frames; each frame holds the
//! object being written and the index of the element to print next. No
//! host recursion, however deeply the data nests.

use std::io::{self, Write};

use crate::boot::Runtime;
use crate::value::Value;

fn printable(c: u8) -> bool {
    (0x20..0x7f).contains(&c)
}

fn symbol_char_needs_escape(c: u8) -> bool {
    b" \t\n".contains(&c) || b"()[]{}';".contains(&c)
}

fn push_frame(rt: &mut Runtime, stack: Value, x: Value, i: usize) -> Value {
    let m = rt.heap.mark();
    let sr = rt.heap.push_root(stack);
    let xr = rt.heap.push_root(x);

    let y = rt.cons(rt.heap.root(xr), Value::fixnum(i as i32));
    let stack = rt.cons(y, rt.heap.root(sr));

    rt.heap.release(m);
    stack
}

fn write_string<W: Write>(rt: &Runtime, out: &mut W, x: Value) -> io::Result<()> {
    let bytes = rt.string_bytes(x);
    write!(out, "\"")?;
    for c in bytes {
        if c == b'"' || c == b'\\' {
            write!(out, "\\{}", c as char)?;
        } else if printable(c) {
            write!(out, "{}", c as char)?;
        } else {
            write!(out, "\\x{c:02x}")?;
        }
    }
    write!(out, "\"")
}

fn write_symbol<W: Write>(rt: &Runtime, out: &mut W, x: Value) -> io::Result<()> {
    let bytes = rt.string_bytes(rt.symbol_name(x));
    let n = bytes.len();
    for c in &bytes {
        if symbol_char_needs_escape(*c) || (*c == b'.' && n == 1) {
            write!(out, "\\{}", *c as char)?;
        } else {
            write!(out, "{}", *c as char)?;
        }
    }
    Ok(())
}

/// Print the atomic prefix of `x`. Compound values print their opening
/// bracket and push a frame; everything else is written in full.
fn write_start<W: Write>(
    rt: &mut Runtime,
    out: &mut W,
    stack: Value,
    x: Value,
) -> io::Result<Value> {
    if x.is_fixnum() {
        write!(out, "{}", x.as_fixnum())?;
    } else if x.is_char() {
        write!(out, "#x{:x}", x.char_code())?;
    } else if x == Value::NIL {
        write!(out, "()")?;
    } else if x == Value::TRUE {
        write!(out, "#t")?;
    } else if x == Value::FALSE {
        write!(out, "#f")?;
    } else if x == Value::UNSPEC {
        write!(out, "#unspec")?;
    } else if x.is_pair() {
        write!(out, "(")?;
        return Ok(push_frame(rt, stack, x, 0));
    } else if x.is_vec() {
        write!(out, "[")?;
        return Ok(push_frame(rt, stack, x, 0));
    } else if x.is_rec() {
        let ty = rt.heap.rec_desc(x);
        if ty == rt.string_type() {
            write_string(rt, out, x)?;
        } else if ty == rt.symbol_type() {
            write_symbol(rt, out, x)?;
        } else {
            write!(out, "{{...}}")?;
        }
    } else if x.is_bytev() {
        write!(out, "/")?;
        for i in 0..rt.heap.bytev_len(x) {
            write!(out, "{:02x}", rt.heap.bytev_ref_u8(x, i))?;
        }
        write!(out, "/")?;
    } else {
        write!(out, "?")?;
    }

    Ok(stack)
}

/// Write one value.
pub fn boot_write<W: Write>(rt: &mut Runtime, out: &mut W, x: Value) -> io::Result<()> {
    let m = rt.heap.mark();
    let stack = rt.heap.push_root(Value::NIL);

    let s = write_start(rt, out, Value::NIL, x)?;
    rt.heap.set_root(stack, s);

    while rt.heap.root(stack) != Value::NIL {
        let st = rt.heap.root(stack);
        let f = rt.heap.car(st);
        let x = rt.heap.car(f);
        let i = rt.heap.cdr(f).as_fixnum();

        if x.is_pair() {
            if i == 0 {
                let y = rt.heap.car(x);
                rt.heap.set_cdr(f, Value::fixnum(1));
                let s = write_start(rt, out, st, y)?;
                rt.heap.set_root(stack, s);
            } else if i == 1 {
                let y = rt.heap.cdr(x);
                if y.is_pair() {
                    write!(out, " ")?;
                    rt.heap.set_car(f, y);
                    rt.heap.set_cdr(f, Value::fixnum(0));
                } else if y == Value::NIL {
                    write!(out, ")")?;
                    rt.heap.set_root(stack, rt.heap.cdr(st));
                } else {
                    rt.heap.set_cdr(f, Value::fixnum(2));
                    write!(out, " . ")?;
                    let s = write_start(rt, out, st, y)?;
                    rt.heap.set_root(stack, s);
                }
            } else {
                write!(out, ")")?;
                rt.heap.set_root(stack, rt.heap.cdr(st));
            }
        } else if x.is_vec() {
            let i = i as usize;
            if i < rt.heap.vec_len(x) {
                let y = rt.heap.vec_ref(x, i);
                rt.heap.set_cdr(f, Value::fixnum(i as i32 + 1));
                if i > 0 {
                    write!(out, " ")?;
                }
                let s = write_start(rt, out, st, y)?;
                rt.heap.set_root(stack, s);
            } else {
                write!(out, "]")?;
                rt.heap.set_root(stack, rt.heap.cdr(st));
            }
        }
    }

    rt.heap.release(m);
    Ok(())
}

/// Write a value to a string; handy for tests and diagnostics.
pub fn write_str(rt: &mut Runtime, x: Value) -> String {
    let mut out = Vec::new();
    boot_write(rt, &mut out, x).expect("write to memory cannot fail");
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_str;

    fn runtime() -> Runtime {
        Runtime::new(8192)
    }

    fn round_trip(rt: &mut Runtime, src: &str) -> String {
        let v = read_str(rt, src);
        write_str(rt, v)
    }

    #[test]
    fn writes_atoms() {
        let mut rt = runtime();
        assert_eq!(write_str(&mut rt, Value::fixnum(42)), "42");
        assert_eq!(write_str(&mut rt, Value::fixnum(-7)), "-7");
        assert_eq!(write_str(&mut rt, Value::NIL), "()");
        assert_eq!(write_str(&mut rt, Value::TRUE), "#t");
        assert_eq!(write_str(&mut rt, Value::FALSE), "#f");
        assert_eq!(write_str(&mut rt, Value::UNSPEC), "#unspec");
        assert_eq!(write_str(&mut rt, Value::character(0x61)), "#x61");
    }

    #[test]
    fn writes_lists() {
        let mut rt = runtime();
        assert_eq!(round_trip(&mut rt, "(a b c)"), "(a b c)");
        assert_eq!(round_trip(&mut rt, "(1 (2 3) 4)"), "(1 (2 3) 4)");
    }

    #[test]
    fn improper_tails_print_with_a_dot() {
        let mut rt = runtime();
        assert_eq!(round_trip(&mut rt, "(1 2 . 3)"), "(1 2 . 3)");
        assert_eq!(round_trip(&mut rt, "(1 . (2 . ()))"), "(1 2)");
    }

    #[test]
    fn writes_vectors() {
        let mut rt = runtime();
        assert_eq!(round_trip(&mut rt, "[1 [2] 3]"), "[1 [2] 3]");
        assert_eq!(round_trip(&mut rt, "[]"), "[]");
    }

    #[test]
    fn strings_escape_nonprintable_bytes() {
        let mut rt = runtime();
        let s = rt.string_make(b"ab\nc");
        assert_eq!(write_str(&mut rt, s), "\"ab\\x0ac\"");
        let v = read_str(&mut rt, "\"ab\\nc\"");
        assert_eq!(write_str(&mut rt, v), "\"ab\\x0ac\"");
    }

    #[test]
    fn symbols_escape_reader_significant_characters() {
        let mut rt = runtime();
        let s = rt.intern("odd(name");
        assert_eq!(write_str(&mut rt, s), "odd\\(name");
        let dot = rt.intern(".");
        assert_eq!(write_str(&mut rt, dot), "\\.");
    }

    #[test]
    fn other_records_are_opaque() {
        let mut rt = runtime();
        let ty = rt.function_type();
        let f = rt.rec_make(ty, &[Value::fixnum(1), Value::NIL]);
        assert_eq!(write_str(&mut rt, f), "{...}");
    }

    #[test]
    fn byte_vectors_print_as_hex() {
        let mut rt = runtime();
        let b = rt.heap.bytev_alloc(3);
        rt.heap.bytev_set_u8(b, 0, 0x01);
        rt.heap.bytev_set_u8(b, 1, 0xab);
        rt.heap.bytev_set_u8(b, 2, 0xff);
        assert_eq!(write_str(&mut rt, b), "/01abff/");
    }

    #[test]
    fn read_write_round_trip_is_stable() {
        let mut rt = runtime();
        for src in [
            "(a b c)",
            "(1 2 . 3)",
            "[1 2 [3 4]]",
            "#t",
            "#f",
            "()",
            "#unspec",
            "#x61",
            "(quote x)",
            "\"plain\"",
            "\"a \\\"quoted\\\" one\"",
        ] {
            let once = round_trip(&mut rt, src);
            let v = read_str(&mut rt, &once);
            assert_eq!(write_str(&mut rt, v), once, "round-tripping {src}");
        }
    }
}
