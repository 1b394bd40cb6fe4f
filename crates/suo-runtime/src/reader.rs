//! The bootstrap reader.
//!
//! Like the writer, the reader keeps its state in a stack of frames rather
//! than on the host call stack, so arbitrarily nested input consumes a
//! bounded amount of it. A frame records which kind of construct is being
//! read and the list of values accumulated for it so far; frames are heap
//! pairs and so are moved by the collector like everything else.
//!
//! Read failures produce a diagnostic and yield the unspecified value.

use std::io;

use thiserror::Error;

use crate::boot::Runtime;
use crate::eval;
use crate::value::{Value, FIXNUM_MAX, FIXNUM_MIN};

const WHITESPACE: &[u8] = b" \t\n";
const DELIMITERS: &[u8] = b"()[]{}';";

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected delimiter '{0}'")]
    UnexpectedDelimiter(char),

    #[error("number out of range")]
    NumberOutOfRange,

    #[error("unrecognized # construct: #{0}")]
    UnknownSharp(String),

    #[error("unrecognized #\\ construct: #\\{0}")]
    UnknownCharName(String),
}

/// A byte source with one byte of push-back, standing in for the
/// `getchar`/`ungetc` pair the reader wants.
pub struct Input<R> {
    inner: R,
    pending: Option<u8>,
}

impl<R: io::Read> Input<R> {
    pub fn new(inner: R) -> Input<R> {
        Input {
            inner,
            pending: None,
        }
    }

    fn getc(&mut self) -> Option<u8> {
        if let Some(c) = self.pending.take() {
            return Some(c);
        }
        let mut buf = [0u8; 1];
        match self.inner.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }

    fn ungetc(&mut self, c: u8) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(c);
    }
}

// Every construct the reader understands: its opening character, its
// closing character (0 when the construct finishes after one element), and
// the finisher that turns the accumulated elements into a value. Sharp
// constructs have pseudo-openers that never occur in the input.

const OPEN_SHARP_LIST: u8 = 1;
const OPEN_SHARP_VEC: u8 = 2;

type Finisher = fn(&mut Runtime, Value, usize, Option<&'static str>) -> Value;

struct Construct {
    opener: u8,
    closer: u8,
    finisher: Finisher,
    data: Option<&'static str>,
}

const CONSTRUCTS: &[Construct] = &[
    Construct {
        opener: b' ',
        closer: 0,
        finisher: finish_outer,
        data: None,
    },
    Construct {
        opener: b'(',
        closer: b')',
        finisher: finish_list,
        data: None,
    },
    Construct {
        opener: b'[',
        closer: b']',
        finisher: finish_vector,
        data: None,
    },
    Construct {
        opener: b'\'',
        closer: 0,
        finisher: finish_abbrev,
        data: Some("quote"),
    },
    Construct {
        opener: OPEN_SHARP_LIST,
        closer: b')',
        finisher: finish_sharp_list,
        data: None,
    },
    Construct {
        opener: OPEN_SHARP_VEC,
        closer: b']',
        finisher: finish_sharp_vector,
        data: None,
    },
];

fn finish_outer(rt: &mut Runtime, x: Value, n: usize, _data: Option<&'static str>) -> Value {
    if n != 1 {
        Value::UNSPEC
    } else {
        rt.heap.car(x)
    }
}

fn finish_list(_rt: &mut Runtime, x: Value, _n: usize, _data: Option<&'static str>) -> Value {
    x
}

fn finish_vector(rt: &mut Runtime, x: Value, n: usize, _data: Option<&'static str>) -> Value {
    let m = rt.heap.mark();
    let xr = rt.heap.push_root(x);

    let z = rt.heap.vec_alloc(n);
    let mut x = rt.heap.root(xr);
    for i in 0..n {
        let y = rt.heap.car(x);
        rt.heap.vec_set(z, i, y);
        x = rt.heap.cdr(x);
    }

    rt.heap.release(m);
    z
}

fn finish_abbrev(rt: &mut Runtime, x: Value, _n: usize, data: Option<&'static str>) -> Value {
    let m = rt.heap.mark();
    let xr = rt.heap.push_root(x);

    let z = rt.intern(data.unwrap());
    let x = rt.heap.root(xr);
    let z = rt.cons(z, x);

    rt.heap.release(m);
    z
}

/// `#(body ...)` reads as `(fn () (body ...))`.
fn finish_sharp_list(rt: &mut Runtime, x: Value, _n: usize, _data: Option<&'static str>) -> Value {
    let m = rt.heap.mark();
    let xr = rt.heap.push_root(x);

    let x = rt.cons(rt.heap.root(xr), Value::NIL);
    rt.heap.set_root(xr, x);
    let x = rt.cons(Value::NIL, rt.heap.root(xr));
    rt.heap.set_root(xr, x);
    let z = rt.intern("fn");
    let x = rt.cons(z, rt.heap.root(xr));

    rt.heap.release(m);
    x
}

/// `#[args ...]` reads as `(fn (args ...))`.
fn finish_sharp_vector(rt: &mut Runtime, x: Value, _n: usize, _data: Option<&'static str>) -> Value {
    let m = rt.heap.mark();
    let xr = rt.heap.push_root(x);

    let x = rt.cons(rt.heap.root(xr), Value::NIL);
    rt.heap.set_root(xr, x);
    let z = rt.intern("fn");
    let x = rt.cons(z, rt.heap.root(xr));

    rt.heap.release(m);
    x
}

fn construct_index(opener: u8) -> Option<usize> {
    CONSTRUCTS.iter().position(|c| c.opener == opener)
}

/// Push a frame for `opener` onto the stack; `None` when no construct
/// starts with it.
fn read_start(rt: &mut Runtime, stack: Value, opener: u8) -> Option<Value> {
    let i = construct_index(opener)?;
    let m = rt.heap.mark();
    let sr = rt.heap.push_root(stack);

    let frame = rt.cons(Value::fixnum(i as i32), Value::NIL);
    let stack = rt.cons(frame, rt.heap.root(sr));

    rt.heap.release(m);
    Some(stack)
}

fn read_delimiter(rt: &Runtime, stack: Value) -> u8 {
    let frame = rt.heap.car(stack);
    let i = rt.heap.car(frame).as_fixnum() as usize;
    CONSTRUCTS[i].closer
}

/// Accumulate one element onto the innermost frame.
fn read_add(rt: &mut Runtime, stack: Value, x: Value) {
    let m = rt.heap.mark();
    let fr = rt.heap.push_root(rt.heap.car(stack));

    let tail = rt.heap.cdr(rt.heap.root(fr));
    let y = rt.cons(x, tail);
    let f = rt.heap.root(fr);
    rt.heap.set_cdr(f, y);

    rt.heap.release(m);
}

/// Finish the innermost construct: un-reverse the accumulated elements,
/// splicing in an improper tail when the dot token marks one, and hand the
/// result to the construct's finisher.
fn read_finish(rt: &mut Runtime, stack: Value) -> Value {
    let f = rt.heap.car(stack);
    let mut y = rt.heap.cdr(f);
    let mut x = Value::NIL;

    let dot = rt.dot_token();
    if y.is_pair() && rt.heap.cdr(y).is_pair() && rt.heap.car(rt.heap.cdr(y)) == dot {
        x = rt.heap.car(y);
        y = rt.heap.cdr(rt.heap.cdr(y));
    }

    // Reverse in place; nothing here allocates.
    let mut n = 0;
    while y.is_pair() {
        let z = rt.heap.cdr(y);
        rt.heap.set_cdr(y, x);
        x = y;
        y = z;
        n += 1;
    }

    let i = rt.heap.car(f).as_fixnum() as usize;
    (CONSTRUCTS[i].finisher)(rt, x, n, CONSTRUCTS[i].data)
}

/// Skip whitespace and `;` line comments; return the next interesting byte.
fn skip_whitespace<R: io::Read>(inp: &mut Input<R>) -> Option<u8> {
    loop {
        let c = inp.getc()?;
        if c == b';' {
            loop {
                match inp.getc() {
                    None => return None,
                    Some(b'\n') => break,
                    Some(_) => {}
                }
            }
        } else if !WHITESPACE.contains(&c) {
            return Some(c);
        }
    }
}

/// Read one token starting with `first`. Returns the token bytes and
/// whether any character was backslash-escaped (an escaped dot is an
/// ordinary symbol, not the dot token).
fn read_token<R: io::Read>(inp: &mut Input<R>, first: u8) -> (Vec<u8>, bool) {
    let mut tok = Vec::new();
    let mut escaped = false;
    let mut any_escaped = false;
    let mut c = Some(first);

    loop {
        match c {
            None => break,
            Some(c2) if !escaped && (DELIMITERS.contains(&c2) || WHITESPACE.contains(&c2)) => {
                inp.ungetc(c2);
                break;
            }
            Some(b'\\') => {
                escaped = true;
                any_escaped = true;
            }
            Some(c2) => {
                tok.push(c2);
                escaped = false;
            }
        }
        c = inp.getc();
    }

    (tok, any_escaped)
}

enum TokenNumber {
    Fixnum(Value),
    OutOfRange,
    NotANumber,
}

fn parse_fixnum(tok: &[u8]) -> TokenNumber {
    let mut it = tok;
    let sign: i64 = match it.first() {
        Some(b'-') => {
            it = &it[1..];
            -1
        }
        Some(b'+') => {
            it = &it[1..];
            1
        }
        _ => 1,
    };

    if it.is_empty() {
        return TokenNumber::NotANumber;
    }

    let mut num: i64 = 0;
    for c in it {
        if !c.is_ascii_digit() {
            return TokenNumber::NotANumber;
        }
        num = 10 * num + (*c - b'0') as i64;
        if sign * num < FIXNUM_MIN as i64 || sign * num > FIXNUM_MAX as i64 {
            return TokenNumber::OutOfRange;
        }
    }

    TokenNumber::Fixnum(Value::fixnum((sign * num) as i32))
}

/// Turn a token into a value: a fixnum, the dot token, or an interned
/// symbol.
fn token_value(rt: &mut Runtime, tok: &[u8], any_escaped: bool) -> Result<Value, ReadError> {
    match parse_fixnum(tok) {
        TokenNumber::Fixnum(v) => Ok(v),
        TokenNumber::OutOfRange => Err(ReadError::NumberOutOfRange),
        TokenNumber::NotANumber => {
            if !any_escaped && tok == b"." {
                Ok(rt.dot_token())
            } else {
                Ok(rt.intern_bytes(tok))
            }
        }
    }
}

/// Read a string body up to the closing quote. `\n` is a newline; any
/// other backslashed byte stands for itself. End of input ends the string.
fn read_string<R: io::Read>(rt: &mut Runtime, inp: &mut Input<R>) -> Value {
    let mut bytes = Vec::new();
    let mut escaped = false;

    loop {
        let c = match inp.getc() {
            None => break,
            Some(c) => c,
        };
        if escaped {
            bytes.push(if c == b'n' { b'\n' } else { c });
            escaped = false;
        } else if c == b'\\' {
            escaped = true;
        } else if c == b'"' {
            break;
        } else {
            bytes.push(c);
        }
    }

    rt.string_make(&bytes)
}

/// The `#<name>` table. The opcode constants feed the bootstrap evaluator.
fn sharp_symbol(tok: &[u8]) -> Result<Value, ReadError> {
    match tok {
        b"t" => Ok(Value::TRUE),
        b"f" => Ok(Value::FALSE),
        b"unspec" => Ok(Value::UNSPEC),
        b"@if" => Ok(Value::fixnum(eval::OP_IF)),
        b"@lambda" => Ok(Value::fixnum(eval::OP_LAMBDA)),
        b"@call" => Ok(Value::fixnum(eval::OP_CALL)),
        b"@apply" => Ok(Value::fixnum(eval::OP_APPLY)),
        b"@quote" => Ok(Value::fixnum(eval::OP_QUOTE)),
        b"@set" => Ok(Value::fixnum(eval::OP_SET)),
        b"@sum" => Ok(Value::fixnum(eval::OP_SUM)),
        b"@mul" => Ok(Value::fixnum(eval::OP_MUL)),
        _ => {
            // #x<hex> is how the writer prints characters.
            if let Some(hex) = tok.strip_prefix(b"x") {
                if !hex.is_empty() {
                    if let Ok(s) = std::str::from_utf8(hex) {
                        if let Ok(code) = u32::from_str_radix(s, 16) {
                            return Ok(Value::character(code));
                        }
                    }
                }
            }
            Err(ReadError::UnknownSharp(
                String::from_utf8_lossy(tok).into_owned(),
            ))
        }
    }
}

/// The `#\<name>` table: any single character stands for itself, plus a few
/// named ones.
fn char_symbol(tok: &[u8]) -> Result<Value, ReadError> {
    if tok.len() == 1 {
        return Ok(Value::character(tok[0] as u32));
    }
    match tok {
        b"space" => Ok(Value::character(' ' as u32)),
        b"nl" => Ok(Value::character('\n' as u32)),
        _ => Err(ReadError::UnknownCharName(
            String::from_utf8_lossy(tok).into_owned(),
        )),
    }
}

/// Read one form. On failure a diagnostic is printed and the result is the
/// unspecified value; an unspecified result at the top level is also how
/// end of input announces itself.
pub fn boot_read<R: io::Read>(rt: &mut Runtime, inp: &mut Input<R>) -> Value {
    match read_form(rt, inp) {
        Ok(v) => v,
        Err(e) => {
            println!("{e}");
            log::warn!("read error: {e}");
            Value::UNSPEC
        }
    }
}

fn read_form<R: io::Read>(rt: &mut Runtime, inp: &mut Input<R>) -> Result<Value, ReadError> {
    let m = rt.heap.mark();
    let stack = rt.heap.push_root(Value::NIL);
    let xr = rt.heap.push_root(Value::UNSPEC);

    let s = read_start(rt, Value::NIL, b' ').unwrap();
    rt.heap.set_root(stack, s);

    let result = loop {
        let c = skip_whitespace(inp);

        let x: Value = match c {
            None => {
                let st = rt.heap.root(stack);
                if rt.heap.cdr(st) != Value::NIL {
                    break Err(ReadError::UnexpectedEof);
                }
                break Ok(Value::UNSPEC);
            }

            Some(b'"') => read_string(rt, inp),

            Some(b'#') => match skip_whitespace(inp) {
                None => break Err(ReadError::UnexpectedEof),
                Some(b'\\') => match skip_whitespace(inp) {
                    None => break Err(ReadError::UnexpectedEof),
                    Some(c2) => {
                        let (tok, _) = read_token(inp, c2);
                        match char_symbol(&tok) {
                            Ok(v) => v,
                            Err(e) => break Err(e),
                        }
                    }
                },
                Some(b'(') => {
                    let st = rt.heap.root(stack);
                    let st = read_start(rt, st, OPEN_SHARP_LIST).unwrap();
                    rt.heap.set_root(stack, st);
                    continue;
                }
                Some(b'[') => {
                    let st = rt.heap.root(stack);
                    let st = read_start(rt, st, OPEN_SHARP_VEC).unwrap();
                    rt.heap.set_root(stack, st);
                    continue;
                }
                Some(c2) => {
                    let (tok, _) = read_token(inp, c2);
                    match sharp_symbol(&tok) {
                        Ok(v) => v,
                        Err(e) => break Err(e),
                    }
                }
            },

            Some(c) if DELIMITERS.contains(&c) => {
                let st = rt.heap.root(stack);
                if c == read_delimiter(rt, st) {
                    let v = read_finish(rt, st);
                    let st = rt.heap.root(stack);
                    rt.heap.set_root(stack, rt.heap.cdr(st));
                    v
                } else {
                    match read_start(rt, st, c) {
                        Some(st) => {
                            rt.heap.set_root(stack, st);
                            continue;
                        }
                        None => break Err(ReadError::UnexpectedDelimiter(c as char)),
                    }
                }
            }

            Some(c) => {
                let (tok, any_escaped) = read_token(inp, c);
                match token_value(rt, &tok, any_escaped) {
                    Ok(v) => v,
                    Err(e) => break Err(e),
                }
            }
        };

        rt.heap.set_root(xr, x);

        // Pour the value into the enclosing frames; constructs without a
        // closing delimiter finish as soon as they have their element.
        loop {
            let st = rt.heap.root(stack);
            if st == Value::NIL {
                break;
            }
            let x = rt.heap.root(xr);
            read_add(rt, st, x);
            let st = rt.heap.root(stack);
            if read_delimiter(rt, st) == 0 {
                let v = read_finish(rt, st);
                rt.heap.set_root(xr, v);
                let st = rt.heap.root(stack);
                rt.heap.set_root(stack, rt.heap.cdr(st));
            } else {
                break;
            }
        }

        if rt.heap.root(stack) == Value::NIL {
            break Ok(rt.heap.root(xr));
        }
    };

    rt.heap.release(m);
    result
}

/// Read a single form from a string; handy for tests and the compile loop.
pub fn read_str(rt: &mut Runtime, src: &str) -> Value {
    let mut inp = Input::new(src.as_bytes());
    boot_read(rt, &mut inp)
}
