//! The bootstrap evaluator.
//!
//! The evaluator understands a tiny post-macroexpansion language:
//!
//! - `(up . n)` — an environment lookup: slot `n` of the frame `up` steps
//!   up the environment chain.
//! - `[op arg ...]` — an operation; `op` is a small integer naming one of
//!   the operations below. A list whose head is an opcode works the same
//!   way, and a list headed by the symbol `quote` quotes its argument.
//!
//! Nested forms are tracked on an explicit stack of three-slot frames
//! (saved form, saved result vector, saved position), so evaluation uses a
//! bounded amount of the host stack no matter how deeply the program
//! nests. Applying an opcode to the wrong shape of data is a fatal error;
//! the bootstrap layer has no exception mechanism to recover with.

use crate::boot::Runtime;
use crate::heap::{die, Root};
use crate::value::{Value, FIXNUM_MAX, FIXNUM_MIN};

pub const OP_IF: i32 = 0;
pub const OP_LAMBDA: i32 = 1;
pub const OP_CALL: i32 = 2;
pub const OP_APPLY: i32 = 3;
pub const OP_QUOTE: i32 = 4;
pub const OP_SET: i32 = 5;
pub const OP_SUM: i32 = 6;
pub const OP_MUL: i32 = 7;

/// Arguments are values in environment-frame vectors starting at this slot;
/// slots 0 and 1 hold the operator and the function.
const FRAME_ARG_BASE: i32 = 2;

enum Go {
    EvalForm,
    DoOpStep,
    UseValue,
}

fn fixnum_arg(v: Value, what: &str) -> i32 {
    if !v.is_fixnum() {
        die(&format!("boot eval: {what} is not a small integer"));
    }
    v.as_fixnum()
}

/// Only `#f` and `()` are false.
fn truthy(v: Value) -> bool {
    v != Value::FALSE && v != Value::NIL
}

/// Walk `up` frames along the environment chain.
fn env_frame(rt: &Runtime, mut env: Value, up: i32) -> Value {
    for _ in 0..up {
        if !env.is_pair() {
            die("boot eval: environment reference climbs past the top");
        }
        env = rt.heap.cdr(env);
    }
    if !env.is_pair() {
        die("boot eval: environment reference climbs past the top");
    }
    rt.heap.car(env)
}

pub fn boot_eval(rt: &mut Runtime, form: Value) -> Value {
    let m = rt.heap.mark();

    let form_r = rt.heap.push_root(form);
    let stack_r = rt.heap.push_root(Value::NIL);
    let env_r = rt.heap.push_root(Value::NIL);
    let top_form_r = rt.heap.push_root(Value::NIL);
    let top_result_r = rt.heap.push_root(Value::NIL);
    let value_r = rt.heap.push_root(Value::NIL);

    // The bottom of the stack is a dummy sum of no arguments; when its
    // result vector is nil, evaluation is complete.
    let v = rt.vec_make(1, Value::fixnum(OP_SUM));
    rt.heap.set_root(top_form_r, v);
    let mut top_pos: usize = 1;
    let mut top_op: i32 = OP_SUM;

    let mut go = Go::EvalForm;

    let result = loop {
        match go {
            Go::EvalForm => {
                let form = rt.heap.root(form_r);
                if form.is_pair() {
                    let d = rt.heap.cdr(form);
                    if d.is_fixnum() {
                        // (up . n): an environment reference.
                        let up = fixnum_arg(rt.heap.car(form), "environment depth");
                        let n = fixnum_arg(d, "environment slot");
                        let env = rt.heap.root(env_r);
                        let frame = env_frame(rt, env, up);
                        let v = rt.heap.vec_ref(frame, (n + FRAME_ARG_BASE) as usize);
                        rt.heap.set_root(value_r, v);
                        go = Go::UseValue;
                    } else if rt.heap.car(form) == rt.quote_symbol() {
                        let v = rt.heap.car(d);
                        rt.heap.set_root(value_r, v);
                        go = Go::UseValue;
                    } else {
                        // An operation written as a list; give it the
                        // vector shape the stepper works on.
                        let v = rt.vec_from_list(form);
                        rt.heap.set_root(form_r, v);
                        // re-dispatch on the vector
                    }
                } else if form.is_vec() {
                    let op = fixnum_arg(rt.heap.vec_ref(form, 0), "opcode");
                    match op {
                        OP_QUOTE => {
                            let v = rt.heap.vec_ref(form, 1);
                            rt.heap.set_root(value_r, v);
                            go = Go::UseValue;
                        }
                        OP_LAMBDA => {
                            let body = rt.heap.vec_ref(form, 1);
                            let env = rt.heap.root(env_r);
                            let ty = rt.function_type();
                            let v = rt.rec_make(ty, &[body, env]);
                            rt.heap.set_root(value_r, v);
                            go = Go::UseValue;
                        }
                        _ => {
                            // Push a frame and start evaluating arguments.
                            let f = rt.heap.vec_alloc(3);
                            let tf = rt.heap.root(top_form_r);
                            rt.heap.vec_set(f, 0, tf);
                            let tr = rt.heap.root(top_result_r);
                            rt.heap.vec_set(f, 1, tr);
                            rt.heap.vec_set(f, 2, Value::fixnum(top_pos as i32));
                            let stack = rt.heap.root(stack_r);
                            let stack = rt.cons(f, stack);
                            rt.heap.set_root(stack_r, stack);

                            let form = rt.heap.root(form_r);
                            rt.heap.set_root(top_form_r, form);
                            let len = rt.heap.vec_len(form);
                            let results = rt.vec_make(len, Value::UNSPEC);
                            rt.heap.set_root(top_result_r, results);
                            top_op = op;
                            top_pos = 1;
                            go = Go::DoOpStep;
                        }
                    }
                } else {
                    rt.heap.set_root(value_r, form);
                    go = Go::UseValue;
                }
            }

            Go::DoOpStep => match top_op {
                OP_IF => {
                    let tf = rt.heap.root(top_form_r);
                    if top_pos == 1 {
                        let v = rt.heap.vec_ref(tf, 1);
                        rt.heap.set_root(form_r, v);
                    } else {
                        let test = rt.heap.vec_ref(rt.heap.root(top_result_r), 1);
                        let v = if truthy(test) {
                            rt.heap.vec_ref(tf, 2)
                        } else {
                            rt.heap.vec_ref(tf, 3)
                        };
                        rt.heap.set_root(form_r, v);
                        pop_frame(rt, stack_r, top_form_r, top_result_r, &mut top_pos, &mut top_op);
                    }
                    go = Go::EvalForm;
                }

                OP_SET => {
                    if top_pos == 1 {
                        top_pos = 2;
                        let v = rt.heap.vec_ref(rt.heap.root(top_form_r), 2);
                        rt.heap.set_root(form_r, v);
                        go = Go::EvalForm;
                    } else {
                        let c = rt.heap.vec_ref(rt.heap.root(top_form_r), 1);
                        if !c.is_pair() {
                            die("boot eval: set target is not an environment reference");
                        }
                        let up = fixnum_arg(rt.heap.car(c), "environment depth");
                        let n = fixnum_arg(rt.heap.cdr(c), "environment slot");
                        let env = rt.heap.root(env_r);
                        let frame = env_frame(rt, env, up);
                        let v = rt.heap.vec_ref(rt.heap.root(top_result_r), 2);
                        rt.heap.vec_set(frame, (n + FRAME_ARG_BASE) as usize, v);
                        rt.heap.set_root(value_r, Value::UNSPEC);
                        pop_frame(rt, stack_r, top_form_r, top_result_r, &mut top_pos, &mut top_op);
                        go = Go::UseValue;
                    }
                }

                _ => {
                    let tf = rt.heap.root(top_form_r);
                    let len = rt.heap.vec_len(tf);
                    if top_pos >= len {
                        match top_op {
                            OP_CALL => {
                                let tr = rt.heap.root(top_result_r);
                                let func = rt.heap.vec_ref(tr, 1);
                                if !rt.is_function(func) {
                                    die("boot eval: call of a non-function");
                                }
                                let body = rt.heap.rec_ref(func, 0);
                                rt.heap.set_root(form_r, body);
                                let fenv = rt.heap.rec_ref(func, 1);
                                let env = rt.cons(rt.heap.root(top_result_r), fenv);
                                rt.heap.set_root(env_r, env);
                                pop_frame(
                                    rt,
                                    stack_r,
                                    top_form_r,
                                    top_result_r,
                                    &mut top_pos,
                                    &mut top_op,
                                );
                                go = Go::EvalForm;
                            }

                            OP_APPLY => {
                                let tr = rt.heap.root(top_result_r);
                                let func = rt.heap.vec_ref(tr, 1);
                                if !rt.is_function(func) {
                                    die("boot eval: apply of a non-function");
                                }
                                let body = rt.heap.rec_ref(func, 0);
                                rt.heap.set_root(form_r, body);
                                let fenv = rt.heap.rec_ref(func, 1);
                                rt.heap.set_root(env_r, fenv);

                                let argv = rt.heap.vec_ref(tr, 2);
                                if !argv.is_vec() {
                                    die("boot eval: apply arguments are not a vector");
                                }
                                let inner = rt.heap.mark();
                                let ar = rt.heap.push_root(argv);
                                let l = rt.heap.vec_len(argv);
                                let f = rt.vec_make(l + 2, Value::UNSPEC);
                                let argv = rt.heap.root(ar);
                                for i in 0..l {
                                    let y = rt.heap.vec_ref(argv, i);
                                    rt.heap.vec_set(f, i + 2, y);
                                }
                                let env = rt.cons(f, rt.heap.root(env_r));
                                rt.heap.set_root(env_r, env);
                                rt.heap.release(inner);

                                pop_frame(
                                    rt,
                                    stack_r,
                                    top_form_r,
                                    top_result_r,
                                    &mut top_pos,
                                    &mut top_op,
                                );
                                go = Go::EvalForm;
                            }

                            OP_SUM | OP_MUL => {
                                let tr = rt.heap.root(top_result_r);
                                let v = fold_arith(rt, tr, top_op);
                                rt.heap.set_root(value_r, v);
                                pop_frame(
                                    rt,
                                    stack_r,
                                    top_form_r,
                                    top_result_r,
                                    &mut top_pos,
                                    &mut top_op,
                                );
                                go = Go::UseValue;
                            }

                            _ => die("boot eval: unknown opcode"),
                        }
                    } else {
                        let v = rt.heap.vec_ref(tf, top_pos);
                        rt.heap.set_root(form_r, v);
                        go = Go::EvalForm;
                    }
                }
            },

            Go::UseValue => {
                let tr = rt.heap.root(top_result_r);
                if tr == Value::NIL {
                    break rt.heap.root(value_r);
                }
                let v = rt.heap.root(value_r);
                rt.heap.vec_set(tr, top_pos, v);
                top_pos += 1;
                go = Go::DoOpStep;
            }
        }
    };

    rt.heap.release(m);
    result
}

fn pop_frame(
    rt: &mut Runtime,
    stack_r: Root,
    top_form_r: Root,
    top_result_r: Root,
    top_pos: &mut usize,
    top_op: &mut i32,
) {
    let stack = rt.heap.root(stack_r);
    let f = rt.heap.car(stack);
    let tf = rt.heap.vec_ref(f, 0);
    rt.heap.set_root(top_form_r, tf);
    let tr = rt.heap.vec_ref(f, 1);
    rt.heap.set_root(top_result_r, tr);
    *top_pos = rt.heap.vec_ref(f, 2).as_fixnum() as usize;
    *top_op = fixnum_arg(rt.heap.vec_ref(tf, 0), "opcode");
    rt.heap.set_root(stack_r, rt.heap.cdr(stack));
}

/// Fold the evaluated arguments with `+` or `*`. Leaving the small-integer
/// range is fatal; the bootstrap layer has no bignums to overflow into.
fn fold_arith(rt: &Runtime, results: Value, op: i32) -> Value {
    let len = rt.heap.vec_len(results);
    let mut acc: i64 = if op == OP_SUM { 0 } else { 1 };
    for i in 1..len {
        let v = rt.heap.vec_ref(results, i);
        let n = fixnum_arg(v, "arithmetic argument") as i64;
        acc = if op == OP_SUM { acc + n } else { acc * n };
        if acc < FIXNUM_MIN as i64 || acc > FIXNUM_MAX as i64 {
            die("boot eval: arithmetic overflow");
        }
    }
    Value::fixnum(acc as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_str;
    use crate::writer::write_str;

    fn runtime() -> Runtime {
        Runtime::new(131072)
    }

    fn eval_str(rt: &mut Runtime, src: &str) -> Value {
        let form = read_str(rt, src);
        boot_eval(rt, form)
    }

    #[test]
    fn sums_and_products() {
        let mut rt = runtime();
        assert_eq!(eval_str(&mut rt, "(#@sum 1 2 3)"), Value::fixnum(6));
        assert_eq!(eval_str(&mut rt, "(#@mul 2 (#@sum 3 4))"), Value::fixnum(14));
        assert_eq!(eval_str(&mut rt, "(#@sum)"), Value::fixnum(0));
        assert_eq!(eval_str(&mut rt, "(#@mul)"), Value::fixnum(1));
    }

    #[test]
    fn vector_operation_forms_work_directly() {
        let mut rt = runtime();
        assert_eq!(eval_str(&mut rt, "[#@sum 1 2 3]"), Value::fixnum(6));
    }

    #[test]
    fn conditionals_branch_on_false_and_nil() {
        let mut rt = runtime();
        assert_eq!(eval_str(&mut rt, "(#@if #t 1 2)"), Value::fixnum(1));
        assert_eq!(eval_str(&mut rt, "(#@if #f 1 2)"), Value::fixnum(2));
        assert_eq!(eval_str(&mut rt, "(#@if () 1 2)"), Value::fixnum(2));
        assert_eq!(eval_str(&mut rt, "(#@if 0 1 2)"), Value::fixnum(1));
    }

    #[test]
    fn quote_returns_its_argument_unevaluated() {
        let mut rt = runtime();
        let v = eval_str(&mut rt, "'(a b c)");
        assert_eq!(write_str(&mut rt, v), "(a b c)");
        let v = eval_str(&mut rt, "(#@quote (1 2))");
        assert_eq!(write_str(&mut rt, v), "(1 2)");
    }

    #[test]
    fn self_evaluating_forms() {
        let mut rt = runtime();
        assert_eq!(eval_str(&mut rt, "7"), Value::fixnum(7));
        assert_eq!(eval_str(&mut rt, "#t"), Value::TRUE);
        let s = eval_str(&mut rt, "\"abc\"");
        assert!(rt.is_string(s));
    }

    #[test]
    fn lambda_captures_and_call_extends_the_environment() {
        let mut rt = runtime();
        // ((lambda (x) x) 42): the argument lives in slot 0 of the new
        // frame, two slots past the operator and function.
        let v = eval_str(&mut rt, "(#@call (#@lambda (0 . 0)) 42)");
        assert_eq!(v, Value::fixnum(42));
    }

    #[test]
    fn call_arguments_evaluate_left_to_right_into_the_frame() {
        let mut rt = runtime();
        let v = eval_str(&mut rt, "(#@call (#@lambda (#@sum (0 . 0) (0 . 1))) 10 (#@sum 2 3))");
        assert_eq!(v, Value::fixnum(15));
    }

    #[test]
    fn nested_calls_climb_the_environment_chain() {
        let mut rt = runtime();
        // Outer binds 5, inner binds 7; (1 . 0) reads the outer binding.
        let v = eval_str(
            &mut rt,
            "(#@call (#@lambda (#@call (#@lambda (#@sum (0 . 0) (1 . 0))) 7)) 5)",
        );
        assert_eq!(v, Value::fixnum(12));
    }

    #[test]
    fn apply_spreads_a_prebuilt_argument_vector() {
        let mut rt = runtime();
        let v = eval_str(
            &mut rt,
            "(#@apply (#@lambda (#@sum (0 . 0) (0 . 1))) (#@quote [4 5]))",
        );
        assert_eq!(v, Value::fixnum(9));
    }

    #[test]
    fn set_yields_unspecified() {
        let mut rt = runtime();
        let v = eval_str(&mut rt, "(#@call (#@lambda (#@set (0 . 0) 9)) 1)");
        assert_eq!(v, Value::UNSPEC);
    }

    #[test]
    fn set_then_read_back() {
        let mut rt = runtime();
        let v = eval_str(
            &mut rt,
            "(#@call (#@lambda (#@call (#@lambda (1 . 0)) (#@set (1 . 0) 9))) 1)",
        );
        assert_eq!(v, Value::fixnum(9));
    }

    #[test]
    fn deep_recursion_stays_off_the_host_stack() {
        let mut rt = runtime();
        let mut src = String::new();
        for _ in 0..2000 {
            src.push_str("(#@sum 1 ");
        }
        src.push('0');
        for _ in 0..2000 {
            src.push(')');
        }
        assert_eq!(eval_str(&mut rt, &src), Value::fixnum(2000));
    }

    #[test]
    fn evaluation_survives_forced_collections() {
        let mut rt = runtime();
        rt.heap.collect_before_alloc = true;
        rt.heap.check_enabled = true;
        assert_eq!(eval_str(&mut rt, "(#@mul 2 (#@sum 3 4))"), Value::fixnum(14));
        let v = eval_str(&mut rt, "(#@call (#@lambda (0 . 0)) 42)");
        assert_eq!(v, Value::fixnum(42));
    }
}
