//! Closure conversion.
//!
//! After this pass no function has free variables: every `fun` gains a
//! leading closure parameter, opens its captured vector on entry, and is
//! reachable through a `closure`-type record holding the code reference
//! and the captured values. Every application is rewritten to fetch the
//! code field out of the closure record (guarded by an `if-record?` check)
//! and to pass the closure itself as the first argument.
//!
//! References are redirected through a scoped replacement environment; the
//! same mechanism later carries register assignments, so the two passes
//! compose on the identical substitution relation.

use std::rc::Rc;

use suo_runtime::{Root, Runtime, Value};

use crate::cps::free::Analysis;
use crate::cps::term::{Atom, Func, Instr, Primop, VarSupply};
use crate::error::{CompileError, Result};

type Repl = im_rc::HashMap<u32, Atom>;

pub struct ClosureConvert<'a> {
    rt: &'a mut Runtime,
    supply: VarSupply,
    analysis: Analysis,
    closure_type: Root,
    /// The `error:not-a-closure` handler, when the top level has one bound
    /// to a closure record.
    handler: Option<Root>,
}

impl<'a> ClosureConvert<'a> {
    pub fn new(
        rt: &'a mut Runtime,
        supply: VarSupply,
        handler: Option<Value>,
    ) -> ClosureConvert<'a> {
        let ty = rt.closure_type();
        let closure_type = rt.heap.push_root(ty);
        let handler = handler
            .filter(|h| rt.is_closure(*h))
            .map(|h| rt.heap.push_root(h));
        ClosureConvert {
            rt,
            supply,
            analysis: Analysis::new(),
            closure_type,
            handler,
        }
    }

    pub fn into_supply(self) -> VarSupply {
        self.supply
    }

    fn quote_fix(&mut self, n: i32) -> Atom {
        Atom::Quote(self.rt.heap.push_root(Value::fixnum(n)))
    }

    fn subst(&self, a: &Atom, repl: &Repl) -> Atom {
        match a {
            Atom::Var(v) => repl.get(&v.id).cloned().unwrap_or_else(|| a.clone()),
            _ => a.clone(),
        }
    }

    pub fn convert_program(&mut self, instr: &Rc<Instr>) -> Result<Rc<Instr>> {
        self.convert(instr, &Repl::new())
    }

    fn convert(&mut self, instr: &Rc<Instr>, repl: &Repl) -> Result<Rc<Instr>> {
        match &**instr {
            Instr::App { func, args, rest } => {
                let f = self.subst(func, repl);
                let args: Vec<Atom> = args.iter().map(|a| self.subst(a, repl)).collect();
                Ok(self.rewrite_app(f, args, *rest))
            }

            Instr::Fun { func, body } => {
                let (new_func, closv, build) = self.close_func(func, repl)?;
                let mut repl_cont = repl.clone();
                repl_cont.insert(func.name.id, Atom::Var(closv));
                let cont = self.convert(body, &repl_cont)?;
                Ok(Rc::new(Instr::Fun {
                    func: new_func,
                    body: build(cont),
                }))
            }

            Instr::Fix { funcs, body } => {
                // Conversion never emits fix; a block is closable here as
                // long as no function captures a sibling label, which would
                // need cyclic records.
                let labels: im_rc::HashSet<u32> = funcs.iter().map(|f| f.name.id).collect();
                for f in funcs {
                    let free = self.analysis.free_func(f);
                    if free.iter().any(|id| labels.contains(id)) {
                        return Err(CompileError::CyclicFix);
                    }
                }

                let mut repl_cont = repl.clone();
                let mut parts = Vec::new();
                for f in funcs {
                    let (new_func, closv, build) = self.close_func(f, repl)?;
                    repl_cont.insert(f.name.id, Atom::Var(closv));
                    parts.push((new_func, build));
                }
                let mut inner = self.convert(body, &repl_cont)?;
                let mut new_funcs = Vec::new();
                for (new_func, build) in parts.into_iter().rev() {
                    inner = build(inner);
                    new_funcs.push(new_func);
                }
                new_funcs.reverse();
                Ok(Rc::new(Instr::Fix {
                    funcs: new_funcs,
                    body: inner,
                }))
            }

            Instr::Primop {
                op,
                results,
                args,
                conts,
            } => {
                let args: Vec<Atom> = args.iter().map(|a| self.subst(a, repl)).collect();
                let conts = conts
                    .iter()
                    .map(|c| self.convert(c, repl))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Rc::new(Instr::Primop {
                    op: *op,
                    results: results.clone(),
                    args,
                    conts,
                }))
            }
        }
    }

    /// Close one function: returns the rewritten func, the fresh variable
    /// its closure record is bound to, and a builder that wraps a
    /// continuation with the capture-vector and record construction.
    #[allow(clippy::type_complexity)]
    fn close_func(
        &mut self,
        func: &Rc<Func>,
        repl: &Repl,
    ) -> Result<(
        Rc<Func>,
        crate::cps::term::VarRef,
        Box<dyn FnOnce(Rc<Instr>) -> Rc<Instr>>,
    )> {
        let free_ids = self.analysis.free_func(func);
        let mut free: Vec<_> = free_ids.iter().map(|id| self.analysis.var(*id)).collect();
        free.sort_by_key(|v| v.id);

        let cvar = self.supply.fresh("cl", false);

        // Inside the body: fresh variables standing for each captured
        // value, loaded out of the captured vector.
        let mut repl_body = repl.clone();
        let opened: Vec<_> = free
            .iter()
            .map(|f| {
                let v = self.supply.fresh(&f.name, f.boxed);
                repl_body.insert(f.id, Atom::Var(v.clone()));
                v
            })
            .collect();

        let new_body = self.convert(&func.body, &repl_body)?;

        let envv = self.supply.fresh("env", false);
        let mut wrapped = new_body;
        for (i, v) in opened.iter().enumerate().rev() {
            let idx = self.quote_fix(i as i32);
            wrapped = Rc::new(Instr::Primop {
                op: Primop::VectorRef,
                results: vec![Atom::Var(v.clone())],
                args: vec![Atom::Var(envv.clone()), idx],
                conts: vec![wrapped],
            });
        }
        if !free.is_empty() {
            let one = self.quote_fix(1);
            wrapped = Rc::new(Instr::Primop {
                op: Primop::RecordRef,
                results: vec![Atom::Var(envv)],
                args: vec![Atom::Var(cvar.clone()), one],
                conts: vec![wrapped],
            });
        }

        let mut params = vec![cvar];
        params.extend(func.params.iter().cloned());
        let new_func = Rc::new(Func {
            name: func.name.clone(),
            params,
            rest: func.rest,
            body: wrapped,
        });

        // In the continuation: capture the current values of the free
        // variables and build the closure record around the code
        // reference.
        let closv = self.supply.fresh(&func.name.name, false);
        let vecv = self.supply.fresh("v", false);
        let captured: Vec<Atom> = free
            .iter()
            .map(|f| self.subst(&Atom::Var(f.clone()), repl))
            .collect();
        let ty = Atom::Quote(self.closure_type);
        let code_ref = Atom::Var(func.name.clone());
        let closv2 = closv.clone();
        let vecv2 = vecv.clone();
        let build = Box::new(move |cont: Rc<Instr>| {
            let record = Rc::new(Instr::Primop {
                op: Primop::Record,
                results: vec![Atom::Var(closv2)],
                args: vec![ty, code_ref, Atom::Var(vecv2.clone())],
                conts: vec![cont],
            });
            Rc::new(Instr::Primop {
                op: Primop::Vector,
                results: vec![Atom::Var(vecv2)],
                args: captured,
                conts: vec![record],
            })
        });

        Ok((new_func, closv, build))
    }

    /// Rewrite an application into the guarded code fetch.
    fn rewrite_app(&mut self, f: Atom, args: Vec<Atom>, rest: bool) -> Rc<Instr> {
        let codev = self.supply.fresh("code", false);
        let mut call_args = vec![f.clone()];
        call_args.extend(args);
        let call = Rc::new(Instr::App {
            func: Atom::Var(codev.clone()),
            args: call_args,
            rest,
        });
        let zero = self.quote_fix(0);
        let fetch = Rc::new(Instr::Primop {
            op: Primop::RecordRef,
            results: vec![Atom::Var(codev)],
            args: vec![f.clone(), zero],
            conts: vec![call],
        });
        let fail = self.not_a_closure(f.clone());
        let ty = Atom::Quote(self.closure_type);
        Rc::new(Instr::Primop {
            op: Primop::IfRecord,
            results: vec![],
            args: vec![ty, f],
            conts: vec![fetch, fail],
        })
    }

    /// The failure branch of an application: call the installed handler
    /// when there is one, else trap.
    fn not_a_closure(&mut self, f: Atom) -> Rc<Instr> {
        match self.handler {
            Some(h) => {
                let hcode = self.supply.fresh("code", false);
                let zero = self.quote_fix(0);
                let call = Rc::new(Instr::App {
                    func: Atom::Var(hcode.clone()),
                    args: vec![Atom::Quote(h), f],
                    rest: false,
                });
                Rc::new(Instr::Primop {
                    op: Primop::RecordRef,
                    results: vec![Atom::Var(hcode)],
                    args: vec![Atom::Quote(h), zero],
                    conts: vec![call],
                })
            }
            None => Rc::new(Instr::Primop {
                op: Primop::Syscall,
                results: vec![],
                args: vec![f],
                conts: vec![],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cps::convert::Convert;
    use suo_runtime::reader::read_str;

    fn closed(src: &str) -> (Runtime, Rc<Instr>) {
        let mut rt = Runtime::new(65536);
        let form = read_str(&mut rt, src);
        let mut conv = Convert::new(&mut rt, None, Value::NIL);
        let instr = conv.convert_program(form).unwrap();
        let supply = std::mem::take(&mut conv.supply);
        drop(conv);
        let mut cc = ClosureConvert::new(&mut rt, supply, None);
        let out = cc.convert_program(&instr).unwrap();
        (rt, out)
    }

    fn each_func(instr: &Rc<Instr>, out: &mut Vec<Rc<Func>>) {
        match &**instr {
            Instr::Fun { func, body } => {
                out.push(func.clone());
                each_func(&func.body, out);
                each_func(body, out);
            }
            Instr::Fix { funcs, body } => {
                for f in funcs {
                    out.push(f.clone());
                    each_func(&f.body, out);
                }
                each_func(body, out);
            }
            Instr::Primop { conts, .. } => {
                for c in conts {
                    each_func(c, out);
                }
            }
            Instr::App { .. } => {}
        }
    }

    #[test]
    fn every_function_is_closed_afterwards() {
        for src in [
            "(:lambda (x) x)",
            "(:lambda (x) (:lambda (y) x))",
            "(:lambda (f x) (f x))",
            "(:lambda (x) (:begin (:set x 1) x))",
        ] {
            let (_rt, out) = closed(src);
            let mut funcs = Vec::new();
            each_func(&out, &mut funcs);
            let mut an = Analysis::new();
            for f in &funcs {
                assert!(
                    an.free_func(f).is_empty(),
                    "{src}: func {} still has free vars",
                    f.name
                );
            }
        }
    }

    #[test]
    fn funcs_gain_a_closure_parameter() {
        let (_rt, out) = closed("(:lambda (x) x)");
        let func = match &*out {
            Instr::Fun { func, .. } => func.clone(),
            other => panic!("expected fun, got {other}"),
        };
        // closure + continuation + x
        assert_eq!(func.params.len(), 3);
        assert_eq!(func.params[0].name, "cl");
    }

    #[test]
    fn applications_fetch_code_through_a_type_guard() {
        let (_rt, out) = closed("(:lambda (f) (f f))");

        fn find_guard(instr: &Rc<Instr>) -> Option<(usize, bool)> {
            match &**instr {
                Instr::Primop {
                    op: Primop::IfRecord,
                    conts,
                    ..
                } => {
                    let fetch_ok = matches!(
                        &*conts[0],
                        Instr::Primop {
                            op: Primop::RecordRef,
                            ..
                        }
                    );
                    Some((conts.len(), fetch_ok))
                }
                Instr::Primop { conts, .. } => conts.iter().find_map(find_guard),
                Instr::Fun { func, body } => find_guard(&func.body).or_else(|| find_guard(body)),
                _ => None,
            }
        }
        let (n_conts, fetch_ok) = find_guard(&out).expect("app got a closure guard");
        assert_eq!(n_conts, 2);
        assert!(fetch_ok);
    }

    #[test]
    fn failure_branch_traps_without_a_handler() {
        let (_rt, out) = closed("(:lambda (f) (f f))");

        fn find_fail(instr: &Rc<Instr>) -> Option<Primop> {
            match &**instr {
                Instr::Primop {
                    op: Primop::IfRecord,
                    conts,
                    ..
                } => match &*conts[1] {
                    Instr::Primop { op, .. } => Some(*op),
                    _ => None,
                },
                Instr::Primop { conts, .. } => conts.iter().find_map(find_fail),
                Instr::Fun { func, body } => find_fail(&func.body).or_else(|| find_fail(body)),
                _ => None,
            }
        }
        assert_eq!(find_fail(&out), Some(Primop::Syscall));
    }

    #[test]
    fn captured_variables_load_from_the_vector() {
        let (_rt, out) = closed("(:lambda (x) (:lambda (y) x))");

        // The inner function must open its captured vector: record-ref of
        // the closure argument, then a vector-ref.
        fn inner_opens_env(instr: &Rc<Instr>) -> bool {
            let mut funcs = Vec::new();
            each_func(instr, &mut funcs);
            funcs.iter().any(|f| {
                matches!(&*f.body, Instr::Primop { op: Primop::RecordRef, conts, .. }
                    if matches!(&*conts[0], Instr::Primop { op: Primop::VectorRef, .. }))
            })
        }
        assert!(inner_opens_env(&out));

        // And somewhere a vector + record construction pairs up.
        fn builds_closure(instr: &Rc<Instr>) -> bool {
            match &**instr {
                Instr::Primop {
                    op: Primop::Vector,
                    conts,
                    ..
                } => matches!(
                    &*conts[0],
                    Instr::Primop {
                        op: Primop::Record,
                        ..
                    }
                ),
                Instr::Primop { conts, .. } => conts.iter().any(builds_closure),
                Instr::Fun { func, body } => builds_closure(&func.body) || builds_closure(body),
                _ => false,
            }
        }
        assert!(builds_closure(&out));
    }
}
