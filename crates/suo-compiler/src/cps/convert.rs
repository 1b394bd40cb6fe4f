//! Source to CPS conversion.
//!
//! The converter walks the mini-language produced by the macro layer and
//! threads a meta-continuation `k` through the traversal: `k` takes the
//! CPS value of the expression just converted and returns the instruction
//! that consumes it. Reifying `k` as an actual CPS function only happens
//! when a call needs a continuation argument, and even then an `app` of
//! the shape `(app K (z))` short-circuits to `K` itself so that source
//! tail calls stay tail calls in the emitted CPS.
//!
//! Source forms are heap values; every subform the converter holds across
//! a potential allocation point travels as a heap root, never as a raw
//! word.

use std::rc::Rc;

use suo_runtime::{Root, Runtime, Value};

use crate::cps::term::{Atom, Func, Instr, Primop, VarRef, VarSupply};
use crate::error::{CompileError, Result};

pub type Env = im_rc::HashMap<String, VarRef>;

/// Expansion hook for operators the converter does not know; given the
/// whole call form, it may return a replacement form to convert instead.
pub type MacroHook<'h> = &'h dyn Fn(&mut Runtime, Value) -> Option<Value>;

pub type KCont<'a> = Box<dyn FnOnce(&mut Convert<'a>, Atom) -> Result<Rc<Instr>> + 'a>;
type ArgsCont<'a> = Box<dyn FnOnce(&mut Convert<'a>, Vec<Atom>) -> Result<Rc<Instr>> + 'a>;

pub struct Convert<'a> {
    pub rt: &'a mut Runtime,
    pub supply: VarSupply,
    hook: Option<MacroHook<'a>>,
    bootinfo: Root,
}

impl<'a> Convert<'a> {
    pub fn new(rt: &'a mut Runtime, hook: Option<MacroHook<'a>>, bootinfo: Value) -> Convert<'a> {
        let bootinfo = rt.heap.push_root(bootinfo);
        Convert {
            rt,
            supply: VarSupply::new(),
            hook,
            bootinfo,
        }
    }

    /// Convert a whole program: a single `:lambda` whose continuation is
    /// the `bottom` primop.
    pub fn convert_program(&mut self, form: Value) -> Result<Rc<Instr>> {
        if !self.is_form(form, ":lambda") {
            return Err(CompileError::TopLevelNotLambda);
        }
        let instr = self.conv(
            form,
            &Env::new(),
            Box::new(|_c, v| {
                Ok(Rc::new(Instr::Primop {
                    op: Primop::Bottom,
                    results: vec![],
                    args: vec![v],
                    conts: vec![],
                }))
            }),
        )?;
        match &*instr {
            Instr::Fun { body, .. } => match &**body {
                Instr::Primop {
                    op: Primop::Bottom, ..
                } => Ok(instr),
                _ => Err(CompileError::TopLevelNotLambda),
            },
            _ => Err(CompileError::TopLevelNotLambda),
        }
    }

    fn is_form(&self, form: Value, head: &str) -> bool {
        form.is_pair() && {
            let h = self.rt.heap.car(form);
            self.rt.is_symbol(h) && self.rt.symbol_text(h) == head
        }
    }

    fn quote(&mut self, v: Value) -> Atom {
        Atom::Quote(self.rt.heap.push_root(v))
    }

    fn root_items(&mut self, list: Value) -> Vec<Root> {
        let items = self.rt.list_to_vec(list);
        items.into_iter().map(|v| self.rt.heap.push_root(v)).collect()
    }

    pub fn conv(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        if self.rt.is_symbol(exp) {
            return self.conv_ref(exp, env, k);
        }

        if exp.is_pair() {
            let head = self.rt.heap.car(exp);
            if self.rt.is_symbol(head) {
                let name = self.rt.symbol_text(head);
                match name.as_str() {
                    ":quote" => {
                        let items = self.rt.list_to_vec(exp);
                        if items.len() != 2 {
                            return Err(CompileError::Malformed(":quote"));
                        }
                        let a = self.quote(items[1]);
                        return k(self, a);
                    }
                    ":lambda" => return self.conv_lambda(exp, env, k),
                    ":begin" => {
                        let forms = self.root_items(self.rt.heap.cdr(exp));
                        return self.conv_seq(forms, env, k);
                    }
                    ":primitive" => return self.conv_primitive(exp, env, k),
                    ":set" => return self.conv_set(exp, env, k),
                    ":call/cc" => return self.conv_call_cc(exp, env, k),
                    ":call/v" => return self.conv_call_v(exp, env, k),
                    ":apply" => return self.conv_apply(exp, env, k),
                    ":bootinfo" => {
                        let a = Atom::Quote(self.bootinfo);
                        return k(self, a);
                    }
                    _ => {
                        if !env.contains_key(&name) {
                            if let Some(hook) = self.hook {
                                // The hook may allocate, so the form goes
                                // through a root across the call.
                                let er = self.rt.heap.push_root(exp);
                                let expansion = hook(self.rt, exp);
                                if let Some(expansion) = expansion {
                                    return self.conv(expansion, env, k);
                                }
                                let exp = self.rt.heap.root(er);
                                return self.conv_call(exp, env, k);
                            }
                        }
                        return self.conv_call(exp, env, k);
                    }
                }
            }
            return self.conv_call(exp, env, k);
        }

        // Anything else is a self-quoting literal.
        let a = self.quote(exp);
        k(self, a)
    }

    /// A variable reference: local unboxed vars pass straight through,
    /// boxed bindings read through their box, unknown names are top-level
    /// references.
    fn conv_ref(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        let name = self.rt.symbol_text(exp);
        match env.get(&name) {
            Some(var) if !var.boxed => {
                let var = var.clone();
                k(self, Atom::Var(var))
            }
            Some(var) => {
                let var = var.clone();
                let t = self.supply.fresh("t", false);
                let body = k(self, Atom::Var(t.clone()))?;
                Ok(Rc::new(Instr::Primop {
                    op: Primop::BoxRef,
                    results: vec![Atom::Var(t)],
                    args: vec![Atom::Var(var)],
                    conts: vec![body],
                }))
            }
            None => {
                let sym = self.quote(exp);
                let t = self.supply.fresh("t", false);
                let body = k(self, Atom::Var(t.clone()))?;
                Ok(Rc::new(Instr::Primop {
                    op: Primop::VariableRef,
                    results: vec![Atom::Var(t)],
                    args: vec![sym],
                    conts: vec![body],
                }))
            }
        }
    }

    /// `(:lambda (params...) body...)`. Every parameter is boxed on entry
    /// so that `:set` works uniformly on locals.
    fn conv_lambda(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        let d = self.rt.heap.cdr(exp);
        if !d.is_pair() {
            return Err(CompileError::Malformed(":lambda"));
        }
        let mut params_form = self.rt.heap.car(d);
        let body_forms = self.root_items(self.rt.heap.cdr(d));

        let mut names = Vec::new();
        let mut rest = false;
        while params_form.is_pair() {
            let p = self.rt.heap.car(params_form);
            if !self.rt.is_symbol(p) {
                return Err(CompileError::Malformed(":lambda"));
            }
            names.push(self.rt.symbol_text(p));
            params_form = self.rt.heap.cdr(params_form);
        }
        if params_form != Value::NIL {
            if !self.rt.is_symbol(params_form) {
                return Err(CompileError::Malformed(":lambda"));
            }
            names.push(self.rt.symbol_text(params_form));
            rest = true;
        }

        let fname = self.supply.fresh("f", false);
        let kvar = self.supply.fresh("k", false);
        let pvars: Vec<VarRef> = names.iter().map(|n| self.supply.fresh(n, false)).collect();
        let bvars: Vec<VarRef> = names.iter().map(|n| self.supply.fresh(n, true)).collect();

        let mut benv = env.clone();
        for (name, b) in names.iter().zip(bvars.iter()) {
            benv.insert(name.clone(), b.clone());
        }

        let kv = kvar.clone();
        let mut body = self.conv_seq(
            body_forms,
            &benv,
            Box::new(move |_c, z| {
                Ok(Rc::new(Instr::App {
                    func: Atom::Var(kv),
                    args: vec![z],
                    rest: false,
                }))
            }),
        )?;

        for (p, b) in pvars.iter().zip(bvars.iter()).rev() {
            body = Rc::new(Instr::Primop {
                op: Primop::Box,
                results: vec![Atom::Var(b.clone())],
                args: vec![Atom::Var(p.clone())],
                conts: vec![body],
            });
        }

        let mut params = vec![kvar];
        params.extend(pvars);
        let func = Rc::new(Func {
            name: fname.clone(),
            params,
            rest,
            body,
        });

        let cont = k(self, Atom::Var(fname))?;
        Ok(Rc::new(Instr::Fun { func, body: cont }))
    }

    /// Evaluate `forms` in order, passing the last result on; an empty
    /// sequence produces the unspecified value.
    fn conv_seq(&mut self, forms: Vec<Root>, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        if forms.is_empty() {
            let u = self.quote(Value::UNSPEC);
            return k(self, u);
        }
        let first = self.rt.heap.root(forms[0]);
        if forms.len() == 1 {
            return self.conv(first, env, k);
        }
        let rest: Vec<Root> = forms[1..].to_vec();
        let env2 = env.clone();
        self.conv(
            first,
            env,
            Box::new(move |c, _z| c.conv_seq(rest, &env2, k)),
        )
    }

    /// Evaluate a row of argument forms left to right.
    fn conv_args(&mut self, forms: Vec<Root>, env: &Env, k: ArgsCont<'a>) -> Result<Rc<Instr>> {
        self.conv_args_from(forms, 0, Vec::new(), env, k)
    }

    fn conv_args_from(
        &mut self,
        forms: Vec<Root>,
        at: usize,
        mut acc: Vec<Atom>,
        env: &Env,
        k: ArgsCont<'a>,
    ) -> Result<Rc<Instr>> {
        if at == forms.len() {
            return k(self, acc);
        }
        let form = self.rt.heap.root(forms[at]);
        let env2 = env.clone();
        self.conv(
            form,
            env,
            Box::new(move |c, a| {
                acc.push(a);
                c.conv_args_from(forms, at + 1, acc, &env2, k)
            }),
        )
    }

    /// An ordinary call: arguments first, then the function, then an
    /// application with a synthesised continuation in front.
    fn conv_call(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        let items = self.root_items(exp);
        if items.is_empty() {
            return Err(CompileError::Malformed("call"));
        }
        let fform = items[0];
        let argforms: Vec<Root> = items[1..].to_vec();
        let env2 = env.clone();
        self.conv_args(
            argforms,
            env,
            Box::new(move |c, args| {
                let fv = c.rt.heap.root(fform);
                c.conv(
                    fv,
                    &env2,
                    Box::new(move |c, fatom| {
                        let (katom, reified) = c.make_cont(k)?;
                        let mut all = vec![katom];
                        all.extend(args);
                        let app = Rc::new(Instr::App {
                            func: fatom,
                            args: all,
                            rest: false,
                        });
                        Ok(wrap_cont(reified, app))
                    }),
                )
            }),
        )
    }

    /// `(:set name value)`.
    fn conv_set(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        let items = self.root_items(exp);
        if items.len() != 3 {
            return Err(CompileError::Malformed(":set"));
        }
        let namev = self.rt.heap.root(items[1]);
        if !self.rt.is_symbol(namev) {
            return Err(CompileError::Malformed(":set"));
        }
        let name = self.rt.symbol_text(namev);
        let name_root = items[1];
        let value_form = self.rt.heap.root(items[2]);
        let env2 = env.clone();

        self.conv(
            value_form,
            env,
            Box::new(move |c, vatom| {
                let unspec = c.quote(Value::UNSPEC);
                let cont = k(c, unspec)?;
                match env2.get(&name) {
                    Some(var) if var.boxed => {
                        let var = var.clone();
                        Ok(Rc::new(Instr::Primop {
                            op: Primop::BoxSet,
                            results: vec![],
                            args: vec![Atom::Var(var), vatom],
                            conts: vec![cont],
                        }))
                    }
                    Some(_) => Err(CompileError::ImmutableAssignment(name)),
                    None => Ok(Rc::new(Instr::Primop {
                        op: Primop::VariableSet,
                        results: vec![],
                        args: vec![Atom::Quote(name_root), vatom],
                        conts: vec![cont],
                    })),
                }
            }),
        )
    }

    /// `(:primitive op arg ...)`; for branching primops the two trailing
    /// forms are the branch expressions, each converted against the same
    /// caller continuation.
    fn conv_primitive(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        let items = self.root_items(exp);
        if items.len() < 2 {
            return Err(CompileError::Malformed(":primitive"));
        }
        let opv = self.rt.heap.root(items[1]);
        if !self.rt.is_symbol(opv) {
            return Err(CompileError::Malformed(":primitive"));
        }
        let opname = self.rt.symbol_text(opv);
        let op = Primop::from_name(&opname)
            .ok_or_else(|| CompileError::UnknownPrimitive(opname.clone()))?;
        let rest: Vec<Root> = items[2..].to_vec();

        match op.cont_arity() {
            2 => {
                if rest.len() < 2 {
                    return Err(CompileError::Malformed(":primitive"));
                }
                let split = rest.len() - 2;
                let argforms: Vec<Root> = rest[..split].to_vec();
                let then_form = rest[split];
                let else_form = rest[split + 1];
                let env2 = env.clone();
                self.conv_args(
                    argforms,
                    env,
                    Box::new(move |c, atoms| {
                        let (katom, reified) = c.make_cont(k)?;

                        let k1 = katom.clone();
                        let tf = c.rt.heap.root(then_form);
                        let then_i = c.conv(
                            tf,
                            &env2,
                            Box::new(move |_c, z| {
                                Ok(Rc::new(Instr::App {
                                    func: k1,
                                    args: vec![z],
                                    rest: false,
                                }))
                            }),
                        )?;

                        let k2 = katom.clone();
                        let ef = c.rt.heap.root(else_form);
                        let else_i = c.conv(
                            ef,
                            &env2,
                            Box::new(move |_c, z| {
                                Ok(Rc::new(Instr::App {
                                    func: k2,
                                    args: vec![z],
                                    rest: false,
                                }))
                            }),
                        )?;

                        let p = Rc::new(Instr::Primop {
                            op,
                            results: vec![],
                            args: atoms,
                            conts: vec![then_i, else_i],
                        });
                        Ok(wrap_cont(reified, p))
                    }),
                )
            }
            0 => self.conv_args(
                rest,
                env,
                Box::new(move |_c, atoms| {
                    Ok(Rc::new(Instr::Primop {
                        op,
                        results: vec![],
                        args: atoms,
                        conts: vec![],
                    }))
                }),
            ),
            _ => self.conv_args(
                rest,
                env,
                Box::new(move |c, atoms| {
                    if op.result_arity() == 0 {
                        let unspec = c.quote(Value::UNSPEC);
                        let cont = k(c, unspec)?;
                        return Ok(Rc::new(Instr::Primop {
                            op,
                            results: vec![],
                            args: atoms,
                            conts: vec![cont],
                        }));
                    }
                    let t = c.supply.fresh("t", false);
                    let cont = k(c, Atom::Var(t.clone()))?;
                    Ok(Rc::new(Instr::Primop {
                        op,
                        results: vec![Atom::Var(t)],
                        args: atoms,
                        conts: vec![cont],
                    }))
                }),
            ),
        }
    }

    /// `(:call/cc f)`: the current continuation becomes both the return
    /// continuation and the argument.
    fn conv_call_cc(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        let items = self.root_items(exp);
        if items.len() != 2 {
            return Err(CompileError::Malformed(":call/cc"));
        }
        let fform = self.rt.heap.root(items[1]);
        self.conv(
            fform,
            env,
            Box::new(move |c, fatom| {
                let (katom, reified) = c.make_cont(k)?;
                let app = Rc::new(Instr::App {
                    func: fatom,
                    args: vec![katom.clone(), katom],
                    rest: false,
                });
                Ok(wrap_cont(reified, app))
            }),
        )
    }

    /// `(:call/v producer consumer)`: the producer is applied to a
    /// rest-ary receiver that spreads the received values into the
    /// consumer.
    fn conv_call_v(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        let items = self.root_items(exp);
        if items.len() != 3 {
            return Err(CompileError::Malformed(":call/v"));
        }
        let pform = self.rt.heap.root(items[1]);
        let cform = items[2];
        let env2 = env.clone();
        self.conv(
            pform,
            env,
            Box::new(move |c, patom| {
                let cf = c.rt.heap.root(cform);
                c.conv(
                    cf,
                    &env2,
                    Box::new(move |c, catom| {
                        let (katom, reified) = c.make_cont(k)?;
                        let vs = c.supply.fresh("vs", false);
                        let rv = c.supply.fresh("recv", false);
                        let rbody = Rc::new(Instr::App {
                            func: catom,
                            args: vec![katom, Atom::Var(vs.clone())],
                            rest: true,
                        });
                        let rfunc = Rc::new(Func {
                            name: rv.clone(),
                            params: vec![vs],
                            rest: true,
                            body: rbody,
                        });
                        let inner = Rc::new(Instr::App {
                            func: patom,
                            args: vec![Atom::Var(rv)],
                            rest: false,
                        });
                        Ok(wrap_cont(
                            reified,
                            Rc::new(Instr::Fun {
                                func: rfunc,
                                body: inner,
                            }),
                        ))
                    }),
                )
            }),
        )
    }

    /// `(:apply f a ... l)`: the final argument is spread.
    fn conv_apply(&mut self, exp: Value, env: &Env, k: KCont<'a>) -> Result<Rc<Instr>> {
        let items = self.root_items(exp);
        if items.len() < 3 {
            return Err(CompileError::Malformed(":apply"));
        }
        let fform = items[1];
        let argforms: Vec<Root> = items[2..].to_vec();
        let env2 = env.clone();
        self.conv_args(
            argforms,
            env,
            Box::new(move |c, args| {
                let fv = c.rt.heap.root(fform);
                c.conv(
                    fv,
                    &env2,
                    Box::new(move |c, fatom| {
                        let (katom, reified) = c.make_cont(k)?;
                        let mut all = vec![katom];
                        all.extend(args);
                        let app = Rc::new(Instr::App {
                            func: fatom,
                            args: all,
                            rest: true,
                        });
                        Ok(wrap_cont(reified, app))
                    }),
                )
            }),
        )
    }

    /// Reify the meta-continuation as a CPS function, unless the body it
    /// produces is exactly `(app K (z))` for our fresh `z`, in which case
    /// `K` itself is the continuation.
    fn make_cont(&mut self, k: KCont<'a>) -> Result<(Atom, Option<Rc<Func>>)> {
        let z = self.supply.fresh("r", false);
        let body = k(self, Atom::Var(z.clone()))?;

        if let Instr::App {
            func,
            args,
            rest: false,
        } = &*body
        {
            if args.len() == 1 {
                if let (Atom::Var(kv), Atom::Var(a)) = (func, &args[0]) {
                    if a.id == z.id && kv.id != z.id {
                        return Ok((Atom::Var(kv.clone()), None));
                    }
                }
            }
        }

        let c = self.supply.fresh("c", false);
        let func = Rc::new(Func {
            name: c.clone(),
            params: vec![z],
            rest: false,
            body,
        });
        Ok((Atom::Var(c), Some(func)))
    }
}

fn wrap_cont(reified: Option<Rc<Func>>, instr: Rc<Instr>) -> Rc<Instr> {
    match reified {
        Some(func) => Rc::new(Instr::Fun { func, body: instr }),
        None => instr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suo_runtime::reader::read_str;

    fn runtime() -> Runtime {
        Runtime::new(65536)
    }

    fn convert(rt: &mut Runtime, src: &str) -> Result<Rc<Instr>> {
        let form = read_str(rt, src);
        Convert::new(rt, None, Value::NIL).convert_program(form)
    }

    fn count_funs(instr: &Instr) -> usize {
        match instr {
            Instr::App { .. } => 0,
            Instr::Fun { func, body } => 1 + count_funs(&func.body) + count_funs(body),
            Instr::Fix { funcs, body } => {
                funcs.iter().map(|f| count_funs(&f.body)).sum::<usize>() + count_funs(body)
            }
            Instr::Primop { conts, .. } => conts.iter().map(|c| count_funs(c)).sum(),
        }
    }

    #[test]
    fn identity_lambda_shape() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda (x) x)").unwrap();

        // fun (f (k x) ...) (bottom () (f))
        let (func, body) = match &*instr {
            Instr::Fun { func, body } => (func, body),
            other => panic!("expected fun, got {other}"),
        };
        assert!(matches!(
            &**body,
            Instr::Primop {
                op: Primop::Bottom, ..
            }
        ));
        assert_eq!(func.params.len(), 2, "continuation plus one parameter");
        assert!(!func.rest);

        // box the parameter, read it back, return through k
        let boxed = match &*func.body {
            Instr::Primop {
                op: Primop::Box,
                results,
                conts,
                ..
            } => {
                assert!(results[0].as_var().unwrap().boxed);
                &conts[0]
            }
            other => panic!("expected box, got {other}"),
        };
        match &**boxed {
            Instr::Primop {
                op: Primop::BoxRef,
                results,
                conts,
                ..
            } => {
                let t = results[0].as_var().unwrap().clone();
                match &*conts[0] {
                    Instr::App { func: f, args, rest } => {
                        assert!(!rest);
                        assert_eq!(f.as_var().unwrap().id, func.params[0].id);
                        assert_eq!(args.len(), 1);
                        assert_eq!(args[0].as_var().unwrap().id, t.id);
                    }
                    other => panic!("expected app of k, got {other}"),
                }
            }
            other => panic!("expected box-ref, got {other}"),
        }
    }

    #[test]
    fn top_level_must_be_a_lambda() {
        let mut rt = runtime();
        assert!(matches!(
            convert(&mut rt, "(f x)"),
            Err(CompileError::TopLevelNotLambda)
        ));
        assert!(matches!(
            convert(&mut rt, "42"),
            Err(CompileError::TopLevelNotLambda)
        ));
    }

    #[test]
    fn tail_calls_use_the_continuation_directly() {
        let mut rt = runtime();
        // The body call is in tail position: no continuation function may
        // be introduced between the call site and the enclosing func.
        let instr = convert(&mut rt, "(:lambda (f) (f f))").unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };
        assert_eq!(count_funs(&func.body), 0);
    }

    #[test]
    fn non_tail_calls_reify_a_continuation() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda (f) (:begin (f f) f))").unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };
        assert_eq!(count_funs(&func.body), 1);
    }

    #[test]
    fn set_of_a_boxed_local_keeps_box_primops() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda (x) (:begin (:set x 1) x))").unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };

        fn find_ops(instr: &Instr, out: &mut Vec<(Primop, Option<u32>)>) {
            if let Instr::Primop {
                op, args, conts, ..
            } = instr
            {
                out.push((*op, args.first().and_then(|a| a.as_var()).map(|v| v.id)));
                for c in conts {
                    find_ops(c, out);
                }
            } else if let Instr::Fun { func, body } = instr {
                find_ops(&func.body, out);
                find_ops(body, out);
            }
        }
        let mut ops = Vec::new();
        find_ops(&func.body, &mut ops);

        let set_box = ops
            .iter()
            .find(|(op, _)| *op == Primop::BoxSet)
            .expect("box-set survives");
        let read_box = ops
            .iter()
            .find(|(op, _)| *op == Primop::BoxRef)
            .expect("box-ref survives");
        // Both go through the same box variable.
        assert_eq!(set_box.1, read_box.1);
    }

    #[test]
    fn empty_begin_passes_unspecified() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda () (:begin))").unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };
        match &*func.body {
            Instr::App { args, .. } => assert!(matches!(args[0], Atom::Quote(_))),
            other => panic!("expected app, got {other}"),
        }
    }

    #[test]
    fn top_level_references_become_variable_ref() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda () g)").unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };
        assert!(matches!(
            &*func.body,
            Instr::Primop {
                op: Primop::VariableRef,
                ..
            }
        ));
    }

    #[test]
    fn top_level_set_becomes_variable_set() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda () (:set g 1))").unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };
        assert!(matches!(
            &*func.body,
            Instr::Primop {
                op: Primop::VariableSet,
                ..
            }
        ));
    }

    #[test]
    fn branching_primitive_gets_two_continuations() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda (x) (:primitive if x 1 2))").unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };

        fn find_if(instr: &Instr) -> Option<usize> {
            match instr {
                Instr::Primop { op: Primop::If, conts, .. } => Some(conts.len()),
                Instr::Primop { conts, .. } => conts.iter().find_map(|c| find_if(c)),
                Instr::Fun { func, body } => find_if(&func.body).or_else(|| find_if(body)),
                _ => None,
            }
        }
        assert_eq!(find_if(&func.body), Some(2));
    }

    #[test]
    fn macro_hook_expands_unknown_operators() {
        let mut rt = runtime();
        let form = read_str(&mut rt, "(:lambda (x) (my-id x))");
        let hook = |rt: &mut Runtime, form: Value| {
            // (my-id e) expands to e
            let items = rt.list_to_vec(form);
            let head = items[0];
            if rt.is_symbol(head) && rt.symbol_text(head) == "my-id" {
                Some(items[1])
            } else {
                None
            }
        };
        let instr = Convert::new(&mut rt, Some(&hook), Value::NIL)
            .convert_program(form)
            .unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };
        // No application remains, just box/box-ref and the return.
        assert_eq!(count_funs(&func.body), 0);
    }

    #[test]
    fn rest_parameters_are_flagged() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda (a . more) a)").unwrap();
        let func = match &*instr {
            Instr::Fun { func, .. } => func,
            other => panic!("expected fun, got {other}"),
        };
        assert!(func.rest);
        assert_eq!(func.params.len(), 3);
    }

    #[test]
    fn apply_sets_the_rest_flag_on_the_application() {
        let mut rt = runtime();
        let instr = convert(&mut rt, "(:lambda (f l) (:apply f l))").unwrap();

        fn find_rest_app(instr: &Instr) -> bool {
            match instr {
                Instr::App { rest, .. } => *rest,
                Instr::Fun { func, body } => find_rest_app(&func.body) || find_rest_app(body),
                Instr::Fix { funcs, body } => {
                    funcs.iter().any(|f| find_rest_app(&f.body)) || find_rest_app(body)
                }
                Instr::Primop { conts, .. } => conts.iter().any(|c| find_rest_app(c)),
            }
        }
        assert!(find_rest_app(&instr));
    }
}
