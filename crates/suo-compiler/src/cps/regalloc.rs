//! Register allocation.
//!
//! Every function's parameters and every primop's results get contiguous
//! register indices, counting from 1 at each func boundary; register 0 is
//! reserved for the call signature. Nothing is ever reused — the bootstrap
//! compiler trades register pressure for simplicity, and no liveness
//! analysis runs here. Variables are rewritten to `reg` nodes through the
//! same scoped replacement environment closure conversion uses; function
//! labels stay symbolic until code generation replaces them with quoted
//! code blocks.

use std::rc::Rc;

use crate::cps::term::{Atom, Func, Instr};

type Repl = im_rc::HashMap<u32, Atom>;

pub fn assign(instr: &Rc<Instr>) -> Rc<Instr> {
    let mut counter = 1;
    walk_instr(instr, &Repl::new(), &mut counter)
}

fn subst(a: &Atom, repl: &Repl) -> Atom {
    match a {
        Atom::Var(v) => repl.get(&v.id).cloned().unwrap_or_else(|| a.clone()),
        _ => a.clone(),
    }
}

fn walk_instr(instr: &Rc<Instr>, repl: &Repl, counter: &mut u32) -> Rc<Instr> {
    match &**instr {
        Instr::App { func, args, rest } => Rc::new(Instr::App {
            func: subst(func, repl),
            args: args.iter().map(|a| subst(a, repl)).collect(),
            rest: *rest,
        }),

        Instr::Fun { func, body } => Rc::new(Instr::Fun {
            func: walk_func(func, repl),
            body: walk_instr(body, repl, counter),
        }),

        Instr::Fix { funcs, body } => Rc::new(Instr::Fix {
            funcs: funcs.iter().map(|f| walk_func(f, repl)).collect(),
            body: walk_instr(body, repl, counter),
        }),

        Instr::Primop {
            op,
            results,
            args,
            conts,
        } => {
            let args: Vec<Atom> = args.iter().map(|a| subst(a, repl)).collect();
            let mut repl = repl.clone();
            let results: Vec<Atom> = results
                .iter()
                .map(|r| match r {
                    Atom::Var(v) => {
                        let reg = *counter;
                        *counter += 1;
                        repl.insert(v.id, Atom::Reg(reg));
                        Atom::Reg(reg)
                    }
                    other => other.clone(),
                })
                .collect();
            let conts = conts
                .iter()
                .map(|c| walk_instr(c, &repl, counter))
                .collect();
            Rc::new(Instr::Primop {
                op: *op,
                results,
                args,
                conts,
            })
        }
    }
}

fn walk_func(func: &Rc<Func>, repl: &Repl) -> Rc<Func> {
    let mut counter = 1;
    let mut repl = repl.clone();
    for p in &func.params {
        repl.insert(p.id, Atom::Reg(counter));
        counter += 1;
    }
    let body = walk_instr(&func.body, &repl, &mut counter);
    Rc::new(Func {
        name: func.name.clone(),
        params: func.params.clone(),
        rest: func.rest,
        body,
    })
}
