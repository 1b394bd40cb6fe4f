//! Used, bound, and free variable sets over CPS trees.
//!
//! All three functions are memoised per node; nodes are immutable and
//! shared by `Rc`, so pointer identity is a sound memo key for the whole
//! compilation. Sets hold variable ids; the analysis also remembers which
//! `Var` each id names so later passes can materialise references.

use std::rc::Rc;

use fxhash::FxHashMap;

use crate::cps::term::{Atom, Func, Instr, VarRef};

pub type IdSet = im_rc::HashSet<u32>;

#[derive(Default)]
pub struct Analysis {
    vars: FxHashMap<u32, VarRef>,
    used_instr: FxHashMap<usize, IdSet>,
    used_func: FxHashMap<usize, IdSet>,
    bound_instr: FxHashMap<usize, IdSet>,
    bound_func: FxHashMap<usize, IdSet>,
    free_instr: FxHashMap<usize, IdSet>,
    free_func: FxHashMap<usize, IdSet>,
}

fn key_i(i: &Rc<Instr>) -> usize {
    Rc::as_ptr(i) as usize
}

fn key_f(f: &Rc<Func>) -> usize {
    Rc::as_ptr(f) as usize
}

impl Analysis {
    pub fn new() -> Analysis {
        Analysis::default()
    }

    /// The variable behind an id seen during analysis.
    pub fn var(&self, id: u32) -> VarRef {
        self.vars
            .get(&id)
            .expect("analysis has seen every used variable")
            .clone()
    }

    fn note(&mut self, v: &VarRef) {
        self.vars.entry(v.id).or_insert_with(|| v.clone());
    }

    fn used_atom(&mut self, a: &Atom) -> Option<u32> {
        match a {
            Atom::Var(v) => {
                self.note(v);
                Some(v.id)
            }
            _ => None,
        }
    }

    pub fn used(&mut self, instr: &Rc<Instr>) -> IdSet {
        let key = key_i(instr);
        if let Some(s) = self.used_instr.get(&key) {
            return s.clone();
        }
        let set = match &**instr {
            Instr::App { func, args, .. } => {
                let mut s: IdSet = args.iter().filter_map(|a| self.used_atom(a)).collect();
                s.extend(self.used_atom(func));
                s
            }
            Instr::Fun { func, body } => self.used_func(func).union(self.used(body)),
            Instr::Fix { funcs, body } => {
                let mut s = self.used(body);
                for f in funcs {
                    s = s.union(self.used_func(f));
                }
                s
            }
            Instr::Primop { args, conts, .. } => {
                let mut s: IdSet = args.iter().filter_map(|a| self.used_atom(a)).collect();
                for c in conts {
                    s = s.union(self.used(c));
                }
                s
            }
        };
        self.used_instr.insert(key, set.clone());
        set
    }

    pub fn used_func(&mut self, func: &Rc<Func>) -> IdSet {
        let key = key_f(func);
        if let Some(s) = self.used_func.get(&key) {
            return s.clone();
        }
        let set = self.used(&func.body);
        self.used_func.insert(key, set.clone());
        set
    }

    pub fn bound(&mut self, instr: &Rc<Instr>) -> IdSet {
        let key = key_i(instr);
        if let Some(s) = self.bound_instr.get(&key) {
            return s.clone();
        }
        let set = match &**instr {
            Instr::App { .. } => IdSet::new(),
            Instr::Fun { func, body } => {
                let mut s = self.bound_func(func).union(self.bound(body));
                s.insert(func.name.id);
                s
            }
            Instr::Fix { funcs, body } => {
                let mut s = self.bound(body);
                for f in funcs {
                    s = s.union(self.bound_func(f));
                    s.insert(f.name.id);
                }
                s
            }
            Instr::Primop { results, conts, .. } => {
                let mut s: IdSet = results
                    .iter()
                    .filter_map(|r| r.as_var().map(|v| v.id))
                    .collect();
                for c in conts {
                    s = s.union(self.bound(c));
                }
                s
            }
        };
        self.bound_instr.insert(key, set.clone());
        set
    }

    pub fn bound_func(&mut self, func: &Rc<Func>) -> IdSet {
        let key = key_f(func);
        if let Some(s) = self.bound_func.get(&key) {
            return s.clone();
        }
        let mut set = self.bound(&func.body);
        for p in &func.params {
            self.note(p);
            set.insert(p.id);
        }
        self.bound_func.insert(key, set.clone());
        set
    }

    /// Free variables, computed structurally: parameters disappear at the
    /// func boundary, the label at the fun boundary, results at the primop
    /// boundary.
    pub fn free(&mut self, instr: &Rc<Instr>) -> IdSet {
        let key = key_i(instr);
        if let Some(s) = self.free_instr.get(&key) {
            return s.clone();
        }
        let set = match &**instr {
            Instr::App { func, args, .. } => {
                let mut s: IdSet = args.iter().filter_map(|a| self.used_atom(a)).collect();
                s.extend(self.used_atom(func));
                s
            }
            Instr::Fun { func, body } => {
                let mut s = self.free_func(func).union(self.free(body));
                s.remove(&func.name.id);
                s
            }
            Instr::Fix { funcs, body } => {
                let mut s = self.free(body);
                for f in funcs {
                    s = s.union(self.free_func(f));
                }
                for f in funcs {
                    s.remove(&f.name.id);
                }
                s
            }
            Instr::Primop { results, args, conts, .. } => {
                let mut s = IdSet::new();
                for c in conts {
                    s = s.union(self.free(c));
                }
                for r in results {
                    if let Some(v) = r.as_var() {
                        s.remove(&v.id);
                    }
                }
                s.extend(args.iter().filter_map(|a| self.used_atom(a)));
                s
            }
        };
        self.free_instr.insert(key, set.clone());
        set
    }

    /// Free variables of a function: the body's, minus the parameters.
    pub fn free_func(&mut self, func: &Rc<Func>) -> IdSet {
        let key = key_f(func);
        if let Some(s) = self.free_func.get(&key) {
            return s.clone();
        }
        let mut set = self.free(&func.body);
        for p in &func.params {
            self.note(p);
            set.remove(&p.id);
        }
        self.free_func.insert(key, set.clone());
        set
    }
}
