//! The code-generation driver.
//!
//! The driver walks register-allocated CPS and steers an external
//! assembler context through a narrow interface: labels, a prologue
//! declaring the expected signature, a parallel `shuffle` into argument
//! registers, `go`, and per-primop emission. Each `func` gets its own
//! context and finishes into a code-block value; `fun` binds the label
//! variable to that code block (as a quoted value) for the rest of the
//! walk.
//!
//! The signature of a call or function encodes arity and rest-flag as
//! `2*argc - (1 if rest else 0)`.

use std::rc::Rc;

use fxhash::FxHashMap;

use suo_runtime::{Root, Runtime, Value};

use crate::cps::term::{Atom, Func, Instr, Primop};
use crate::error::{CompileError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(pub u32);

/// An operand handed to the assembler: a register, or a literal rooted in
/// the heap.
#[derive(Clone, Copy, Debug)]
pub enum AsmOperand {
    Reg(u32),
    Lit(Root),
}

/// One assembler buffer; `finish` seals it into a code-block value.
pub trait AsmContext {
    fn make_label(&mut self) -> Label;
    fn def_label(&mut self, label: Label);
    /// Emit the entry sequence for a function of the given signature.
    fn prologue(&mut self, signature: i32);
    /// Move `sources` into `dests` as a parallel assignment, minimal moves,
    /// cycles broken through a scratch register.
    fn shuffle(&mut self, sources: &[AsmOperand], dests: &[u32]);
    /// Jump to the code block in `reg`.
    fn go(&mut self, reg: u32);
    /// Emit one primop; the first continuation falls through, the others
    /// land at `labels`.
    fn primop(&mut self, op: Primop, results: &[u32], args: &[AsmOperand], labels: &[Label]);
    fn finish(self: Box<Self>, rt: &mut Runtime) -> Value;
}

pub trait Assembler {
    fn make_context(&mut self) -> Box<dyn AsmContext>;
}

pub fn signature(argc: usize, rest: bool) -> i32 {
    2 * argc as i32 - i32::from(rest)
}

pub struct Codegen<'a> {
    rt: &'a mut Runtime,
    asm: &'a mut dyn Assembler,
    /// Function labels already generated, as rooted code blocks.
    code: FxHashMap<u32, Root>,
}

impl<'a> Codegen<'a> {
    pub fn new(rt: &'a mut Runtime, asm: &'a mut dyn Assembler) -> Codegen<'a> {
        Codegen {
            rt,
            asm,
            code: FxHashMap::default(),
        }
    }

    /// Compile a closed, register-allocated program and return the
    /// `closure`-type record for its outer function. The caller owns the
    /// result: it is not rooted here.
    pub fn compile(mut self, instr: &Rc<Instr>) -> Result<Value> {
        let func = match &**instr {
            Instr::Fun { func, body } => match &**body {
                Instr::Primop {
                    op: Primop::Bottom, ..
                } => func,
                _ => return Err(CompileError::TopLevelNotLambda),
            },
            _ => return Err(CompileError::TopLevelNotLambda),
        };

        let code = self.gen_func(func)?;
        let captured = self.rt.vec_make(0, Value::UNSPEC);
        let code = self.rt.heap.root(code);
        let ty = self.rt.closure_type();
        Ok(self.rt.rec_make(ty, &[code, captured]))
    }

    fn operand(&mut self, a: &Atom) -> Result<AsmOperand> {
        match a {
            Atom::Reg(r) => Ok(AsmOperand::Reg(*r)),
            Atom::Quote(root) => Ok(AsmOperand::Lit(*root)),
            Atom::Var(v) => match self.code.get(&v.id) {
                Some(root) => Ok(AsmOperand::Lit(*root)),
                None => Err(CompileError::UnboundCodeLabel(v.name.clone())),
            },
        }
    }

    fn gen_func(&mut self, func: &Rc<Func>) -> Result<Root> {
        let mut ctxt = self.asm.make_context();
        ctxt.prologue(signature(func.params.len(), func.rest));
        self.gen(ctxt.as_mut(), &func.body)?;
        let code = ctxt.finish(self.rt);
        Ok(self.rt.heap.push_root(code))
    }

    fn gen(&mut self, ctxt: &mut dyn AsmContext, instr: &Rc<Instr>) -> Result<()> {
        match &**instr {
            Instr::App { func, args, rest } => {
                let sig = signature(args.len(), *rest);
                let sig_root = self.rt.heap.push_root(Value::fixnum(sig));

                let n = args.len() as u32;
                let mut sources = vec![AsmOperand::Lit(sig_root)];
                for a in args {
                    sources.push(self.operand(a)?);
                }
                sources.push(self.operand(func)?);
                let dests: Vec<u32> = (0..=n + 1).collect();

                ctxt.shuffle(&sources, &dests);
                ctxt.go(n + 1);
                Ok(())
            }

            Instr::Fun { func, body } => {
                let code = self.gen_func(func)?;
                self.code.insert(func.name.id, code);
                self.gen(ctxt, body)
            }

            Instr::Fix { funcs, body } => {
                for func in funcs {
                    let code = self.gen_func(func)?;
                    self.code.insert(func.name.id, code);
                }
                self.gen(ctxt, body)
            }

            Instr::Primop {
                op,
                results,
                args,
                conts,
            } => {
                let labels: Vec<Label> = (1..conts.len()).map(|_| ctxt.make_label()).collect();

                let mut regs = Vec::new();
                for r in results {
                    match r {
                        Atom::Reg(n) => regs.push(*n),
                        other => {
                            return Err(CompileError::UnboundCodeLabel(format!(
                                "unallocated primop result {other}"
                            )))
                        }
                    }
                }
                let mut operands = Vec::new();
                for a in args {
                    operands.push(self.operand(a)?);
                }

                ctxt.primop(*op, &regs, &operands, &labels);

                if conts.is_empty() {
                    return Ok(());
                }
                self.gen(ctxt, &conts[0])?;
                for (label, cont) in labels.iter().zip(&conts[1..]) {
                    ctxt.def_label(*label);
                    self.gen(ctxt, cont)?;
                }
                Ok(())
            }
        }
    }
}
