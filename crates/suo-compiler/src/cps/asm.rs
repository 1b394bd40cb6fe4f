//! The bootstrap assembler.
//!
//! A real backend assembles machine code behind the [`AsmContext`]
//! interface; this one assembles a readable mnemonic listing instead, with
//! the quoted operands collected into the code block's literal vector. It
//! is enough to drive the code-generation driver end to end, to give the
//! collector genuine code blocks to move around, and to pin down the
//! `shuffle` contract: a parallel assignment in the minimal number of
//! moves, cycles broken through a scratch register.

use std::fmt::Write;

use itertools::Itertools;
use suo_runtime::{Root, Runtime, Value};

use crate::cps::codegen::{AsmContext, AsmOperand, Assembler, Label};
use crate::cps::term::Primop;

const SCRATCH: u32 = u32::MAX;

fn reg_name(r: u32) -> String {
    if r == SCRATCH {
        "rs".to_string()
    } else {
        format!("r{r}")
    }
}

pub struct BootAsm;

impl Assembler for BootAsm {
    fn make_context(&mut self) -> Box<dyn AsmContext> {
        Box::new(BootCtxt::new())
    }
}

pub struct BootCtxt {
    text: String,
    lits: Vec<Root>,
    next_label: u32,
}

impl BootCtxt {
    pub fn new() -> BootCtxt {
        BootCtxt {
            text: String::new(),
            lits: Vec::new(),
            next_label: 0,
        }
    }

    fn operand_name(&mut self, a: &AsmOperand) -> String {
        match a {
            AsmOperand::Reg(r) => reg_name(*r),
            AsmOperand::Lit(root) => {
                self.lits.push(*root);
                format!("l{}", self.lits.len() - 1)
            }
        }
    }

    fn emit_move(&mut self, src: &str, dst: u32) {
        let _ = writeln!(self.text, "move {src} {}", reg_name(dst));
    }
}

impl Default for BootCtxt {
    fn default() -> Self {
        BootCtxt::new()
    }
}

impl AsmContext for BootCtxt {
    fn make_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    fn def_label(&mut self, label: Label) {
        let _ = writeln!(self.text, "L{}:", label.0);
    }

    fn prologue(&mut self, signature: i32) {
        let _ = writeln!(self.text, "enter {signature}");
    }

    fn shuffle(&mut self, sources: &[AsmOperand], dests: &[u32]) {
        debug_assert_eq!(sources.len(), dests.len());

        // Register-to-register moves first; literal loads cannot clobber a
        // pending source once they run last, because destinations are
        // distinct.
        let mut pending: Vec<(u32, u32)> = Vec::new();
        let mut loads: Vec<(AsmOperand, u32)> = Vec::new();
        for (s, d) in sources.iter().zip(dests) {
            match s {
                AsmOperand::Reg(r) if *r == *d => {}
                AsmOperand::Reg(r) => pending.push((*r, *d)),
                lit => loads.push((*lit, *d)),
            }
        }

        while !pending.is_empty() {
            let safe = (0..pending.len()).find(|&i| {
                let d = pending[i].1;
                !pending
                    .iter()
                    .enumerate()
                    .any(|(j, (s, _))| j != i && *s == d)
            });
            match safe {
                Some(i) => {
                    let (s, d) = pending.remove(i);
                    let src = reg_name(s);
                    self.emit_move(&src, d);
                }
                None => {
                    // Every pending destination is also a pending source:
                    // a cycle. Park one destination in the scratch
                    // register and retarget its readers.
                    let (_, d) = pending[0];
                    let src = reg_name(d);
                    self.emit_move(&src, SCRATCH);
                    for p in pending.iter_mut() {
                        if p.0 == d {
                            p.0 = SCRATCH;
                        }
                    }
                }
            }
        }

        for (lit, d) in loads {
            let src = self.operand_name(&lit);
            let _ = writeln!(self.text, "load {src} {}", reg_name(d));
        }
    }

    fn go(&mut self, reg: u32) {
        let _ = writeln!(self.text, "go {}", reg_name(reg));
    }

    fn primop(&mut self, op: Primop, results: &[u32], args: &[AsmOperand], labels: &[Label]) {
        let results = results.iter().map(|r| reg_name(*r)).join(" ");
        let args: Vec<String> = args.iter().map(|a| self.operand_name(a)).collect();
        let labels = labels.iter().map(|l| format!("L{}", l.0)).join(" ");
        let _ = writeln!(
            self.text,
            "{} ({results}) ({}) ({labels})",
            op.name(),
            args.join(" ")
        );
    }

    fn finish(self: Box<Self>, rt: &mut Runtime) -> Value {
        let bytes = self.text.as_bytes();
        let code = rt.heap.code_alloc(bytes.len(), self.lits.len());
        for (i, b) in bytes.iter().enumerate() {
            rt.heap.bytev_set_u8(code, i, *b);
        }
        for (i, root) in self.lits.iter().enumerate() {
            let v = rt.heap.root(*root);
            rt.heap.code_lit_set(code, i, v);
        }
        code
    }
}
