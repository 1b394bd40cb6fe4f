//! The CPS intermediate representation.
//!
//! Values are variable references, quoted constants, or (after register
//! allocation) register indices. Instructions are applications, function
//! bindings, and primitive operations carrying their continuations; they
//! form the control-flow backbone of the compiler. Nodes are immutable
//! after construction and shared through `Rc`, which is what makes the
//! per-node memoisation in the free-variable analysis sound.
//!
//! Quoted constants are held as heap roots rather than raw words: the
//! collector may run while an IR tree is alive (code blocks are allocated
//! per function), and a root slot is the only address that survives that.

use std::fmt;
use std::rc::Rc;

use suo_runtime::Root;

pub type VarRef = Rc<Var>;

/// A CPS variable: a name for debugging, a unique id for identity, and a
/// flag marking variables that denote mutable (boxed) bindings.
#[derive(Debug)]
pub struct Var {
    pub name: String,
    pub id: u32,
    pub boxed: bool,
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Var {}

impl std::hash::Hash for Var {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.id)
    }
}

/// Hands out fresh variables; ids are unique per compilation.
pub struct VarSupply {
    next: u32,
}

impl VarSupply {
    pub fn new() -> VarSupply {
        VarSupply { next: 0 }
    }

    pub fn fresh(&mut self, name: &str, boxed: bool) -> VarRef {
        let id = self.next;
        self.next += 1;
        Rc::new(Var {
            name: name.to_string(),
            id,
            boxed,
        })
    }
}

impl Default for VarSupply {
    fn default() -> Self {
        VarSupply::new()
    }
}

/// A CPS value.
#[derive(Clone, Debug)]
pub enum Atom {
    Var(VarRef),
    Quote(Root),
    Reg(u32),
}

impl Atom {
    pub fn as_var(&self) -> Option<&VarRef> {
        match self {
            Atom::Var(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Var(v) => write!(f, "{v}"),
            Atom::Quote(r) => write!(f, "'lit{}", r.index()),
            Atom::Reg(n) => write!(f, "r{n}"),
        }
    }
}

/// A function: its label variable, parameters, rest flag and body. The
/// continuation parameter, when there is one, is an ordinary leading
/// parameter.
#[derive(Debug)]
pub struct Func {
    pub name: VarRef,
    pub params: Vec<VarRef>,
    pub rest: bool,
    pub body: Rc<Instr>,
}

/// A CPS instruction.
#[derive(Debug)]
pub enum Instr {
    /// Apply `func` to `args`; with `rest` set, the final argument is a
    /// pre-built list spread into the callee's frame.
    App {
        func: Atom,
        args: Vec<Atom>,
        rest: bool,
    },

    /// Bind one function over `body`.
    Fun { func: Rc<Func>, body: Rc<Instr> },

    /// Bind a block of mutually recursive functions over `body`.
    /// Conversion never introduces this; it is part of the IR for
    /// completeness.
    Fix {
        funcs: Vec<Rc<Func>>,
        body: Rc<Instr>,
    },

    /// A primitive operation: results are bound over the continuations.
    /// For branching primops the true branch is continuation 0.
    Primop {
        op: Primop,
        results: Vec<Atom>,
        args: Vec<Atom>,
        conts: Vec<Rc<Instr>>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Primop {
    /// Allocate a one-field box around the argument.
    Box,
    BoxRef,
    BoxSet,
    /// Top-level variable access, by quoted symbol.
    VariableRef,
    VariableSet,
    If,
    /// `(if-record? type x ...)` branch on record type.
    IfRecord,
    Vector,
    VectorRef,
    Record,
    RecordRef,
    Add,
    Mul,
    /// Trap out of generated code; no continuation.
    Syscall,
    /// The terminal point of the top-level function.
    Bottom,
}

impl Primop {
    /// How many continuations the primop carries.
    pub fn cont_arity(self) -> usize {
        match self {
            Primop::If | Primop::IfRecord => 2,
            Primop::Syscall | Primop::Bottom => 0,
            _ => 1,
        }
    }

    /// How many results the primop binds.
    pub fn result_arity(self) -> usize {
        match self {
            Primop::If | Primop::IfRecord | Primop::Syscall | Primop::Bottom => 0,
            Primop::BoxSet | Primop::VariableSet => 0,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primop::Box => "box",
            Primop::BoxRef => "box-ref",
            Primop::BoxSet => "box-set",
            Primop::VariableRef => "variable-ref",
            Primop::VariableSet => "variable-set",
            Primop::If => "if",
            Primop::IfRecord => "if-record?",
            Primop::Vector => "vector",
            Primop::VectorRef => "vector-ref",
            Primop::Record => "record",
            Primop::RecordRef => "record-ref",
            Primop::Add => "add",
            Primop::Mul => "mul",
            Primop::Syscall => "syscall",
            Primop::Bottom => "bottom",
        }
    }

    pub fn from_name(name: &str) -> Option<Primop> {
        let op = match name {
            "box" => Primop::Box,
            "box-ref" => Primop::BoxRef,
            "box-set" => Primop::BoxSet,
            "variable-ref" => Primop::VariableRef,
            "variable-set" => Primop::VariableSet,
            "if" => Primop::If,
            "if-record?" => Primop::IfRecord,
            "vector" => Primop::Vector,
            "vector-ref" => Primop::VectorRef,
            "record" => Primop::Record,
            "record-ref" => Primop::RecordRef,
            "add" => Primop::Add,
            "mul" => Primop::Mul,
            "syscall" => Primop::Syscall,
            "bottom" => Primop::Bottom,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::App { func, args, rest } => {
                write!(f, "(app{} {func}", if *rest { "*" } else { "" })?;
                for a in args {
                    write!(f, " {a}")?;
                }
                write!(f, ")")
            }
            Instr::Fun { func, body } => {
                write!(f, "(fun {} {body})", FuncDisplay(func))
            }
            Instr::Fix { funcs, body } => {
                write!(f, "(fix (")?;
                for func in funcs {
                    write!(f, " {}", FuncDisplay(func))?;
                }
                write!(f, ") {body})")
            }
            Instr::Primop {
                op,
                results,
                args,
                conts,
            } => {
                write!(f, "({} (", op.name())?;
                for r in results {
                    write!(f, "{r} ")?;
                }
                write!(f, ") (")?;
                for a in args {
                    write!(f, "{a} ")?;
                }
                write!(f, ")")?;
                for c in conts {
                    write!(f, " {c}")?;
                }
                write!(f, ")")
            }
        }
    }
}

struct FuncDisplay<'a>(&'a Func);

impl fmt::Display for FuncDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} (", self.0.name)?;
        for p in &self.0.params {
            write!(f, "{p} ")?;
        }
        write!(f, "){} {})", if self.0.rest { "*" } else { "" }, self.0.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vars_compare_by_id() {
        let mut supply = VarSupply::new();
        let a = supply.fresh("x", false);
        let b = supply.fresh("x", false);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn primop_arities() {
        assert_eq!(Primop::If.cont_arity(), 2);
        assert_eq!(Primop::IfRecord.cont_arity(), 2);
        assert_eq!(Primop::Bottom.cont_arity(), 0);
        assert_eq!(Primop::Syscall.cont_arity(), 0);
        assert_eq!(Primop::BoxRef.cont_arity(), 1);
        assert_eq!(Primop::BoxSet.result_arity(), 0);
        assert_eq!(Primop::Vector.result_arity(), 1);
    }

    #[test]
    fn primop_names_round_trip() {
        for op in [
            Primop::Box,
            Primop::BoxRef,
            Primop::BoxSet,
            Primop::VariableRef,
            Primop::VariableSet,
            Primop::If,
            Primop::IfRecord,
            Primop::Vector,
            Primop::VectorRef,
            Primop::Record,
            Primop::RecordRef,
            Primop::Add,
            Primop::Mul,
            Primop::Syscall,
            Primop::Bottom,
        ] {
            assert_eq!(Primop::from_name(op.name()), Some(op));
        }
        assert_eq!(Primop::from_name("no-such-primop"), None);
    }
}
