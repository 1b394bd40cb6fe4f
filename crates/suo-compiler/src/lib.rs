//! The Suo compiler.
//!
//! A multi-pass pipeline from the post-macroexpansion mini-language to a
//! closed closure record in the runtime heap:
//!
//! 1. CPS conversion ([`cps::convert`]) - a meta-continuation traversal
//!    producing the CPS IR.
//! 2. Free-variable analysis ([`cps::free`]) - memoised used/bound/free
//!    sets per node.
//! 3. Closure conversion ([`cps::closure`]) - no function keeps a free
//!    variable; applications go through closure records.
//! 4. Register allocation ([`cps::regalloc`]) - fresh contiguous indices
//!    per function, no reuse.
//! 5. Code generation ([`cps::codegen`]) - drives an external assembler
//!    through a narrow interface and returns the outer function's closure
//!    record.
//!
//! The compiler runs as a client of `suo-runtime`: every quoted constant
//! is registered as a heap root for the duration of the compilation, so
//! the collector is free to run whenever code blocks are allocated.

pub mod cps;
pub mod error;

use suo_runtime::{Runtime, Value};

use cps::closure::ClosureConvert;
use cps::codegen::{Assembler, Codegen};
use cps::convert::{Convert, MacroHook};
use cps::regalloc;
pub use error::{CompileError, Result};

/// Everything the pipeline can be parameterised with.
#[derive(Default)]
pub struct CompileOptions<'h> {
    /// Expansion hook for unknown operators in call position.
    pub hook: Option<MacroHook<'h>>,
    /// The value `( :bootinfo )` quotes; nil when absent.
    pub bootinfo: Option<Value>,
    /// The `error:not-a-closure` handler; only consulted when it is bound
    /// to a closure record.
    pub not_a_closure_handler: Option<Value>,
}

/// Compile a whole program - a single `:lambda` form - into a closure
/// record with the generated code block and an empty captured vector.
///
/// The returned value is not rooted; the caller must register it before
/// the next allocation point.
pub fn cps_compile(
    rt: &mut Runtime,
    form: Value,
    asm: &mut dyn Assembler,
    options: &CompileOptions,
) -> Result<Value> {
    let mark = rt.heap.mark();

    let result = compile_inner(rt, form, asm, options);

    rt.heap.release(mark);
    result
}

fn compile_inner(
    rt: &mut Runtime,
    form: Value,
    asm: &mut dyn Assembler,
    options: &CompileOptions,
) -> Result<Value> {
    let bootinfo = options.bootinfo.unwrap_or(Value::NIL);

    let (instr, supply) = {
        let mut conv = Convert::new(rt, options.hook, bootinfo);
        let instr = conv.convert_program(form)?;
        (instr, std::mem::take(&mut conv.supply))
    };
    log::debug!("cps conversion: {instr}");

    let closed = {
        let mut cc = ClosureConvert::new(rt, supply, options.not_a_closure_handler);
        cc.convert_program(&instr)?
    };
    log::debug!("closure conversion: {closed}");

    let assigned = regalloc::assign(&closed);
    log::debug!("register allocation: {assigned}");

    Codegen::new(rt, asm).compile(&assigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cps::asm::BootAsm;
    use suo_runtime::reader::read_str;

    fn runtime() -> Runtime {
        Runtime::new(131072)
    }

    fn compile(rt: &mut Runtime, src: &str) -> Result<Value> {
        let form = read_str(rt, src);
        cps_compile(rt, form, &mut BootAsm, &CompileOptions::default())
    }

    fn code_text(rt: &Runtime, code: Value) -> String {
        let bytes: Vec<u8> = (0..rt.heap.bytev_len(code))
            .map(|i| rt.heap.bytev_ref_u8(code, i))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn compiles_the_identity_function() {
        let mut rt = runtime();
        let clos = compile(&mut rt, "(:lambda (x) x)").unwrap();

        assert!(rt.is_closure(clos));
        let code = rt.heap.rec_ref(clos, 0);
        assert!(rt.heap.is_code(code));
        let captured = rt.heap.rec_ref(clos, 1);
        assert!(captured.is_vec());
        assert_eq!(rt.heap.vec_len(captured), 0);

        let text = code_text(&rt, code);
        assert!(text.starts_with("enter 6\n"), "three parameters, no rest");
        assert!(text.contains("box ("), "parameter boxing survives to code");
        assert!(text.contains("box-ref ("));
    }

    #[test]
    fn compiles_calls_with_signature_in_register_zero() {
        let mut rt = runtime();
        let clos = compile(&mut rt, "(:lambda (f x) (f x))").unwrap();
        let code = rt.heap.rec_ref(clos, 0);
        let text = code_text(&rt, code);
        // The call shuffles the signature literal into r0 and jumps.
        assert!(text.contains("load l"));
        assert!(text.contains(" r0\n"));
        assert!(text.contains("go r"));
        // The closure guard branches over a label.
        assert!(text.contains("if-record?"));
        assert!(text.contains("L0:"));
        assert!(text.contains("syscall"));
    }

    #[test]
    fn compiles_set_and_read() {
        let mut rt = runtime();
        let clos = compile(&mut rt, "(:lambda (x) (:begin (:set x 1) x))").unwrap();
        let code = rt.heap.rec_ref(clos, 0);
        let text = code_text(&rt, code);
        assert!(text.contains("box-set"));
        assert!(text.contains("box-ref"));
    }

    #[test]
    fn nested_lambdas_generate_nested_code_blocks() {
        let mut rt = runtime();
        let clos = compile(&mut rt, "(:lambda (x) (:lambda (y) x))").unwrap();
        let code = rt.heap.rec_ref(clos, 0);
        let text = code_text(&rt, code);
        // The outer code builds the inner closure record around a code
        // literal.
        assert!(text.contains("vector ("));
        assert!(text.contains("record ("));

        // One of the outer literals is the inner code block.
        let has_code_lit = (0..rt.heap.code_lit_count(code))
            .any(|i| rt.heap.is_code(rt.heap.code_lit_ref(code, i)));
        assert!(has_code_lit);
    }

    #[test]
    fn compiled_result_survives_collection() {
        let mut rt = runtime();
        rt.heap.check_enabled = true;
        let clos = compile(&mut rt, "(:lambda (x) (:lambda (y) x))").unwrap();
        let r = rt.heap.push_root(clos);
        rt.heap.collect_now();
        rt.heap.collect_now();
        let clos = rt.heap.root(r);
        assert!(rt.is_closure(clos));
        let code = rt.heap.rec_ref(clos, 0);
        assert!(rt.heap.is_code(code));
        assert!(code_text(&rt, code).starts_with("enter"));
    }

    #[test]
    fn compile_releases_its_roots() {
        let mut rt = runtime();
        let before = rt.heap.mark();
        let _ = compile(&mut rt, "(:lambda (x) (:lambda (y) x))").unwrap();
        assert_eq!(rt.heap.mark(), before);
    }

    #[test]
    fn rejects_non_lambda_programs() {
        let mut rt = runtime();
        assert!(matches!(
            compile(&mut rt, "(f x)"),
            Err(CompileError::TopLevelNotLambda)
        ));
    }

    #[test]
    fn bootinfo_value_reaches_the_literals() {
        let mut rt = runtime();
        let info = rt.intern("the-boot-info");
        let ir = rt.heap.push_root(info);
        let form = read_str(&mut rt, "(:lambda () (:bootinfo))");
        let info = rt.heap.root(ir);
        let clos = cps_compile(
            &mut rt,
            form,
            &mut BootAsm,
            &CompileOptions {
                bootinfo: Some(info),
                ..Default::default()
            },
        )
        .unwrap();
        let code = rt.heap.rec_ref(clos, 0);
        let info = rt.heap.root(ir);
        let found = (0..rt.heap.code_lit_count(code))
            .any(|i| rt.heap.code_lit_ref(code, i) == info);
        assert!(found);
    }

    #[test]
    fn handler_closure_is_called_instead_of_trapping() {
        let mut rt = runtime();
        // Any closure record will do as a handler.
        let handler = compile(&mut rt, "(:lambda (x) x)").unwrap();
        let hr = rt.heap.push_root(handler);

        let form = read_str(&mut rt, "(:lambda (f) (f f))");
        let handler = rt.heap.root(hr);
        let clos = cps_compile(
            &mut rt,
            form,
            &mut BootAsm,
            &CompileOptions {
                not_a_closure_handler: Some(handler),
                ..Default::default()
            },
        )
        .unwrap();
        let code = rt.heap.rec_ref(clos, 0);
        let text = code_text(&rt, code);
        assert!(!text.contains("syscall"));

        // A non-closure handler is ignored.
        let form = read_str(&mut rt, "(:lambda (f) (f f))");
        let clos = cps_compile(
            &mut rt,
            form,
            &mut BootAsm,
            &CompileOptions {
                not_a_closure_handler: Some(Value::fixnum(1)),
                ..Default::default()
            },
        )
        .unwrap();
        let code = rt.heap.rec_ref(clos, 0);
        assert!(code_text(&rt, code).contains("syscall"));
    }
}
