//! The `suo` binary: the bootstrap top level.
//!
//! Reads one form at a time from standard input, evaluates it with the
//! bootstrap evaluator, and writes the result to standard output; an
//! unspecified read result (end of input or a read error) ends the
//! session. With `--compile` each form is compiled instead and the
//! resulting closure record is written.

use std::io::{self, Write};

use clap::Parser;

use suo_compiler::cps::asm::BootAsm;
use suo_compiler::{cps_compile, CompileOptions};
use suo_runtime::eval::boot_eval;
use suo_runtime::reader::{boot_read, Input};
use suo_runtime::writer::boot_write;
use suo_runtime::{Runtime, Value, DEFAULT_SPACE_WORDS};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Check the heap and collect before every allocation.
    #[arg(short, long)]
    pub debug: bool,

    /// Words per semi-space.
    #[arg(long, default_value_t = DEFAULT_SPACE_WORDS)]
    pub heap_words: usize,

    /// Compile each form instead of evaluating it.
    #[arg(short, long)]
    pub compile: bool,
}

fn main() {
    env_logger::init();
    let options = Options::parse();

    let mut rt = Runtime::new(options.heap_words);
    rt.heap.collect_before_alloc = options.debug;
    rt.heap.check_enabled = options.debug;

    let stdin = io::stdin();
    let mut input = Input::new(stdin.lock());
    let stdout = io::stdout();
    let mut out = stdout.lock();

    loop {
        let x = boot_read(&mut rt, &mut input);
        if x == Value::UNSPEC {
            break;
        }

        let x = if options.compile {
            match cps_compile(&mut rt, x, &mut BootAsm, &CompileOptions::default()) {
                Ok(clos) => clos,
                Err(e) => {
                    eprintln!("compile error: {e}");
                    log::error!("compile error: {e}");
                    std::process::exit(1);
                }
            }
        } else {
            boot_eval(&mut rt, x)
        };

        if boot_write(&mut rt, &mut out, x).is_err() {
            break;
        }
        if writeln!(out).is_err() {
            break;
        }
    }
}
