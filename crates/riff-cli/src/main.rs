//! Command-line driver.
//!
//! The surface parser and compiler live outside this workspace, so the
//! binary drives the pipeline on a built-in benchmark program (a hot
//! reduction loop assembled through the bytecode builder). Flags:
//!
//! * `-v` / `--verbose` — print trace lifecycle events and optimized IR
//! * `--no-jit` — interpreter only, no recording
//! * `--machine` — prefer the x86-64 backend over the tile interpreter
//! * `-n <iterations>` — loop bound (default 100000)

use std::{env, process::ExitCode, rc::Rc, time::Instant};

use riff::{
    Backend, JitConfig, StderrTracer, Thread, Value,
    bytecode::{Opcode, ProtoBuilder, Prototype, name, reg},
};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let mut verbose = false;
    let mut jit = true;
    let mut machine = false;
    let mut n: i64 = 100_000;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "--no-jit" => jit = false,
            "--machine" => machine = true,
            "-n" => {
                n = match iter.next().map(|v| v.parse()) {
                    Some(Ok(v)) => v,
                    _ => {
                        eprintln!("error: -n requires an integer");
                        return ExitCode::FAILURE;
                    }
                };
            }
            other => {
                eprintln!("error: unknown argument '{other}'");
                eprintln!("usage: riff [-v] [--no-jit] [--machine] [-n iterations]");
                return ExitCode::FAILURE;
            }
        }
    }

    let mut config = if jit { JitConfig::default() } else { JitConfig::disabled() };
    if machine {
        config.backend = Backend::MachineCode;
    }

    let start = Instant::now();
    let result = if verbose {
        let mut thread = Thread::with_tracer(config, StderrTracer::default());
        let program = sum_loop(&mut thread, n);
        let global = thread.global_env();
        thread.eval(program, global)
    } else {
        let mut thread = Thread::new(config);
        let program = sum_loop(&mut thread, n);
        let global = thread.global_env();
        thread.eval(program, global)
    };
    let elapsed = start.elapsed();

    match result {
        Ok(value) => {
            // the threads above print through deparse-compatible text
            println!("{}", render(&value));
            eprintln!("elapsed: {elapsed:?}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Integer(v) if v.len() == 1 => v[0].to_string(),
        Value::Double(v) if v.len() == 1 => v[0].to_string(),
        other => format!("{other:?}"),
    }
}

/// `s <- 0; for (i in 1:n) s <- s + i; s`
fn sum_loop<Tr: riff::JitTracer>(thread: &mut Thread<Tr>, n: i64) -> Rc<Prototype> {
    let s = thread.interns_mut().intern("s");
    let i = thread.interns_mut().intern("i");
    let mut b = ProtoBuilder::new();
    let zero = b.constant(Value::int(0));
    let one = b.constant(Value::int(1));
    let bound = b.constant(Value::int(n));
    let r_seq = b.alloc_regs(2);
    let r_from = b.alloc_reg();
    let r_to = b.alloc_reg();

    b.emit(Opcode::Constant, zero, 0, name(s));
    b.emit(Opcode::Constant, one, 0, reg(r_from));
    b.emit(Opcode::Constant, bound, 0, reg(r_to));
    b.emit(Opcode::Colon, reg(r_from), reg(r_to), reg(r_seq));
    let exit = b.emit_for_begin(name(i), reg(r_seq));
    let body = b.here();
    b.emit(Opcode::Add, name(s), name(i), name(s));
    let back = b.offset_to(body);
    b.emit(Opcode::ForEnd, name(i), reg(r_seq), back);
    b.patch_jump(exit);
    b.emit(Opcode::Ret, name(s), 0, 0);
    b.build()
}
