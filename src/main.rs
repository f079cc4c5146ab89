use std::{env, fs, process};

use lumen::error::InterpretError;
use lumen::reporter::CliReporter;
use lumen::vm::Vm;
use rustyline::error::ReadlineError;
use rustyline::Editor;

fn main() {
    let mut args = env::args().skip(1);
    match args.next() {
        None => run_repl(),
        Some(path) => {
            if args.next().is_some() {
                eprintln!("Usage: lumen [path]");
                process::exit(exitcode::USAGE);
            }
            run_file(&path);
        }
    }
}

fn run_file(path: &str) {
    let bytes = fs::read(path).unwrap_or_else(|err| {
        eprintln!("Could not read file \"{path}\": {err}");
        process::exit(exitcode::IOERR);
    });
    let source = String::from_utf8_lossy(&bytes).into_owned();

    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match vm.interpret(&source, &mut reporter) {
        Ok(()) => process::exit(exitcode::OK),
        Err(InterpretError::Compile(_)) => process::exit(exitcode::DATAERR),
        Err(InterpretError::Runtime(err)) => {
            report_runtime_error(&err);
            process::exit(exitcode::SOFTWARE);
        }
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut rl = Editor::<()>::new().expect("failed to initialize line editor");
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(line.as_str());
                let mut reporter = CliReporter::new();
                if let Err(InterpretError::Runtime(err)) = vm.interpret(&line, &mut reporter) {
                    report_runtime_error(&err);
                }
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!();
                break;
            }
            Err(err) => {
                eprintln!("Readline error: {err}");
                break;
            }
        }
    }
}

fn report_runtime_error(err: &lumen::error::RuntimeError) {
    eprintln!("{}", err.message);
    for frame in &err.trace {
        eprintln!("{frame}");
    }
}
