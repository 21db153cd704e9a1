//! The Cobalt compiler driver.
//!
//! Usage: `cobaltc <input.cb>... [-o out.cbo]`. Compiles the inputs to
//! one bytecode image. Diagnostics go to stderr as
//! `path:line:col: kind: message`; the exit code is nonzero on any
//! error. Set `COBALTC_LOG` (an `env_filter` directive string) for
//! pipeline tracing.

use std::path::PathBuf;
use std::process::ExitCode;

use cobalt::{compile_files, render_diagnostics, SourceFile};

fn main() -> ExitCode {
    if std::env::var_os("COBALTC_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_env("COBALTC_LOG"),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let mut inputs: Vec<PathBuf> = Vec::new();
    let mut output: Option<PathBuf> = None;
    let mut args = std::env::args_os().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-o" {
            match args.next() {
                Some(path) => output = Some(PathBuf::from(path)),
                None => {
                    eprintln!("cobaltc: `-o` needs a path");
                    return ExitCode::FAILURE;
                }
            }
        } else {
            inputs.push(PathBuf::from(arg));
        }
    }

    if inputs.is_empty() {
        eprintln!("usage: cobaltc <input.cb>... [-o out.cbo]");
        return ExitCode::FAILURE;
    }

    let mut files = Vec::new();
    for path in &inputs {
        match std::fs::read_to_string(path) {
            Ok(text) => files.push(SourceFile::new(path.display().to_string(), text)),
            Err(err) => {
                eprintln!("cobaltc: cannot read {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        }
    }

    match compile_files(&files) {
        Ok(bytes) => {
            let out = output.unwrap_or_else(|| inputs[0].with_extension("cbo"));
            if let Err(err) = std::fs::write(&out, bytes) {
                eprintln!("cobaltc: cannot write {}: {err}", out.display());
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(diags) => {
            for line in render_diagnostics(&files, &diags) {
                eprintln!("{line}");
            }
            ExitCode::FAILURE
        }
    }
}
