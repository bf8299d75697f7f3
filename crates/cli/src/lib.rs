#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Thin command-line frontend for the `bfind` binary.
//!
//! This crate turns `argv` into a [`bfind_eval::Context`] — paths,
//! traversal options, and the compiled expression tree — and hands it to
//! the evaluator. The grammar is `find`'s: flags first, then starting
//! paths, then an expression made of tests, actions, and operators in
//! argument position. That order-sensitive operator language is parsed by
//! hand in [`parser`].

mod parser;

pub use parser::{parse_args, ParseError};

use std::ffi::OsString;
use std::process::ExitCode;

use bfind_eval::{evaluate, DebugFlags, OutFile};
use tracing::debug;

/// Clamps an evaluator status into a process [`ExitCode`].
#[must_use]
pub fn exit_code_from(status: i32) -> ExitCode {
    ExitCode::from(status.clamp(0, 255) as u8)
}

/// Parses `args` (including `argv[0]`) and runs the search.
pub fn run<I>(args: I) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
{
    let args: Vec<String> = args
        .into_iter()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    debug!(argc = args.len(), "parsing command line");

    match parse_args(&args, OutFile::stdout(), OutFile::stderr()) {
        Ok(ctx) => {
            if ctx.debug.contains(DebugFlags::TREE) {
                eprint!("{}", ctx.expr.dump(false));
            }
            exit_code_from(evaluate(&ctx))
        }
        Err(error) => {
            eprintln!("bfind: {error}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::exit_code_from;
    use std::process::ExitCode;

    #[test]
    fn exit_code_clamps_negative_statuses() {
        assert_eq!(exit_code_from(-3), ExitCode::from(0));
    }

    #[test]
    fn exit_code_clamps_large_statuses() {
        assert_eq!(exit_code_from(1000), ExitCode::from(255));
    }

    #[test]
    fn exit_code_passes_small_statuses_through() {
        assert_eq!(exit_code_from(7), ExitCode::from(7));
    }
}
