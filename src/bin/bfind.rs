#![deny(unsafe_code)]

use mimalloc::MiMalloc;

/// High-throughput allocator; directory scans are allocation-heavy.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    bfind_cli::run(env::args_os())
}
