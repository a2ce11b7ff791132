#![deny(unsafe_code)]

use std::{env, process::ExitCode};

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    let status = daemon::run(env::args_os());
    daemon::exit_code_from(status)
}
