use std::process::ExitCode;

fn main() -> ExitCode {
    bootforge::cli::main()
}
