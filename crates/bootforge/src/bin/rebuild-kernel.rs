use std::process::ExitCode;

fn main() -> ExitCode {
    bootforge::cli::rebuild_main("kernel")
}
