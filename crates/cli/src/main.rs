use std::process::ExitCode;

fn main() -> ExitCode {
    dbi_cli::run()
}
