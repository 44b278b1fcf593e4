use std::process::ExitCode;

fn main() -> ExitCode {
    fastgil::run_cli()
}
