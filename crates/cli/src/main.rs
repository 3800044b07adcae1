use std::process::ExitCode;

fn main() -> ExitCode {
    demandplan_cli::run()
}
