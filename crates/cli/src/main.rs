use std::process::ExitCode;

fn main() -> ExitCode {
    noteflow_cli::run()
}
