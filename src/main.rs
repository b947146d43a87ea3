use cgrulesd::{
    cgred::{self, ExitCode, LogSink},
    cli,
};

fn main() {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    // Log to stderr until the configured destination is opened
    let sink = LogSink::stderr();
    if let Err(err) = cgrulesd::init_logger(Some(options.log_level()), sink.clone()) {
        eprintln!("Failed to initialize the logger: {err}");
    }

    let code = match cgred::run(&options, sink.clone()) {
        Ok(()) => ExitCode::Success,
        Err(err) => {
            let code = err.exit_code();
            cli::report_error(&anyhow::Error::new(err));
            code
        }
    };

    if let Err(err) = sink.close() {
        eprintln!("Failed to flush the log: {err}");
    }
    std::process::exit(code as i32);
}
