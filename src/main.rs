mod cli;
mod core;
mod platform;
mod util;

use std::process;

fn main() {
    // Logs go to stderr; stdout is reserved for the run report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::parse();

    match cli::commands::dispatch(args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("jailrun: {e:#}");
            process::exit(1);
        }
    }
}
