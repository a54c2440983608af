use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;

use indra::cli::{Cli, run};
use indra::logging::{default_log_file, init_logging};

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = match cli.level() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };
    let log_file = cli
        .log_file
        .clone()
        .unwrap_or_else(|| default_log_file(Utc::now().date_naive()));
    if let Err(e) = init_logging(level, &log_file) {
        eprintln!("{e}");
        return ExitCode::from(e.exit_code());
    }

    ExitCode::from(run(&cli))
}
