//! RECKON: replay a recorded sensor log through a navigation estimator.
//!
//! ```text
//! reckon -f FILE [-m | -k] [-o FILE] [--tuning FILE] [--on-invalid-fix skip|abort]
//!        [--log-level LEVEL] [--log-file FILE]
//! ```
//!
//! Exit status is 0 on success, 2 for command line errors and 1 when the run fails.

use std::error::Error;
use std::process::ExitCode;

use log::{error, info};

use reckon::config::{Command, Config, parse_args};
use reckon::logging::init_logger;
use reckon::sim::{load_samples, replay};

const USAGE: &str = "Usage: reckon -f FILE [-m | -k] [-o FILE] [--tuning FILE] \
                     [--on-invalid-fix skip|abort] [--log-level LEVEL] [--log-file FILE]\n\
                     Try 'reckon --help' for more information.";

fn run(config: &Config) -> Result<(), Box<dyn Error>> {
    for line in config.summary().lines() {
        info!("{}", line);
    }
    let mut estimator = config.build_estimator()?;
    let samples = load_samples(&config.input)?;
    info!("Loaded {} samples from {}", samples.len(), config.input.display());

    let (result, summary) = replay(&samples, estimator.as_mut(), config.invalid_fix)?;
    if let Some(output) = &config.output {
        result.to_csv(output)?;
        info!("Wrote {} records to {}", result.records.len(), output.display());
    }
    println!("{}", config.summary());
    println!("{}: {}", result.name, summary);
    Ok(())
}

fn main() -> ExitCode {
    let config = match parse_args(std::env::args_os()) {
        Ok(Command::Run(config)) => config,
        Ok(Command::Help(text)) | Ok(Command::Version(text)) => {
            print!("{}", text);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("reckon: {}", e);
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = init_logger(&config.log_level, config.log_file.as_ref()) {
        eprintln!("reckon: failed to initialize logger: {}", e);
        return ExitCode::from(1);
    }
    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}
