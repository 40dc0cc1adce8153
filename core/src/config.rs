//! Command line parsing and estimator tuning.
//!
//! [`parse_args`] turns an argument list into a [`Command`] without printing anything or exiting
//! the process, so the binary decides how to report help, version and usage errors. Estimator
//! tuning lives in an optional [`Tuning`] file whose format (TOML or JSON) is chosen by its
//! extension.

use std::ffi::OsString;
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use clap::error::{ContextKind, ErrorKind};
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::Estimator;
use crate::kalman::{KalmanConfig, KalmanFilter};
use crate::madgwick::{MadgwickConfig, MadgwickFilter};
use crate::sim::InvalidFixPolicy;

const LONG_ABOUT: &str = "RECKON: offline dead-reckoning analysis for recorded sensor logs.

Replays a CSV log of accelerometer, gyroscope, magnetometer and GNSS readings through one of two
estimators and reports the trajectory in a local East-North-Up frame anchored at the first valid
fix.

- Madgwick (-m, default): attitude from gradient descent fusion of the inertial and magnetic
  readings, position followed from GNSS fixes.
- Kalman (-k): position and velocity driven by the inertial readings and corrected by GNSS fixes.

Estimator tuning can be loaded from a TOML or JSON file with --tuning.";

/// Errors produced while parsing the command line
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("missing value for option '{0}'")]
    MissingValue(String),

    #[error("no input file given (use -f FILE)")]
    MissingInput,

    #[error("{0}")]
    Invalid(String),
}

/// Errors produced while loading a tuning file
#[derive(Error, Debug)]
pub enum TuningError {
    #[error("cannot read tuning file: {0}")]
    Io(#[from] io::Error),

    #[error("invalid TOML tuning file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON tuning file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported tuning file extension for '{0}' (expected .toml or .json)")]
    UnsupportedFormat(String),
}

/// Which estimator the replay uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterKind {
    #[default]
    Madgwick,
    Kalman,
}
impl Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKind::Madgwick => write!(f, "Madgwick"),
            FilterKind::Kalman => write!(f, "Kalman"),
        }
    }
}
impl FilterKind {
    /// Construct the selected estimator with its section of `tuning`
    pub fn build(&self, tuning: &Tuning) -> Box<dyn Estimator> {
        match self {
            FilterKind::Madgwick => Box::new(MadgwickFilter::new(tuning.madgwick)),
            FilterKind::Kalman => Box::new(KalmanFilter::new(tuning.kalman)),
        }
    }
}

/// Tuning for every estimator. Sections or fields missing from a file keep their defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub madgwick: MadgwickConfig,
    pub kalman: KalmanConfig,
}
impl Tuning {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, TuningError> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        Ok(toml::from_str(&s)?)
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, TuningError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
    /// Read a tuning file, choosing the format by extension (.toml/.json)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TuningError> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("toml") => Self::from_toml(p),
            Some("json") => Self::from_json(p),
            _ => Err(TuningError::UnsupportedFormat(p.display().to_string())),
        }
    }
}

/// Everything a replay run needs
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub filter: FilterKind,
    pub tuning_file: Option<PathBuf>,
    pub invalid_fix: InvalidFixPolicy,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}
impl Config {
    /// Configuration for `input` with every option at its default
    pub fn new<P: Into<PathBuf>>(input: P) -> Config {
        Config {
            input: input.into(),
            output: None,
            filter: FilterKind::default(),
            tuning_file: None,
            invalid_fix: InvalidFixPolicy::default(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
    /// Multi-line description of the run, one setting per line
    pub fn summary(&self) -> String {
        let output = match &self.output {
            Some(path) => path.display().to_string(),
            None => "None".to_string(),
        };
        let tuning = match &self.tuning_file {
            Some(path) => path.display().to_string(),
            None => "defaults".to_string(),
        };
        format!(
            "Filter: {}\nInput  file: {}\nOutput file: {}\nTuning: {}\nInvalid fixes: {}",
            self.filter,
            self.input.display(),
            output,
            tuning,
            self.invalid_fix
        )
    }
    /// Tuning from `tuning_file`, or the defaults when none was given
    pub fn tuning(&self) -> Result<Tuning, TuningError> {
        match &self.tuning_file {
            Some(path) => Tuning::from_file(path),
            None => Ok(Tuning::default()),
        }
    }
    pub fn build_estimator(&self) -> Result<Box<dyn Estimator>, TuningError> {
        Ok(self.filter.build(&self.tuning()?))
    }
}

/// Outcome of parsing the command line
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Run(Config),
    /// Rendered help text
    Help(String),
    /// Rendered version line
    Version(String),
}

#[derive(Parser, Debug)]
#[command(
    name = "reckon",
    version,
    about = "Offline dead-reckoning analysis for recorded sensor logs.",
    long_about = LONG_ABOUT,
    disable_version_flag = true
)]
struct Cli {
    /// Input sensor log (CSV)
    #[arg(short, long, value_name = "FILE", required = true)]
    file: PathBuf,

    /// Use the Madgwick attitude estimator (default)
    #[arg(short = 'm', long, overrides_with = "kalman")]
    madgwick: bool,

    /// Use the Kalman state estimator
    #[arg(short = 'k', long, overrides_with = "madgwick")]
    kalman: bool,

    /// Write the trajectory to this CSV file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Estimator tuning file (TOML or JSON)
    #[arg(long, value_name = "FILE")]
    tuning: Option<PathBuf>,

    /// What to do with GNSS fixes that fail validation
    #[arg(long, value_enum, default_value_t = InvalidFixPolicy::Skip)]
    on_invalid_fix: InvalidFixPolicy,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info",
          value_parser = ["off", "error", "warn", "info", "debug", "trace"])]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}
impl From<Cli> for Config {
    fn from(cli: Cli) -> Config {
        Config {
            input: cli.file,
            output: cli.output,
            filter: if cli.kalman {
                FilterKind::Kalman
            } else {
                FilterKind::Madgwick
            },
            tuning_file: cli.tuning,
            invalid_fix: cli.on_invalid_fix,
            log_level: cli.log_level,
            log_file: cli.log_file,
        }
    }
}

fn context(error: &clap::Error, kind: ContextKind) -> String {
    error
        .get(kind)
        .map(|value| value.to_string())
        .unwrap_or_default()
}

/// Parse a full argument list (program name first).
///
/// Help and version requests are successful outcomes carrying the text to print.
pub fn parse_args<I, T>(args: I) -> Result<Command, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(Command::Run(cli.into())),
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                Ok(Command::Help(error.to_string()))
            }
            ErrorKind::DisplayVersion => Ok(Command::Version(error.to_string())),
            ErrorKind::UnknownArgument => Err(ConfigError::UnknownOption(context(
                &error,
                ContextKind::InvalidArg,
            ))),
            ErrorKind::NoEquals => Err(ConfigError::MissingValue(context(
                &error,
                ContextKind::InvalidArg,
            ))),
            ErrorKind::InvalidValue if context(&error, ContextKind::InvalidValue).is_empty() => {
                Err(ConfigError::MissingValue(context(
                    &error,
                    ContextKind::InvalidArg,
                )))
            }
            ErrorKind::MissingRequiredArgument => Err(ConfigError::MissingInput),
            _ => Err(ConfigError::Invalid(error.to_string().trim().to_string())),
        },
    }
}
