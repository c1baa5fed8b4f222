//! Command line front end for the submission intake

#![warn(missing_docs, non_ascii_idents, trivial_numeric_casts,
    noop_method_call, single_use_lifetimes, trivial_casts,
    unused_lifetimes, nonstandard_style, variant_size_differences)]
#![deny(keyword_idents)]
#![allow(clippy::needless_return)]

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use log::{error, info};

use submission_intake::config::load_configuration;
use submission_intake::logging::configure_logging;
use submission_intake::timestamp::parse_time;
use submission_intake::{Intake, SubmitRequest};

#[derive(Debug, Parser)]
#[command(name="submission-intake")]
#[command(bin_name="submission-intake")]
struct Args {
    /// Storer configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Store a new submission and queue it for testing
    Submit {
        #[arg(long)]
        course: String,
        #[arg(long)]
        assignment: String,
        #[arg(long)]
        account: String,
        /// Uploaded zip, or the reference file of a large assignment
        #[arg(long)]
        archive: PathBuf,
        /// Who is uploading, when not the account holder
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        skip_rate_check: bool,
        /// Back-date the upload, formatted as `YYYY-MM-DD HH:MM:SS`
        #[arg(long, value_parser = parse_upload_time)]
        upload_time: Option<NaiveDateTime>,
    },
    /// Queue a stored large submission for evaluation
    EvaluateLarge {
        #[arg(long)]
        course: String,
        #[arg(long)]
        assignment: String,
        #[arg(long)]
        account: String,
        #[arg(long)]
        reference: PathBuf,
    },
    /// Send the current submission to be tested again
    Queue {
        #[arg(long)]
        course: String,
        #[arg(long)]
        assignment: String,
        #[arg(long)]
        account: String,
    },
    /// Retry delivery of a bundle kept after a failed dispatch
    Redispatch {
        #[arg(long)]
        course: String,
        #[arg(long)]
        assignment: String,
        #[arg(long)]
        bundle: PathBuf,
    },
}

fn parse_upload_time(value: &str) -> Result<NaiveDateTime, String> {
    parse_time(value).map_err(|err| format!("expected YYYY-MM-DD HH:MM:SS: {err}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load CLI
    let args = Args::parse();

    // Load configuration
    let config = match load_configuration(args.config).await {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Could not load configuration: {err:#}");
            return ExitCode::FAILURE
        }
    };

    // the object returned here owns the log processing internals
    // and needs to be held until the program ends
    let _log_manager = match configure_logging(&config.logging) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("Could not configure logging: {err:#}");
            return ExitCode::FAILURE
        }
    };

    let intake = match Intake::from_config(&config).await {
        Ok(intake) => intake,
        Err(err) => {
            error!("Startup error: {err}");
            return ExitCode::from(err.exit_code())
        }
    };

    let result = match args.command {
        Commands::Submit { course, assignment, account, archive, user, skip_rate_check, upload_time } => {
            let request = SubmitRequest { archive, course, assignment, account, submitting_user: user, skip_rate_check, upload_time };
            intake.submit(request).await.map(|record| {
                info!("Accepted {} for {} at {}", record.assignment, record.account, record.results_dest.to_string_lossy());
            })
        }
        Commands::EvaluateLarge { course, assignment, account, reference } => {
            intake.evaluate_large_submission(&reference, &course, &assignment, &account).await
        }
        Commands::Queue { course, assignment, account } => {
            intake.queue_for_testing(&course, &assignment, &account).await
        }
        Commands::Redispatch { course, assignment, bundle } => {
            intake.redispatch(&bundle, &course, &assignment).await
        }
    };

    // user errors are reported to the user, everything else is ours to log
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            if err.is_user_error() {
                eprintln!("{err}");
            } else {
                error!("{:#}", anyhow::Error::from(err));
            }
            ExitCode::from(code)
        },
    }
}
