//! Council CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid payload or arguments
//! - 3: Not signed in, or not allowed
//! - 4: Not found
//! - 5: Rate limited

use std::process::ExitCode;

use clap::Parser;
use council_chat::ChatError;
use council_core::{CoreError, ErrorCode};
use council_guard::GuardError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const UNAUTHORIZED: u8 = 3;
    pub const NOT_FOUND: u8 = 4;
    pub const RATE_LIMITED: u8 = 5;
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "council=debug" } else { "council=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", default_level)));

    let registry = tracing_subscriber::registry().with(filter);
    // A subscriber may already be installed; keep it.
    let _ = if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.global.verbose, cli.global.json_logs);

    let result = match cli.command {
        Commands::Serve(args) => commands::serve::execute(&cli.global, args).await,
        Commands::Advisor(args) => commands::advisor::execute(&cli.global, args).await,
        Commands::Conversation(args) => commands::conversation::execute(&cli.global, args).await,
        Commands::Mentions(args) => commands::chat::mentions(&cli.global, args).await,
        Commands::Chat(args) => commands::chat::execute(&cli.global, args).await,
        Commands::Memory(args) => commands::memory::execute(&cli.global, args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Map the error's domain code to an exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    let code = if let Some(err) = e.downcast_ref::<ChatError>() {
        err.code()
    } else if let Some(err) = e.downcast_ref::<GuardError>() {
        err.code()
    } else if let Some(err) = e.downcast_ref::<CoreError>() {
        err.code()
    } else {
        return ExitCodes::GENERAL_ERROR;
    };

    match code {
        ErrorCode::InvalidPayload => ExitCodes::INVALID_ARGS,
        ErrorCode::Unauthenticated | ErrorCode::Unauthorized => ExitCodes::UNAUTHORIZED,
        ErrorCode::NotFound => ExitCodes::NOT_FOUND,
        ErrorCode::RateLimited => ExitCodes::RATE_LIMITED,
        _ => ExitCodes::GENERAL_ERROR,
    }
}
