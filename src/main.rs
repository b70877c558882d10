//! Siemply - rolling Splunk operations over SSH
//!
//! This is the main entry point for the Siemply CLI.

mod cli;

use anyhow::Result;
use cli::commands::CommandContext;
use cli::{Cli, Commands, LogFormat};
use siemply::config::{Config, LoggingConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(78);
        }
    };

    init_logging(cli.verbosity(), cli.log_format, &config.logging);
    tracing::debug!(version = siemply::version(), "siemply starting");

    let mut ctx = CommandContext::new(&cli, config);
    let code = match dispatch(&cli, &mut ctx).await {
        Ok(code) => code,
        Err(e) => {
            ctx.output.error(&format!("{:#}", e));
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: &Cli, ctx: &mut CommandContext) -> Result<i32> {
    match &cli.command {
        Commands::Run(args) => args.execute(ctx, false).await,
        Commands::Check(args) => args.execute(ctx, true).await,
        Commands::Validate(args) => args.execute(ctx).await,
        Commands::ListHosts(args) => args.execute(ctx).await,
    }
}

/// Library errors carry their own exit code; anything else is a plain failure
fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<siemply::error::Error>()
        .map_or(1, siemply::error::Error::exit_code)
}

/// Initialize logging. `RUST_LOG` wins over `-v`, which wins over the config.
fn init_logging(verbosity: u8, format: Option<LogFormat>, logging: &LoggingConfig) {
    let level = match verbosity {
        0 => logging.level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let json = match format {
        Some(format) => format == LogFormat::Json,
        None => logging.format.eq_ignore_ascii_case("json"),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(verbosity >= 3)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
