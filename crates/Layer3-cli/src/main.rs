//! corral CLI - Main entry point

mod commands;

use clap::{Parser, Subcommand};
use corral_dispatch::Lane;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// corral - run sandboxed agents through the dispatch queue
#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file to use instead of the global + project files
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration as JSON
    Config,

    /// Run one agent invocation through the queue, printing each result
    Run {
        /// Dispatch key (conversation / context id)
        #[arg(short, long)]
        key: String,

        /// Lane to run on (message, task)
        #[arg(short, long, default_value = "message")]
        lane: Lane,

        /// Run this shell command locally instead of a container
        #[arg(long)]
        local: Option<String>,

        /// Prompt sent as the first input (read from stdin if omitted)
        #[arg(short, long)]
        prompt: Option<String>,

        /// Session to resume
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Stop containers left behind by a previous run
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        "debug".to_string()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = commands::load_config(args.config.as_deref())?;

    match args.command {
        Command::Config => commands::print_config(&config),
        Command::Run {
            key,
            lane,
            local,
            prompt,
            session,
        } => {
            let prompt = match prompt {
                Some(prompt) => prompt,
                None => commands::read_prompt()?,
            };
            commands::run(
                &config,
                commands::RunArgs {
                    key,
                    lane,
                    local,
                    prompt,
                    session,
                },
            )
            .await
        }
        Command::Cleanup => commands::cleanup(&config).await,
    }
}
