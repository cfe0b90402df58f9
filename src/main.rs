//! trailguard - main entry point
//!
//! Subcommands:
//! - run: live/paper trading loop with startup reconciliation
//! - status: positions, portfolio metrics, and risk flags from the store
//! - force-exit: admin bookkeeping close of one position
//! - cancel-order: venue-first order cancel (DB-only with --skip-venue)
//! - liquidate: emergency liquidation of every open position

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "trailguard")]
#[command(about = "Spot trading engine with ratcheting trailing stop-limits", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "configs/trailguard.json")]
    config: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading loop
    Run {
        /// Trade against the in-memory simulated venue
        #[arg(long)]
        paper: bool,

        /// Trade against the real venue with real funds
        #[arg(long)]
        live: bool,
    },

    /// Show open positions, portfolio metrics, and risk flags
    Status,

    /// Force-exit a position at a given reference price (bookkeeping close)
    ForceExit {
        /// Position id to close
        position_id: String,

        /// Reference price for the synthetic exit
        #[arg(long)]
        price: String,
    },

    /// Cancel an order (venue first, then locally)
    CancelOrder {
        /// Order id (client order id) to cancel
        order_id: String,

        /// Skip the venue cancel and only terminalize the local row
        #[arg(long)]
        skip_venue: bool,
    },

    /// Emergency-liquidate every open position at current prices
    Liquidate {
        /// Confirm you really mean it
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let file_appender = tracing_appender::rolling::daily("logs", "trailguard.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    match cli.command {
        Commands::Run { paper, live } => commands::run::run(&cli.config, paper, live),
        Commands::Status => commands::status::run(&cli.config),
        Commands::ForceExit { position_id, price } => {
            commands::admin::force_exit(&cli.config, &position_id, &price)
        }
        Commands::CancelOrder {
            order_id,
            skip_venue,
        } => commands::admin::cancel_order(&cli.config, &order_id, skip_venue),
        Commands::Liquidate { yes } => commands::admin::liquidate(&cli.config, yes),
    }
}
